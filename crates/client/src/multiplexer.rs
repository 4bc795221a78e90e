//! Connection multiplexer.
//!
//! Owns the single persistent connection to the remote execution host and
//! moves data across it with two concurrently running pump loops:
//!
//! ```text
//!  submit_command ─▶ Command Channel ─▶ [outbound pump] ─▶ FrameSink ─▶ wire
//!  wire ─▶ FrameSource ─▶ [inbound pump] ─▶ Output Channel ─▶ subscribers
//! ```
//!
//! Each pump owns one half of the split connection, so neither needs a lock.
//! The session is `Terminated` only once both pumps have exited. How one
//! pump's exit affects the other is governed by [`HalfClosePolicy`].
//!
//! State machine: `Idle → Connecting → Active → Terminated`, with
//! `Connecting → Terminated` on handshake failure. `Terminated` is absorbing;
//! there is no reconnect.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use protocol::{decode_output, encode_command, Command, Frame, OutputLine, ProtocolError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::channel::{BroadcastChannel, Subscription, DEFAULT_OUTPUT_CAPACITY};
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::transport::{ConnectionHalves, Connector, FrameSink, FrameSource, WebSocketConnector};
use crate::workdir::WorkingDirectoryClient;

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 64;

/// Upper bound on how long a graceful close of the write half may take.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How the exit of one pump affects the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HalfClosePolicy {
    /// A write failure or a remote close promptly cancels the other pump.
    /// Closing the command channel alone does not; the remote is sent a
    /// close frame and the inbound pump drains until it closes.
    #[default]
    CloseBoth,
    /// Each pump runs until it observes its own termination.
    Independent,
}

impl HalfClosePolicy {
    fn propagates(&self, exit: &PumpExit) -> bool {
        match self {
            HalfClosePolicy::Independent => false,
            HalfClosePolicy::CloseBoth => matches!(
                exit,
                PumpExit::WriteFailed(_) | PumpExit::ReadFailed(_) | PumpExit::RemoteClosed
            ),
        }
    }
}

/// Lifecycle state of a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Constructed, `connect()` not called yet.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Both pumps running (or at least one still draining).
    Active,
    /// Both pumps exited, or the handshake failed. Final.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why a pump loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The command channel was closed (outbound only).
    ChannelClosed,
    /// The remote end closed the connection (inbound only).
    RemoteClosed,
    /// Writing a frame failed.
    WriteFailed(String),
    /// Reading a frame failed.
    ReadFailed(String),
    /// Stopped by shutdown or by the other pump.
    Cancelled,
}

impl PumpExit {
    /// Returns true for exits caused by an I/O failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, PumpExit::WriteFailed(_) | PumpExit::ReadFailed(_))
    }
}

impl fmt::Display for PumpExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PumpExit::ChannelClosed => f.write_str("command channel closed"),
            PumpExit::RemoteClosed => f.write_str("remote closed the connection"),
            PumpExit::WriteFailed(e) => write!(f, "write failed: {}", e),
            PumpExit::ReadFailed(e) => write!(f, "read failed: {}", e),
            PumpExit::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Events published by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Session state changed.
    StateChanged(SessionState),
    /// The handshake failed.
    ConnectFailed { reason: String },
    /// The outbound pump stopped; the session may be degraded.
    OutboundClosed(PumpExit),
    /// The inbound pump stopped; the session may be degraded.
    InboundClosed(PumpExit),
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub outbound: PumpExit,
    pub inbound: PumpExit,
    pub commands_sent: u64,
    pub lines_received: u64,
    pub frames_ignored: u64,
}

#[derive(Debug, Default)]
struct SessionStats {
    commands_sent: AtomicU64,
    lines_received: AtomicU64,
    frames_ignored: AtomicU64,
}

/// State shared between the multiplexer handle and its pump task.
struct Shared {
    session_id: Uuid,
    state_tx: watch::Sender<SessionState>,
    events: BroadcastChannel<SessionEvent>,
    stats: SessionStats,
    report: Mutex<Option<SessionReport>>,
}

impl Shared {
    fn transition(&self, next: SessionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            tracing::info!(session_id = %self.session_id, from = %previous, to = %next, "Session state changed");
            self.events.publish(SessionEvent::StateChanged(next));
        }
    }

    fn set_report(&self, report: SessionReport) {
        *self.report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
    }

    fn report(&self) -> Option<SessionReport> {
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Runs one command session over a persistent connection.
///
/// Commands submitted before [`connect`](Self::connect) are queued and
/// written once the connection is up.
pub struct ConnectionMultiplexer {
    connector: Arc<dyn Connector>,
    workdir: WorkingDirectoryClient,
    commands: BroadcastChannel<Command>,
    output: BroadcastChannel<OutputLine>,
    pending_commands: Mutex<Option<Subscription<Command>>>,
    policy: HalfClosePolicy,
    shutdown: CancellationToken,
    shared: Arc<Shared>,
}

impl ConnectionMultiplexer {
    /// Creates a multiplexer with fresh command and output channels.
    pub fn new(connector: Arc<dyn Connector>, workdir: WorkingDirectoryClient) -> Self {
        Self::with_channels(
            connector,
            workdir,
            BroadcastChannel::unbounded("commands"),
            BroadcastChannel::bounded("output", DEFAULT_OUTPUT_CAPACITY),
        )
    }

    /// Creates a multiplexer over channel handles supplied by the caller.
    pub fn with_channels(
        connector: Arc<dyn Connector>,
        workdir: WorkingDirectoryClient,
        commands: BroadcastChannel<Command>,
        output: BroadcastChannel<OutputLine>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let pending_commands = Mutex::new(Some(commands.subscribe()));

        Self {
            connector,
            workdir,
            commands,
            output,
            pending_commands,
            policy: HalfClosePolicy::default(),
            shutdown: CancellationToken::new(),
            shared: Arc::new(Shared {
                session_id: Uuid::new_v4(),
                state_tx,
                events: BroadcastChannel::bounded("events", EVENT_CAPACITY),
                stats: SessionStats::default(),
                report: Mutex::new(None),
            }),
        }
    }

    /// Builds a WebSocket-backed multiplexer from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = config.endpoint();
        let connector = WebSocketConnector::new(endpoint.run_url()?, config.session.connect_timeout());
        let workdir =
            WorkingDirectoryClient::new(endpoint.pwd_url()?, config.session.request_timeout())?;

        Ok(Self::with_channels(
            Arc::new(connector),
            workdir,
            BroadcastChannel::unbounded("commands"),
            BroadcastChannel::bounded("output", config.channels.output_capacity),
        )
        .with_half_close(config.session.half_close))
    }

    /// Sets the half-close policy. Only meaningful before `connect()`.
    pub fn with_half_close(mut self, policy: HalfClosePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Returns a receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribes to session events published from now on.
    pub fn subscribe_events(&self) -> Subscription<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// The command channel handle.
    pub fn commands(&self) -> &BroadcastChannel<Command> {
        &self.commands
    }

    /// The output channel handle.
    pub fn output(&self) -> &BroadcastChannel<OutputLine> {
        &self.output
    }

    /// Subscribes to output lines received from now on.
    ///
    /// The subscription ends once the session has terminated.
    pub fn subscribe_output(&self) -> Subscription<OutputLine> {
        self.output.subscribe()
    }

    /// Publishes a command for the outbound pump.
    ///
    /// Fails once the session has terminated.
    pub fn submit_command(&self, text: impl Into<String>) -> Result<()> {
        if self.state() == SessionState::Terminated {
            return Err(ClientError::SessionTerminated);
        }
        let command = Command::new(text);
        tracing::debug!(session_id = %self.shared.session_id, command = %command, "Command submitted");
        self.commands.publish(command);
        Ok(())
    }

    /// Signals that no more commands will be submitted.
    ///
    /// The outbound pump finishes the queued commands, then closes the write
    /// half of the connection.
    pub fn close_commands(&self) {
        self.commands.close();
    }

    /// Establishes the connection and starts both pumps in the background.
    ///
    /// Returns once the handshake has completed or failed. A failed handshake
    /// terminates the session; it is never retried.
    pub async fn connect(&self) -> Result<()> {
        let mut observed = SessionState::Idle;
        let claimed = self.shared.state_tx.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Connecting;
                true
            } else {
                observed = *state;
                false
            }
        });
        if !claimed {
            return Err(ClientError::AlreadyStarted(observed));
        }
        tracing::info!(
            session_id = %self.shared.session_id,
            target = %self.connector.target(),
            "Session state changed to connecting"
        );
        self.shared
            .events
            .publish(SessionEvent::StateChanged(SessionState::Connecting));

        let handshake = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ClientError::Cancelled),
            result = self.connector.connect() => result.map_err(ClientError::from),
        };

        let halves = match handshake {
            Ok(halves) => halves,
            Err(e) => {
                tracing::error!(session_id = %self.shared.session_id, error = %e, "Connection failed");
                self.shared.events.publish(SessionEvent::ConnectFailed {
                    reason: e.to_string(),
                });
                self.shared.transition(SessionState::Terminated);
                self.output.close();
                return Err(e);
            }
        };

        let commands = self
            .pending_commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.commands.subscribe());

        self.shared.transition(SessionState::Active);

        let session = PumpSession {
            shared: Arc::clone(&self.shared),
            output: self.output.clone(),
            policy: self.policy,
            cancel: self.shutdown.child_token(),
        };
        let span = tracing::info_span!("session", session_id = %self.shared.session_id);
        tokio::spawn(session.run(halves, commands).instrument(span));

        Ok(())
    }

    /// Spawns [`connect`](Self::connect) so the caller does not wait for the
    /// handshake.
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.connect().await })
    }

    /// Stops both pumps and releases the connection.
    ///
    /// Safe to call in any state. An idle multiplexer moves straight to
    /// `Terminated`.
    pub fn shutdown(&self) {
        tracing::debug!(session_id = %self.shared.session_id, "Shutdown requested");
        self.shutdown.cancel();
        let was_idle = self.shared.state_tx.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Terminated;
                true
            } else {
                false
            }
        });
        if was_idle {
            self.shared
                .events
                .publish(SessionEvent::StateChanged(SessionState::Terminated));
            self.output.close();
        }
    }

    /// Waits until the session is `Terminated`.
    ///
    /// Returns the report of the finished session, or
    /// [`ClientError::SessionTerminated`] if it never became active.
    /// On an idle multiplexer this waits until someone connects and the
    /// session ends.
    pub async fn wait(&self) -> Result<SessionReport> {
        let mut state = self.watch_state();
        state
            .wait_for(|s| *s == SessionState::Terminated)
            .await
            .map_err(|_| ClientError::SessionTerminated)?;
        self.shared.report().ok_or(ClientError::SessionTerminated)
    }

    /// Fetches the remote working directory.
    ///
    /// Independent of the pumps: a failure here never affects them.
    pub async fn working_directory(&self) -> Result<String> {
        Ok(self.workdir.fetch().await?)
    }

    /// Fetches the remote working directory in the background and hands the
    /// result to `callback`.
    pub fn get_working_directory<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        let workdir = self.workdir.clone();
        tokio::spawn(async move {
            let result = workdir.fetch().await.map_err(ClientError::from);
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Working directory request failed");
            }
            callback(result);
        })
    }
}

impl Drop for ConnectionMultiplexer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Everything the pump task needs, detached from the multiplexer handle.
struct PumpSession {
    shared: Arc<Shared>,
    output: BroadcastChannel<OutputLine>,
    policy: HalfClosePolicy,
    cancel: CancellationToken,
}

impl PumpSession {
    async fn run(self, halves: ConnectionHalves, commands: Subscription<Command>) {
        let ConnectionHalves { sink, source } = halves;

        let outbound = async {
            let exit = pump_outbound(commands, sink, &self.cancel, &self.shared.stats).await;
            self.after_exit(SessionEvent::OutboundClosed(exit.clone()), &exit);
            exit
        };
        let inbound = async {
            let exit = pump_inbound(source, &self.output, &self.cancel, &self.shared.stats).await;
            self.after_exit(SessionEvent::InboundClosed(exit.clone()), &exit);
            exit
        };

        let (outbound, inbound) = tokio::join!(outbound, inbound);

        let stats = &self.shared.stats;
        let report = SessionReport {
            session_id: self.shared.session_id,
            outbound,
            inbound,
            commands_sent: stats.commands_sent.load(Ordering::Relaxed),
            lines_received: stats.lines_received.load(Ordering::Relaxed),
            frames_ignored: stats.frames_ignored.load(Ordering::Relaxed),
        };
        tracing::info!(
            outbound = %report.outbound,
            inbound = %report.inbound,
            commands_sent = report.commands_sent,
            lines_received = report.lines_received,
            "Session finished"
        );

        // Subscribers drain what is buffered, then see the end of the stream.
        self.output.close();
        self.shared.set_report(report);
        self.shared.transition(SessionState::Terminated);
    }

    fn after_exit(&self, event: SessionEvent, exit: &PumpExit) {
        if exit.is_failure() {
            tracing::warn!(reason = %exit, "Pump stopped, session degraded");
        } else {
            tracing::debug!(reason = %exit, "Pump stopped");
        }
        self.shared.events.publish(event);

        if self.policy.propagates(exit) && !self.cancel.is_cancelled() {
            tracing::debug!("Cancelling the other pump");
            self.cancel.cancel();
        }
    }
}

/// Moves commands onto the wire, one text frame each, in arrival order.
async fn pump_outbound(
    mut commands: Subscription<Command>,
    mut sink: Box<dyn FrameSink>,
    cancel: &CancellationToken,
    stats: &SessionStats,
) -> PumpExit {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                close_sink(sink.as_mut()).await;
                return PumpExit::Cancelled;
            }
            next = commands.recv() => next,
        };

        let Some(command) = next else {
            tracing::debug!("Command channel closed, closing write half");
            close_sink(sink.as_mut()).await;
            return PumpExit::ChannelClosed;
        };

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                close_sink(sink.as_mut()).await;
                return PumpExit::Cancelled;
            }
            sent = sink.send(encode_command(&command)) => sent,
        };

        if let Err(e) = sent {
            tracing::error!(error = %e, "Failed to send command");
            return PumpExit::WriteFailed(e.to_string());
        }
        stats.commands_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(command = %command, "Command sent");
    }
}

async fn close_sink(sink: &mut dyn FrameSink) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "Closing write half failed"),
        Err(_) => tracing::debug!("Closing write half timed out"),
    }
}

/// Moves decoded text frames onto the output channel in arrival order.
async fn pump_inbound(
    mut source: Box<dyn FrameSource>,
    output: &BroadcastChannel<OutputLine>,
    cancel: &CancellationToken,
    stats: &SessionStats,
) -> PumpExit {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            next = source.next_frame() => next,
        };

        let frame = match next {
            None | Some(Ok(Frame::Close)) => {
                tracing::debug!("Remote closed the connection");
                return PumpExit::RemoteClosed;
            }
            Some(Err(ProtocolError::ConnectionClosed(reason))) => {
                tracing::debug!(%reason, "Connection closed while reading");
                return PumpExit::RemoteClosed;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to read frame");
                return PumpExit::ReadFailed(e.to_string());
            }
            Some(Ok(frame)) => frame,
        };

        let kind = frame.kind();
        match decode_output(frame) {
            Some(line) => {
                stats.lines_received.fetch_add(1, Ordering::Relaxed);
                output.publish(line);
            }
            None => {
                stats.frames_ignored.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(kind, "Ignoring non-text frame");
            }
        }
    }
}
