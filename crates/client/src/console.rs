//! Line-oriented console over a [`ConnectionMultiplexer`].
//!
//! Reads commands one per line from any `AsyncBufRead`, prints output lines
//! to any `AsyncWrite` as they arrive. The console keeps no history: every
//! line is written once and forgotten.

use std::time::Duration;

use protocol::{OutputLine, ProtocolError};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::Subscription;
use crate::error::{ClientError, Result};
use crate::multiplexer::{ConnectionMultiplexer, SessionState};

/// How output lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// The line text followed by a newline.
    #[default]
    Plain,
    /// One JSON object per line: `{"line":"..."}`.
    Json,
}

#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    pub format: OutputFormat,
    /// Publish `"{cwd} > {command}"` onto the output channel before each command.
    pub echo_prompt: bool,
    /// Close the command channel when input reaches EOF.
    pub close_on_eof: bool,
    /// Stop once no output has arrived for this long.
    pub idle_timeout: Option<Duration>,
    /// Shown in the prompt until the working directory has been fetched,
    /// and for good if the fetch fails.
    pub fallback_cwd: String,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Plain,
            echo_prompt: true,
            close_on_eof: true,
            idle_timeout: None,
            fallback_cwd: "~".to_string(),
        }
    }
}

/// Why [`Console::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The session terminated and all received output was printed.
    Terminated,
    /// The idle timeout elapsed; the session may still be active.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSummary {
    pub exit: ConsoleExit,
    pub commands_submitted: u64,
    pub lines_printed: u64,
    /// Lines dropped because this console fell behind the output channel.
    pub lines_missed: u64,
}

#[derive(Serialize)]
struct JsonLine<'a> {
    line: &'a str,
}

pub struct Console<'a> {
    mux: &'a ConnectionMultiplexer,
    options: ConsoleOptions,
    cwd: watch::Receiver<Option<String>>,
}

impl<'a> Console<'a> {
    pub fn new(mux: &'a ConnectionMultiplexer, options: ConsoleOptions) -> Self {
        let (_, cwd) = watch::channel(None);
        Self { mux, options, cwd }
    }

    /// Runs until the session terminates or the idle timeout elapses.
    ///
    /// Input EOF alone does not end the run: the console keeps printing
    /// until the remote closes.
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> Result<ConsoleSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = self.mux.subscribe_output();
        let mut state = self.mux.watch_state();
        let mut input = input.lines();
        let mut input_open = true;
        let mut summary = ConsoleSummary {
            exit: ConsoleExit::Terminated,
            commands_submitted: 0,
            lines_printed: 0,
            lines_missed: 0,
        };

        // The prompt never waits on this request.
        let cwd_fetch = self.options.echo_prompt.then(|| self.fetch_working_directory());

        let idle = self.options.idle_timeout;
        let idle_sleep = tokio::time::sleep(idle.unwrap_or_default());
        tokio::pin!(idle_sleep);

        loop {
            let terminated = *state.borrow_and_update() == SessionState::Terminated;
            if terminated {
                break;
            }

            tokio::select! {
                biased;
                line = lines.recv() => {
                    let Some(line) = line else { break };
                    self.render(&mut output, &line).await?;
                    summary.lines_printed += 1;
                    if let Some(idle) = idle {
                        idle_sleep.as_mut().reset(tokio::time::Instant::now() + idle);
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = input.next_line(), if input_open => {
                    match next? {
                        Some(text) => {
                            if !self.submit(text) {
                                break;
                            }
                            summary.commands_submitted += 1;
                        }
                        None => {
                            input_open = false;
                            tracing::debug!("Console input closed");
                            if self.options.close_on_eof {
                                self.mux.close_commands();
                            }
                        }
                    }
                }
                _ = &mut idle_sleep, if idle.is_some() => {
                    summary.exit = ConsoleExit::Idle;
                    break;
                }
            }
        }

        if summary.exit == ConsoleExit::Terminated {
            summary.lines_printed += self.drain(&mut lines, &mut output).await?;
        }
        output.flush().await?;
        summary.lines_missed = lines.missed();
        if let Some(fetch) = cwd_fetch {
            fetch.abort();
        }

        Ok(summary)
    }

    /// Submits one command. Returns false once the session no longer
    /// accepts commands.
    fn submit(&self, text: String) -> bool {
        if text.trim().is_empty() {
            return true;
        }

        if self.options.echo_prompt {
            let prompt = format!("{} > {}", self.working_directory(), text);
            self.mux.output().publish(OutputLine::new(prompt));
        }

        match self.mux.submit_command(text) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Command not submitted");
                false
            }
        }
    }

    /// Starts fetching the remote working directory in the background.
    fn fetch_working_directory(&mut self) -> JoinHandle<()> {
        let (tx, rx) = watch::channel(None);
        self.cwd = rx;
        self.mux.get_working_directory(move |result| {
            if let Ok(body) = result {
                tx.send_replace(Some(body.trim_end_matches(['\n', '\r']).to_string()));
            }
        })
    }

    /// The fetched working directory, or the fallback while it is unknown.
    fn working_directory(&self) -> String {
        self.cwd
            .borrow()
            .clone()
            .unwrap_or_else(|| self.options.fallback_cwd.clone())
    }

    /// Prints whatever output is already queued, without waiting for more.
    async fn drain<W>(&self, lines: &mut Subscription<OutputLine>, output: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut printed = 0;
        loop {
            tokio::select! {
                biased;
                line = lines.recv() => match line {
                    Some(line) => {
                        self.render(output, &line).await?;
                        printed += 1;
                    }
                    None => break,
                },
                _ = std::future::ready(()) => break,
            }
        }
        Ok(printed)
    }

    async fn render<W>(&self, output: &mut W, line: &OutputLine) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut rendered = match self.options.format {
            OutputFormat::Plain => line.as_str().to_string(),
            OutputFormat::Json => serde_json::to_string(&JsonLine {
                line: line.as_str(),
            })
            .map_err(|e| ClientError::Protocol(ProtocolError::from(e)))?,
        };
        rendered.push('\n');

        output.write_all(rendered.as_bytes()).await?;
        output.flush().await?;
        Ok(())
    }
}
