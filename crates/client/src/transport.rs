//! Transport seam for the persistent command connection.
//!
//! The multiplexer only sees the two halves of a connection: a
//! [`FrameSink`] it writes commands into and a [`FrameSource`] it reads
//! output from. [`Connector`] produces both halves from a single handshake.
//! [`WebSocketConnector`] is the production implementation; tests plug in
//! in-memory connectors.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::error::{ProtocolError, Result};
use protocol::Frame;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

/// Boxed future returned by the transport traits.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Write half of a connection.
pub trait FrameSink: Send {
    /// Writes one frame.
    fn send(&mut self, frame: Frame) -> TransportFuture<'_, Result<()>>;

    /// Starts a graceful close of the connection from our side.
    fn close(&mut self) -> TransportFuture<'_, Result<()>>;
}

/// Read half of a connection.
pub trait FrameSource: Send {
    /// Waits for the next frame. `None` means the stream has ended.
    fn next_frame(&mut self) -> TransportFuture<'_, Option<Result<Frame>>>;
}

/// Both halves of an established connection.
pub struct ConnectionHalves {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Establishes connections to the remote execution host.
pub trait Connector: Send + Sync {
    /// Performs the handshake and returns the split connection.
    fn connect(&self) -> TransportFuture<'_, Result<ConnectionHalves>>;

    /// Human-readable target, used in logs.
    fn target(&self) -> String;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector for the `/run` endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Creates a connector for the given `ws://` or `wss://` URL.
    pub fn new(url: Url, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> TransportFuture<'_, Result<ConnectionHalves>> {
        Box::pin(async move {
            tracing::info!("Connecting to {}", self.url);

            let (ws_stream, response) =
                tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                    .await
                    .map_err(|_| {
                        ProtocolError::Timeout(format!(
                            "connecting to {} took longer than {:?}",
                            self.url, self.connect_timeout
                        ))
                    })?
                    .map_err(handshake_error)?;

            tracing::debug!(status = %response.status(), "WebSocket handshake complete");

            let (sink, stream) = ws_stream.split();
            Ok(ConnectionHalves {
                sink: Box::new(WebSocketSink { sink }),
                source: Box::new(WebSocketSource { stream }),
            })
        })
    }

    fn target(&self) -> String {
        self.url.to_string()
    }
}

fn handshake_error(err: WsError) -> ProtocolError {
    match err {
        WsError::Io(io_err) => ProtocolError::HandshakeFailed(io_err.to_string()),
        other => ProtocolError::HandshakeFailed(format!("WebSocket connection failed: {}", other)),
    }
}

struct WebSocketSink {
    sink: SplitSink<WsStream, WsMessage>,
}

impl FrameSink for WebSocketSink {
    fn send(&mut self, frame: Frame) -> TransportFuture<'_, Result<()>> {
        Box::pin(async move {
            let message = match frame {
                Frame::Text(text) => WsMessage::Text(text),
                Frame::Binary(data) => WsMessage::Binary(data),
                Frame::Control => WsMessage::Ping(Vec::new()),
                Frame::Close => WsMessage::Close(None),
            };
            self.sink
                .send(message)
                .await
                .map_err(|e| ProtocolError::SendFailed(e.to_string()))
        })
    }

    fn close(&mut self) -> TransportFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.sink.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(ProtocolError::SendFailed(e.to_string())),
            }
        })
    }
}

struct WebSocketSource {
    stream: SplitStream<WsStream>,
}

impl FrameSource for WebSocketSource {
    fn next_frame(&mut self) -> TransportFuture<'_, Option<Result<Frame>>> {
        Box::pin(async move {
            let message = self.stream.next().await?;
            Some(match message {
                Ok(WsMessage::Text(text)) => Ok(Frame::Text(text)),
                Ok(WsMessage::Binary(data)) => Ok(Frame::Binary(data)),
                Ok(WsMessage::Close(_)) => Ok(Frame::Close),
                // Ping, pong and raw frames; tungstenite answers pings itself.
                Ok(_) => Ok(Frame::Control),
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                    Err(ProtocolError::ConnectionClosed("connection closed".to_string()))
                }
                Err(WsError::Io(io_err)) => Err(ProtocolError::from(io_err)),
                Err(e) => Err(ProtocolError::ReceiveFailed(format!("WebSocket error: {}", e))),
            })
        })
    }
}
