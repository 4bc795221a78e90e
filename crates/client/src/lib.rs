//! # cmdproc Client Library
//!
//! Streams shell commands to a remote execution host over one persistent
//! connection and fans the host's output back out to any number of
//! subscribers.
//!
//! ## Overview
//!
//! - **Connection Multiplexer**: owns the connection, runs the outbound and
//!   inbound pumps, tracks the session state machine
//! - **Broadcast Channels**: lossless command stream, bounded output stream
//! - **Working Directory**: one-shot HTTP request, independent of the pumps
//! - **Console**: line-oriented surface for terminals and pipes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Console                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   Command Channel ──▶ ┌──────────────────────┐ ──▶ /run      │
//! │                       │ ConnectionMultiplexer│               │
//! │   Output Channel  ◀── └──────────────────────┘ ◀── /run      │
//! │                                                              │
//! │   WorkingDirectoryClient ──────────────────────────▶ /pwd    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use client::{Config, ConnectionMultiplexer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let mux = ConnectionMultiplexer::from_config(&config)?;
//!
//!     let mut output = mux.subscribe_output();
//!     mux.connect().await?;
//!     mux.submit_command("ls")?;
//!
//!     // Ends once the session terminates.
//!     while let Some(line) = output.recv().await {
//!         println!("{}", line);
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod multiplexer;
pub mod transport;
pub mod workdir;

pub use channel::{BroadcastChannel, Capacity, Subscription, DEFAULT_OUTPUT_CAPACITY};
pub use config::{default_config_path, Config, ConfigError, EnvOverride};
pub use console::{Console, ConsoleExit, ConsoleOptions, ConsoleSummary, OutputFormat};
pub use error::{ClientError, Result};
pub use multiplexer::{
    ConnectionMultiplexer, HalfClosePolicy, PumpExit, SessionEvent, SessionReport, SessionState,
};
pub use transport::{ConnectionHalves, Connector, FrameSink, FrameSource, WebSocketConnector};
pub use workdir::WorkingDirectoryClient;
