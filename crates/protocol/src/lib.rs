//! # cmdproc Protocol Library
//!
//! Wire vocabulary shared by the cmdproc client: the values that flow through
//! the command and output streams, the frame model of the persistent
//! connection, and endpoint addressing for the remote execution host.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Command / OutputLine             │  opaque strings
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  one value per text frame
//! ├─────────────────────────────────────────┤
//! │   Endpoint (ws(s)://host:port/run,      │
//! │             http(s)://host:port/pwd)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_output, encode_command, Command, Endpoint, Frame, Scheme};
//!
//! let endpoint = Endpoint::new(Scheme::Http, "127.0.0.1", 8000);
//! assert_eq!(endpoint.run_url().unwrap().as_str(), "ws://127.0.0.1:8000/run");
//!
//! let frame = encode_command(&Command::new("ls"));
//! assert_eq!(frame, Frame::Text("ls".to_string()));
//!
//! let line = decode_output(Frame::Text("a.txt\n".to_string())).unwrap();
//! assert_eq!(line.as_str(), "a.txt");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: `Command` and `OutputLine`
//! - [`framing`]: frame model and encode/decode
//! - [`endpoint`]: host addressing
//! - [`error`]: error types

pub mod endpoint;
pub mod error;
pub mod framing;
pub mod messages;

pub use endpoint::{Endpoint, Scheme, PWD_PATH, RUN_PATH};
pub use error::{ProtocolError, Result};
pub use framing::{decode_output, encode_command, strip_line_terminator, Frame, LINE_TERMINATOR};
pub use messages::{Command, OutputLine};
