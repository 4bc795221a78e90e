//! Frame vocabulary for the persistent command connection.
//!
//! Every command travels as exactly one text frame and every output line
//! arrives as exactly one text frame. The remote host owns line segmentation;
//! this layer never splits or joins payloads. The only transformation applied
//! on the inbound side is stripping a single trailing line terminator.
//!
//! ```text
//! outbound:  Command("ls")        -> Frame::Text("ls")
//! inbound:   Frame::Text("a\n")   -> Some(OutputLine("a"))
//!            Frame::Text("a\n\n") -> Some(OutputLine("a\n"))
//!            Frame::Binary(..)    -> None
//! ```

use crate::messages::{Command, OutputLine};

/// Line terminator stripped from the end of inbound text payloads.
pub const LINE_TERMINATOR: char = '\n';

/// A single message unit on the persistent connection.
///
/// This is independent of the concrete transport; the client maps its
/// WebSocket messages onto these variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(String),
    /// Opaque binary payload.
    Binary(Vec<u8>),
    /// Transport-level control traffic (ping, pong, raw frames).
    Control,
    /// The remote end announced it is closing the connection.
    Close,
}

impl Frame {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Control => "control",
            Frame::Close => "close",
        }
    }
}

/// Encodes a command as the text frame written to the wire.
pub fn encode_command(command: &Command) -> Frame {
    Frame::Text(command.as_str().to_string())
}

/// Decodes an inbound frame into an output line.
///
/// Returns `None` for anything that is not a text frame; those frames are
/// not forwarded and are not errors.
pub fn decode_output(frame: Frame) -> Option<OutputLine> {
    match frame {
        Frame::Text(text) => Some(OutputLine::new(strip_line_terminator(text))),
        _ => None,
    }
}

/// Removes at most one trailing [`LINE_TERMINATOR`].
pub fn strip_line_terminator(mut text: String) -> String {
    if text.ends_with(LINE_TERMINATOR) {
        text.pop();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_is_single_text_frame() {
        let frame = encode_command(&Command::new("ls"));
        assert_eq!(frame, Frame::Text("ls".to_string()));
    }

    #[test]
    fn test_encode_keeps_embedded_newlines() {
        let frame = encode_command(&Command::new("echo a\necho b"));
        assert_eq!(frame, Frame::Text("echo a\necho b".to_string()));
    }

    #[test]
    fn test_decode_strips_single_terminator() {
        let line = decode_output(Frame::Text("a.txt\n".to_string())).unwrap();
        assert_eq!(line, "a.txt");
    }

    #[test]
    fn test_decode_without_terminator_is_unchanged() {
        let line = decode_output(Frame::Text("a.txt".to_string())).unwrap();
        assert_eq!(line, "a.txt");
    }

    #[test]
    fn test_decode_strips_only_outermost_terminator() {
        let line = decode_output(Frame::Text("a.txt\n\n".to_string())).unwrap();
        assert_eq!(line, "a.txt\n");
    }

    #[test]
    fn test_decode_keeps_carriage_return() {
        let line = decode_output(Frame::Text("a.txt\r\n".to_string())).unwrap();
        assert_eq!(line, "a.txt\r");
    }

    #[test]
    fn test_decode_empty_payloads() {
        assert_eq!(decode_output(Frame::Text(String::new())).unwrap(), "");
        assert_eq!(decode_output(Frame::Text("\n".to_string())).unwrap(), "");
    }

    #[test]
    fn test_decode_ignores_non_text_frames() {
        assert!(decode_output(Frame::Binary(vec![0x01, 0x02])).is_none());
        assert!(decode_output(Frame::Control).is_none());
        assert!(decode_output(Frame::Close).is_none());
    }

    #[test]
    fn test_frame_kind() {
        assert_eq!(Frame::Text("x".into()).kind(), "text");
        assert_eq!(Frame::Binary(vec![]).kind(), "binary");
        assert_eq!(Frame::Control.kind(), "control");
        assert_eq!(Frame::Close.kind(), "close");
    }
}
