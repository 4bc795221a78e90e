//! Values carried over the command and output streams.
//!
//! Both types are opaque strings: the client never parses or validates
//! command syntax, and output lines are delivered exactly as the remote host
//! produced them (minus one trailing line terminator, see [`crate::framing`]).

use std::fmt;

use serde::{Deserialize, Serialize};

/// One command submission from the input surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Command(String);

impl Command {
    /// Creates a command from any string-like value.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Returns the command text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the command and returns its text.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One decoded line of remote output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputLine(String);

impl OutputLine {
    /// Creates an output line from text that has already been stripped.
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Returns the line text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the line and returns its text.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for OutputLine {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl From<&str> for OutputLine {
    fn from(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl PartialEq<&str> for OutputLine {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
