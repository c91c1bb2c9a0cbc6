//! Compile-time diagnostics (section 7).
//!
//! Modeled on the teacher's hand-rolled `Display` + `std::error::Error`
//! pattern for compiler diagnostics rather than a `thiserror` derive — this
//! workspace's crates never depended on `thiserror` and there's no reason to
//! start for a handful of fixed-shape variants.

use std::fmt;

/// One reported compile error: the source line, where it was reported (the
/// offending lexeme, or "end"), and the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: u32,
    pub location: String,
    pub message: String,
}

impl CompileError {
    #[must_use]
    pub fn new(line: u32, location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line,
            location: location.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error{}: {}", self.line, self.location, self.message)
    }
}

impl std::error::Error for CompileError {}
