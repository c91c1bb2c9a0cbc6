//! Runtime diagnostics (section 7): a message plus a frame-by-frame stack
//! trace, formatted the way `vm.c`'s `runtimeError` writes to stderr.

use std::fmt;

use lox_compiler::CompileError;

/// One entry of a reported stack trace: `[line N] in NAME()`, or
/// `[line N] in script` for the top-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    pub name: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error: the formatted message plus the call-frame trace,
/// innermost first, captured at the moment the error was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    #[must_use]
    pub fn new(message: impl Into<String>, trace: Vec<TraceFrame>) -> Self {
        Self { message: message.into(), trace }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, frame) in self.trace.iter().enumerate() {
            if i + 1 == self.trace.len() {
                write!(f, "{frame}")?;
            } else {
                writeln!(f, "{frame}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Everything `Vm::interpret` can fail with: a batch of compile diagnostics,
/// or a single runtime error that unwound the stack.
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(errors) => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            InterpretError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_frame_prints_script_without_a_name() {
        let frame = TraceFrame { line: 3, name: None };
        assert_eq!(frame.to_string(), "[line 3] in script");
    }

    #[test]
    fn trace_frame_prints_function_name() {
        let frame = TraceFrame { line: 7, name: Some("fib".to_string()) };
        assert_eq!(frame.to_string(), "[line 7] in fib()");
    }
}
