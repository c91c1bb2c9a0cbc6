//! Single-pass Pratt compiler: scans and parses Lox source directly into a
//! `lox_core::Chunk`, with no intermediate AST (section 4).

pub mod compiler;
pub mod config;
pub mod error;
pub mod scanner;

pub use compiler::compile;
pub use config::CompilerConfig;
pub use error::CompileError;
