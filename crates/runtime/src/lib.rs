//! Stack-based bytecode virtual machine for the Lox scripting language
//! (section 4.7): frame stack, value stack, globals, and open upvalues,
//! layered over `lox-core`'s Chunk/Value/Object model and `lox-compiler`'s
//! Pratt compiler.

pub mod config;
pub mod error;
pub mod native;
pub mod vm;

pub use config::VmConfig;
pub use error::{InterpretError, RuntimeError, TraceFrame};
pub use vm::Vm;
