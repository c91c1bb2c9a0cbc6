//! Lox Core: the bytecode container, value/object model, and string interner
//! shared by the compiler and the virtual machine.
//!
//! Neither the compiler nor the runtime can be the "bottom" of the dependency
//! graph on their own: both need to talk about `Chunk`s, `Value`s, and
//! interned strings. This crate is that shared vocabulary, with no
//! dependency in either direction, mirroring the role `seq-core` plays for
//! the Seq toolchain this project grew out of.
//!
//! # Modules
//!
//! - `opcode`: the single-byte instruction set.
//! - `chunk`: bytecode + constant pool + line table.
//! - `value`: the four-variant `Value` sum and equality/printing rules.
//! - `object`: heap objects (strings, functions, closures, upvalues, natives).
//! - `interner`: content-addressed string canonicalization.
//! - `disassemble`: a debugging aid that renders a chunk as text; the
//!   runtime only calls into it when built with the `trace` feature.

pub mod chunk;
pub mod disassemble;
pub mod interner;
pub mod object;
pub mod opcode;
pub mod value;

pub use chunk::{Chunk, ChunkError};
pub use disassemble::{disassemble_chunk, disassemble_instruction};
pub use interner::StringInterner;
pub use object::{Closure, Function, LoxStr, NativeFn, NativeFunction, Object, Upvalue};
pub use opcode::OpCode;
pub use value::Value;
