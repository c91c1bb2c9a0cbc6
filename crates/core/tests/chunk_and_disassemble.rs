//! Integration tests against `lox-core`'s public surface: a chunk built up
//! through its public API, then rendered by the disassembler.

use lox_core::{disassemble_chunk, Chunk, OpCode, Value};

#[test]
fn wide_constant_index_round_trips_through_write_constant() {
    let mut chunk = Chunk::new();
    for i in 0..300 {
        chunk.write_constant(Value::Number(f64::from(i)), 1).unwrap();
    }
    chunk.write_op(OpCode::Return, 1);

    assert_eq!(chunk.constants().len(), 300);
    assert_eq!(chunk.constant(299).as_number(), Some(299.0));
}

#[test]
fn disassembly_of_a_small_chunk_names_every_instruction() {
    let mut chunk = Chunk::new();
    chunk.write_constant(Value::Number(1.0), 1).unwrap();
    chunk.write_constant(Value::Number(2.0), 1).unwrap();
    chunk.write_op(OpCode::Add, 1);
    chunk.write_op(OpCode::Return, 2);

    let mut out = Vec::new();
    disassemble_chunk(&chunk, "add", &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.contains("== add =="));
    assert!(text.contains("OP_CONSTANT"));
    assert!(text.contains("OP_ADD"));
    assert!(text.contains("OP_RETURN"));
}
