//! A debugging aid (section 4.2): renders a `Chunk` as one instruction per
//! line, `OFFSET LINE OPCODE OPERANDS`, with repeated line numbers collapsed
//! to `   |` the way `line_of`/`same_line` were built to support.
//!
//! Writes to an injectable `&mut dyn std::io::Write` rather than stdout, so
//! callers (and tests) can capture or discard the output. The runtime only
//! calls into this when built with the `trace` feature; the type itself is
//! always available.

use std::io::{self, Write};

use crate::chunk::Chunk;
use crate::object::Object;
use crate::opcode::OpCode;

/// Render every instruction in `chunk` to `out`, preceded by a `== name ==`
/// header.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "== {name} ==")?;
    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, out)?;
    }
    Ok(())
}

/// Render the single instruction at `offset`, returning the offset of the
/// next one.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut dyn Write) -> io::Result<usize> {
    write!(out, "{offset:04} ")?;
    if offset > 0 && chunk.same_line(offset, offset - 1) {
        write!(out, "   | ")?;
    } else {
        write!(out, "{:4} ", chunk.line_of(offset))?;
    }

    let byte = chunk.read_byte(offset);
    let Some(op) = OpCode::from_byte(byte) else {
        writeln!(out, "Unknown opcode {byte}")?;
        return Ok(offset + 1);
    };

    match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset, out),
        OpCode::ConstantLong => constant_long_instruction("OP_CONSTANT_LONG", chunk, offset, out),
        OpCode::Nil => simple_instruction("OP_NIL", offset, out),
        OpCode::True => simple_instruction("OP_TRUE", offset, out),
        OpCode::False => simple_instruction("OP_FALSE", offset, out),
        OpCode::Pop => simple_instruction("OP_POP", offset, out),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset, out),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset, out),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset, out),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset, out),
        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset, out),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset, out),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset, out),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset, out),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset, out),
        OpCode::Greater => simple_instruction("OP_GREATER", offset, out),
        OpCode::Less => simple_instruction("OP_LESS", offset, out),
        OpCode::Add => simple_instruction("OP_ADD", offset, out),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset, out),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset, out),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset, out),
        OpCode::Not => simple_instruction("OP_NOT", offset, out),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset, out),
        OpCode::Print => simple_instruction("OP_PRINT", offset, out),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset, out),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset, out),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset, out),
        OpCode::JumpIfNoEqual => jump_instruction("OP_JUMP_IF_NO_EQUAL", 1, chunk, offset, out),
        OpCode::JumpIfEqual => jump_instruction("OP_JUMP_IF_EQUAL", 1, chunk, offset, out),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset, out),
        OpCode::Closure => closure_instruction(chunk, offset, out),
        OpCode::Compare => simple_instruction("OP_COMPARE", offset, out),
        OpCode::Return => simple_instruction("OP_RETURN", offset, out),
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut dyn Write) -> io::Result<usize> {
    writeln!(out, "{name}")?;
    Ok(offset + 1)
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut dyn Write) -> io::Result<usize> {
    let slot = chunk.read_byte(offset + 1);
    writeln!(out, "{name:<18} {slot:4}")?;
    Ok(offset + 2)
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut dyn Write) -> io::Result<usize> {
    let index = chunk.read_byte(offset + 1);
    writeln!(out, "{name:<18} {index:4} '{}'", chunk.constant(index as usize))?;
    Ok(offset + 2)
}

fn constant_long_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut dyn Write) -> io::Result<usize> {
    let index = chunk.read_u24(offset + 1) as usize;
    writeln!(out, "{name:<18} {index:4} '{}'", chunk.constant(index))?;
    Ok(offset + 4)
}

fn jump_instruction(
    name: &str,
    sign: i32,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let jump = chunk.read_u16(offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    writeln!(out, "{name:<18} {offset:4} -> {target}")?;
    Ok(offset + 3)
}

fn closure_instruction(chunk: &Chunk, offset: usize, out: &mut dyn Write) -> io::Result<usize> {
    let index = chunk.read_byte(offset + 1);
    writeln!(out, "{:<18} {index:4} '{}'", "OP_CLOSURE", chunk.constant(index as usize))?;
    let upvalue_count = match chunk.constant(index as usize).as_object() {
        Some(obj) => match obj.as_ref() {
            Object::Function(f) => f.upvalue_count,
            _ => 0,
        },
        None => 0,
    };
    let mut cursor = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.read_byte(cursor) != 0;
        let upvalue_index = chunk.read_byte(cursor + 1);
        writeln!(
            out,
            "{cursor:04}      |                     {} {upvalue_index}",
            if is_local { "local" } else { "upvalue" }
        )?;
        cursor += 2;
    }
    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn simple_opcodes_collapse_repeated_line_numbers() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Return, 2);
        let mut out = Vec::new();
        disassemble_chunk(&chunk, "test", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("== test =="));
        assert!(text.contains("OP_NIL"));
        assert!(text.contains("   | "), "second instruction on the same line should collapse: {text}");
        assert!(text.contains("OP_RETURN"));
    }

    #[test]
    fn constant_instruction_prints_the_value() {
        let mut chunk = Chunk::new();
        chunk.write_constant(Value::Number(42.0), 1).unwrap();
        let mut out = Vec::new();
        disassemble_chunk(&chunk, "test", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("42"));
    }

    #[test]
    fn jump_instruction_prints_its_target_offset() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0, 1);
        chunk.write(5, 1);
        chunk.write_op(OpCode::Return, 1);
        let mut out = Vec::new();
        let next = disassemble_instruction(&chunk, 0, &mut out).unwrap();
        assert_eq!(next, 3);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("-> 8"));
    }
}
