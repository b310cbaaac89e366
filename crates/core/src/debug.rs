//! Chunk disassembly.
//!
//! Renders `offset | line | mnemonic [operands]` per instruction, the
//! format the VM's trace logging and the test fixtures read.

use std::fmt::Write as _;

use crate::chunk::{Chunk, OpCode};
use crate::object::Heap;
use crate::value::format_value;

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Append one instruction's rendering to `out`; returns the offset of
/// the next instruction.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let op = match OpCode::try_from(chunk.code[offset]) {
        Ok(op) => op,
        Err(_) => {
            let _ = writeln!(out, "Unknown opcode {}", chunk.code[offset]);
            return offset + 1;
        }
    };
    match op {
        OpCode::Constant => constant_instruction(heap, chunk, "OP_CONSTANT", offset, out),
        OpCode::Nil => simple_instruction("OP_NIL", offset, out),
        OpCode::True => simple_instruction("OP_TRUE", offset, out),
        OpCode::False => simple_instruction("OP_FALSE", offset, out),
        OpCode::Pop => simple_instruction("OP_POP", offset, out),
        OpCode::GetLocal => byte_instruction(chunk, "OP_GET_LOCAL", offset, out),
        OpCode::SetLocal => byte_instruction(chunk, "OP_SET_LOCAL", offset, out),
        OpCode::GetGlobal => constant_instruction(heap, chunk, "OP_GET_GLOBAL", offset, out),
        OpCode::DefineGlobal => constant_instruction(heap, chunk, "OP_DEFINE_GLOBAL", offset, out),
        OpCode::SetGlobal => constant_instruction(heap, chunk, "OP_SET_GLOBAL", offset, out),
        OpCode::GetUpvalue => byte_instruction(chunk, "OP_GET_UPVALUE", offset, out),
        OpCode::SetUpvalue => byte_instruction(chunk, "OP_SET_UPVALUE", offset, out),
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
        OpCode::Jump => jump_instruction(chunk, "OP_JUMP", 1, offset, out),
        OpCode::JumpIfFalse => jump_instruction(chunk, "OP_JUMP_IF_FALSE", 1, offset, out),
        OpCode::Loop => jump_instruction(chunk, "OP_LOOP", -1, offset, out),
        OpCode::Call => byte_instruction(chunk, "OP_CALL", offset, out),
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset, out),
        OpCode::Return => simple_instruction("OP_RETURN", offset, out),
    }
}

fn simple_instruction(name: &str, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{name}");
    offset + 1
}

fn byte_instruction(chunk: &Chunk, name: &str, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{name:<16} {slot:4}");
    offset + 2
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    name: &str,
    offset: usize,
    out: &mut String,
) -> usize {
    let index = chunk.code[offset + 1];
    let value = chunk.constants[index as usize];
    let _ = writeln!(out, "{name:<16} {index:4} '{}'", format_value(heap, value));
    offset + 2
}

fn jump_instruction(chunk: &Chunk, name: &str, sign: i64, offset: usize, out: &mut String) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
    let target = offset as i64 + 3 + sign * i64::from(jump);
    let _ = writeln!(out, "{name:<16} {offset:4} -> {target}");
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let index = chunk.code[offset + 1];
    let value = chunk.constants[index as usize];
    let _ = writeln!(
        out,
        "{:<16} {index:4} {}",
        "OP_CLOSURE",
        format_value(heap, value)
    );
    let mut offset = offset + 2;
    let upvalue_count = value
        .as_obj()
        .map(|handle| heap.function(handle).upvalue_count)
        .unwrap_or(0);
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset];
        let index = chunk.code[offset + 1];
        let _ = writeln!(
            out,
            "{:04}      |                     {} {}",
            offset,
            if is_local == 1 { "local" } else { "upvalue" },
            index
        );
        offset += 2;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_disassemble_arithmetic_chunk() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::Number(1.2)) as u8;
        chunk.write_op(OpCode::Constant, 123);
        chunk.write(index, 123);
        chunk.write_op(OpCode::Negate, 123);
        chunk.write_op(OpCode::Return, 124);

        let text = disassemble_chunk(&heap, &chunk, "test");
        assert!(text.starts_with("== test ==\n"));
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("'1.2'"));
        assert!(text.contains("OP_NEGATE"));
        assert!(text.contains("OP_RETURN"));
        // the second line-123 byte collapses to a pipe
        assert!(text.contains("   | "));
    }

    #[test]
    fn test_disassemble_jump_targets() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::JumpIfFalse, 1);
        chunk.write(0, 1);
        chunk.write(2, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);

        let text = disassemble_chunk(&heap, &chunk, "jumps");
        assert!(text.contains("OP_JUMP_IF_FALSE    0 -> 5"));
    }
}
