//! Chunk disassembly, for `--emit-bytecode` output and debugging tests.

use std::io::{self, Write};

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::object::{ObjRef, Object};
use crate::value::Value;

/// Disassembles a whole chunk under a heading.
pub fn disassemble_chunk(
    heap: &Heap,
    chunk: &Chunk,
    name: &str,
    out: &mut dyn Write,
) -> io::Result<()> {
    writeln!(out, "== {name} ==")?;
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, out)?;
    }
    Ok(())
}

/// Disassembles a function and, recursively, every function in its constant
/// pool.
pub fn disassemble_function(heap: &Heap, function: ObjRef, out: &mut dyn Write) -> io::Result<()> {
    let f = heap.function(function);
    let label = match f.name {
        Some(name) => format!("fun {}", heap.str_chars(name)),
        None => "script".to_string(),
    };
    disassemble_chunk(heap, &f.chunk, &label, out)?;
    for &constant in &f.chunk.constants {
        if let Value::Obj(r) = constant {
            if matches!(heap.get(r), Object::Function(_)) {
                writeln!(out)?;
                disassemble_function(heap, r, out)?;
            }
        }
    }
    Ok(())
}

/// Disassembles the instruction at `offset`, returning the offset of the
/// next one.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    write!(out, "{offset:04} ")?;
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        write!(out, "   | ")?;
    } else {
        write!(out, "{:4} ", chunk.lines[offset])?;
    }

    let byte = chunk.code[offset];
    let Ok(op) = OpCode::try_from(byte) else {
        writeln!(out, "Unknown opcode {byte}")?;
        return Ok(offset + 1);
    };

    match op {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Eq
        | OpCode::Neq
        | OpCode::Gt
        | OpCode::Lt
        | OpCode::Gte
        | OpCode::Lte
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::ShiftLeft
        | OpCode::ShiftRight
        | OpCode::BitOr
        | OpCode::BitXor
        | OpCode::BitAnd
        | OpCode::Negate
        | OpCode::Invert
        | OpCode::Not
        | OpCode::CloseUpvalue
        | OpCode::Return
        | OpCode::ReturnNil
        | OpCode::Inherit
        | OpCode::Print
        | OpCode::Pop => {
            writeln!(out, "{op:?}")?;
            Ok(offset + 1)
        }

        OpCode::ByteNum
        | OpCode::Call
        | OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::NewArray
        | OpCode::Subscript
        | OpCode::SubscriptAssign => {
            let operand = chunk.code[offset + 1];
            writeln!(out, "{op:?} {operand}")?;
            Ok(offset + 2)
        }

        OpCode::Constant
        | OpCode::DefineGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let index = chunk.code[offset + 1] as usize;
            writeln!(
                out,
                "{op:?} {index} '{}'",
                heap.stringify(chunk.constants[index])
            )?;
            Ok(offset + 2)
        }

        OpCode::ConstantLong
        | OpCode::DefineGlobalLong
        | OpCode::GetGlobalLong
        | OpCode::SetGlobalLong
        | OpCode::GetPropertyLong
        | OpCode::SetPropertyLong
        | OpCode::GetSuperLong
        | OpCode::ClassLong
        | OpCode::MethodLong => {
            let index = read_u16(chunk, offset + 1) as usize;
            writeln!(
                out,
                "{op:?} {index} '{}'",
                heap.stringify(chunk.constants[index])
            )?;
            Ok(offset + 3)
        }

        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            let jump = read_u16(chunk, offset + 1) as usize;
            writeln!(out, "{op:?} {offset} -> {}", offset + 3 + jump)?;
            Ok(offset + 3)
        }
        OpCode::JumpBackwards => {
            let jump = read_u16(chunk, offset + 1) as usize;
            writeln!(out, "{op:?} {offset} -> {}", offset + 3 - jump)?;
            Ok(offset + 3)
        }

        OpCode::Invoke | OpCode::SuperInvoke => {
            let index = chunk.code[offset + 1] as usize;
            let argc = chunk.code[offset + 2];
            writeln!(
                out,
                "{op:?} ({argc} args) {index} '{}'",
                heap.stringify(chunk.constants[index])
            )?;
            Ok(offset + 3)
        }
        OpCode::InvokeLong | OpCode::SuperInvokeLong => {
            let index = read_u16(chunk, offset + 1) as usize;
            let argc = chunk.code[offset + 3];
            writeln!(
                out,
                "{op:?} ({argc} args) {index} '{}'",
                heap.stringify(chunk.constants[index])
            )?;
            Ok(offset + 4)
        }

        OpCode::Closure | OpCode::ClosureLong => {
            let (index, mut next) = if op == OpCode::Closure {
                (chunk.code[offset + 1] as usize, offset + 2)
            } else {
                (read_u16(chunk, offset + 1) as usize, offset + 3)
            };
            let constant = chunk.constants[index];
            writeln!(out, "{op:?} {index} {}", heap.stringify(constant))?;
            if let Value::Obj(r) = constant {
                if let Object::Function(f) = heap.get(r) {
                    for _ in 0..f.upvalue_count {
                        let is_local = chunk.code[next];
                        let slot = chunk.code[next + 1];
                        let kind = if is_local == 1 { "local" } else { "upvalue" };
                        writeln!(out, "{next:04}    |                     {kind} {slot}")?;
                        next += 2;
                    }
                }
            }
            Ok(next)
        }
    }
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    (u16::from(chunk.code[offset]) << 8) | u16::from(chunk.code[offset + 1])
}
