//! Recomputation of `max_stack` and `max_locals`
//!
//! `max_stack` comes from a forward data-flow pass over the instruction graph:
//! every instruction gets the operand stack depth on entry, and the maximum
//! depth seen anywhere is the answer. Exception handlers are entered with the
//! thrown object as the only stack item.

use std::collections::HashMap;

use super::constant_pool::{Constant, ConstantPool};
use super::descriptor::{field_slots, method_shape};
use super::instruction::{Instruction, Label};
use super::opcodes as op;
use super::{MethodBody, ACC_STATIC};
use crate::domain::SerializationError;

/// Words popped and pushed by one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Effect {
    pops: u16,
    pushes: u16,
}

const fn effect(pops: u16, pushes: u16) -> Effect {
    Effect { pops, pushes }
}

/// Stack effect of an operand-less opcode
fn simple_effect(opcode: u8) -> Option<Effect> {
    let e = match opcode {
        op::NOP => effect(0, 0),
        // aconst_null, iconst_m1..iconst_5
        0x01..=0x08 => effect(0, 1),
        // lconst_0, lconst_1
        0x09 | 0x0a => effect(0, 2),
        // fconst_0..2
        0x0b..=0x0d => effect(0, 1),
        // dconst_0, dconst_1
        0x0e | 0x0f => effect(0, 2),
        // iload_n
        0x1a..=0x1d => effect(0, 1),
        // lload_n
        0x1e..=0x21 => effect(0, 2),
        // fload_n
        0x22..=0x25 => effect(0, 1),
        // dload_n
        0x26..=0x29 => effect(0, 2),
        // aload_n
        0x2a..=0x2d => effect(0, 1),
        // iaload, laload, faload, daload, aaload, baload, caload, saload
        0x2e | 0x30 | 0x32..=0x35 => effect(2, 1),
        0x2f | 0x31 => effect(2, 2),
        // istore_n
        0x3b..=0x3e => effect(1, 0),
        // lstore_n
        0x3f..=0x42 => effect(2, 0),
        // fstore_n
        0x43..=0x46 => effect(1, 0),
        // dstore_n
        0x47..=0x4a => effect(2, 0),
        // astore_n
        0x4b..=0x4e => effect(1, 0),
        // iastore, fastore, aastore, bastore, castore, sastore
        0x4f | 0x51 | 0x53..=0x56 => effect(3, 0),
        // lastore, dastore
        0x50 | 0x52 => effect(4, 0),
        op::POP => effect(1, 0),
        0x58 => effect(2, 0),
        op::DUP => effect(1, 2),
        0x5a => effect(2, 3),
        0x5b => effect(3, 4),
        0x5c => effect(2, 4),
        0x5d => effect(3, 5),
        0x5e => effect(4, 6),
        0x5f => effect(2, 2),
        // add, sub, mul, div, rem in i/l/f/d order
        0x60..=0x73 => match (opcode - 0x60) % 4 {
            0 | 2 => effect(2, 1),
            _ => effect(4, 2),
        },
        // ineg, lneg, fneg, dneg
        0x74 | 0x76 => effect(1, 1),
        0x75 | 0x77 => effect(2, 2),
        // ishl, ishr, iushr
        0x78 | 0x7a | 0x7c => effect(2, 1),
        // lshl, lshr, lushr
        0x79 | 0x7b | 0x7d => effect(3, 2),
        // iand, ior, ixor
        0x7e | 0x80 | 0x82 => effect(2, 1),
        // land, lor, lxor
        0x7f | 0x81 | 0x83 => effect(4, 2),
        // i2l, i2f, i2d
        0x85 | 0x87 => effect(1, 2),
        0x86 => effect(1, 1),
        // l2i, l2f, l2d
        0x88 | 0x89 => effect(2, 1),
        0x8a => effect(2, 2),
        // f2i, f2l, f2d
        0x8b => effect(1, 1),
        0x8c | 0x8d => effect(1, 2),
        // d2i, d2l, d2f
        0x8e | 0x90 => effect(2, 1),
        0x8f => effect(2, 2),
        // i2b, i2c, i2s
        0x91..=0x93 => effect(1, 1),
        // lcmp
        0x94 => effect(4, 1),
        // fcmpl, fcmpg
        0x95 | 0x96 => effect(2, 1),
        // dcmpl, dcmpg
        0x97 | 0x98 => effect(4, 1),
        op::IRETURN | op::FRETURN | op::ARETURN => effect(1, 0),
        op::LRETURN | op::DRETURN => effect(2, 0),
        op::RETURN => effect(0, 0),
        op::ARRAYLENGTH => effect(1, 1),
        op::ATHROW | op::MONITORENTER | op::MONITOREXIT => effect(1, 0),
        _ => return None,
    };
    Some(e)
}

fn instruction_effect(instruction: &Instruction, pool: &ConstantPool) -> Result<Effect, String> {
    let invoke = |index: u16, has_receiver: bool| -> Result<Effect, String> {
        let member = pool.member_ref(index).ok_or(format!("#{index} is not a method reference"))?;
        let shape = method_shape(&member.descriptor)
            .ok_or(format!("bad method descriptor {}", member.descriptor))?;
        Ok(effect(shape.arg_slots + u16::from(has_receiver), shape.return_slots))
    };

    let e = match instruction {
        Instruction::Op(opcode) => {
            simple_effect(*opcode).ok_or(format!("opcode 0x{opcode:02x} has no stack effect"))?
        }
        Instruction::Bipush(_) | Instruction::Sipush(_) => effect(0, 1),
        Instruction::Ldc(index) => match pool.get(*index) {
            Some(Constant::Long(_) | Constant::Double(_)) => {
                return Err(format!("ldc of two-word constant #{index}"))
            }
            _ => effect(0, 1),
        },
        Instruction::Ldc2W(_) => effect(0, 2),
        Instruction::Local { opcode, .. } => match *opcode {
            op::ILOAD | op::FLOAD | op::ALOAD => effect(0, 1),
            op::LLOAD | op::DLOAD => effect(0, 2),
            op::ISTORE | op::FSTORE | op::ASTORE => effect(1, 0),
            op::LSTORE | op::DSTORE => effect(2, 0),
            _ => return Err("ret is not supported by the stack analysis".to_string()),
        },
        Instruction::Iinc { .. } => effect(0, 0),
        Instruction::Member { opcode, index } => match *opcode {
            op::GETSTATIC | op::PUTSTATIC | op::GETFIELD | op::PUTFIELD => {
                let member =
                    pool.member_ref(*index).ok_or(format!("#{index} is not a field reference"))?;
                let size = field_slots(&member.descriptor)
                    .ok_or(format!("bad field descriptor {}", member.descriptor))?;
                match *opcode {
                    op::GETSTATIC => effect(0, size),
                    op::PUTSTATIC => effect(size, 0),
                    op::GETFIELD => effect(1, size),
                    _ => effect(1 + size, 0),
                }
            }
            op::INVOKEVIRTUAL | op::INVOKESPECIAL => invoke(*index, true)?,
            op::INVOKESTATIC => invoke(*index, false)?,
            op::NEW => effect(0, 1),
            // anewarray, checkcast, instanceof
            _ => effect(1, 1),
        },
        Instruction::InvokeInterface { index, .. } => invoke(*index, true)?,
        Instruction::InvokeDynamic { index } => {
            let descriptor = pool
                .invoke_dynamic_descriptor(*index)
                .ok_or(format!("#{index} is not an invokedynamic constant"))?;
            let shape = method_shape(&descriptor).ok_or(format!("bad call site {descriptor}"))?;
            effect(shape.arg_slots, shape.return_slots)
        }
        Instruction::NewArray { .. } => effect(1, 1),
        Instruction::MultiANewArray { dimensions, .. } => effect(u16::from(*dimensions), 1),
        Instruction::Jump { opcode, .. } => match *opcode {
            op::IFEQ..=op::IFLE | op::IFNULL | op::IFNONNULL => effect(1, 0),
            op::IF_ICMPEQ..=op::IF_ACMPNE => effect(2, 0),
            op::GOTO => effect(0, 0),
            _ => return Err("jsr is not supported by the stack analysis".to_string()),
        },
        Instruction::JumpWide { opcode, .. } => {
            if *opcode == op::GOTO_W {
                effect(0, 0)
            } else {
                return Err("jsr_w is not supported by the stack analysis".to_string());
            }
        }
        Instruction::TableSwitch { .. } | Instruction::LookupSwitch { .. } => effect(1, 0),
    };
    Ok(e)
}

/// Does control fall through to the next instruction?
fn falls_through(instruction: &Instruction) -> bool {
    match instruction {
        Instruction::Op(opcode) => !op::is_exit(*opcode),
        Instruction::Jump { opcode, .. } => *opcode != op::GOTO,
        Instruction::JumpWide { .. }
        | Instruction::TableSwitch { .. }
        | Instruction::LookupSwitch { .. } => false,
        _ => true,
    }
}

/// Subroutines (`jsr`/`ret`) only appear in pre-Java 6 class files
#[must_use]
pub fn uses_subroutines(body: &MethodBody) -> bool {
    body.opcodes().any(|i| match i {
        Instruction::Jump { opcode, .. } | Instruction::JumpWide { opcode, .. } => {
            *opcode == op::JSR || *opcode == op::JSR_W
        }
        Instruction::Local { opcode, .. } => *opcode == op::RET,
        _ => false,
    })
}

/// Maximum operand stack depth of `body`
///
/// # Errors
/// Returns [`SerializationError::StackAnalysis`] when the body underflows the
/// stack, merges paths with different depths, falls off the end of the code or
/// uses subroutines.
pub fn max_stack(body: &MethodBody, pool: &ConstantPool, method: &str) -> Result<u16, SerializationError> {
    let fail = |index: usize, reason: String| SerializationError::StackAnalysis {
        method: method.to_string(),
        index,
        reason,
    };

    let positions: HashMap<Label, usize> = body
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(i, insn)| insn.label.map(|l| (l, i)))
        .collect();
    let position = |label: Label, from: usize| {
        positions
            .get(&label)
            .copied()
            .ok_or_else(|| fail(from, format!("label {} has no instruction", label.0)))
    };

    let count = body.instructions.len();
    let mut depth_at: Vec<Option<u16>> = vec![None; count];
    let mut worklist: Vec<(usize, u16)> = Vec::new();
    let mut max: u16 = 0;

    if count > 0 {
        worklist.push((0, 0));
    }
    for handler in &body.handlers {
        worklist.push((position(handler.handler, 0)?, 1));
    }

    while let Some((index, depth)) = worklist.pop() {
        if index >= count {
            return Err(fail(index, "control falls off the end of the code".to_string()));
        }
        match depth_at[index] {
            Some(known) if known == depth => continue,
            Some(known) => {
                return Err(fail(index, format!("stack depth {depth} meets {known}")));
            }
            None => depth_at[index] = Some(depth),
        }
        max = max.max(depth);

        let instruction = &body.instructions[index].instruction;
        let e = instruction_effect(instruction, pool).map_err(|reason| fail(index, reason))?;
        let after = depth
            .checked_sub(e.pops)
            .ok_or_else(|| fail(index, format!("pops {} from depth {depth}", e.pops)))?
            + e.pushes;
        max = max.max(after);

        for target in instruction.targets() {
            worklist.push((position(target, index)?, after));
        }
        if falls_through(instruction) {
            worklist.push((index + 1, after));
        }
    }

    Ok(max)
}

/// Slots used by parameters, `this` included for instance methods
#[must_use]
pub fn parameter_slots(access_flags: u16, descriptor: &str) -> Option<u16> {
    let shape = method_shape(descriptor)?;
    Some(shape.arg_slots + u16::from(access_flags & ACC_STATIC == 0))
}

/// Smallest `max_locals` covering parameters and every local-variable access
#[must_use]
pub fn max_locals(body: &MethodBody, access_flags: u16, descriptor: &str) -> u16 {
    let mut max = parameter_slots(access_flags, descriptor).unwrap_or(0);
    for instruction in body.opcodes() {
        let needed = match instruction {
            Instruction::Local { opcode, index } => {
                let width = if matches!(*opcode, op::LLOAD | op::DLOAD | op::LSTORE | op::DSTORE) {
                    2
                } else {
                    1
                };
                index.saturating_add(width)
            }
            Instruction::Iinc { index, .. } => index.saturating_add(1),
            Instruction::Op(opcode) => match *opcode {
                // xload_n / xstore_n: slot n, wide types take n+1 too
                0x1a..=0x2d => short_form_slots(*opcode - 0x1a),
                0x3b..=0x4e => short_form_slots(*opcode - 0x3b),
                _ => 0,
            },
            _ => 0,
        };
        max = max.max(needed);
    }
    max
}

/// Slots implied by a short-form load/store given its offset within the family
fn short_form_slots(relative: u8) -> u16 {
    let family = relative / 4;
    let slot = u16::from(relative % 4);
    // family order: i, l, f, d, a
    if family == 1 || family == 3 {
        slot + 2
    } else {
        slot + 1
    }
}
