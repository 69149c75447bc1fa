//! Bytecode instructions with symbolic branch targets
//!
//! Decoding turns every absolute offset into a [`Label`]: the original offset of
//! the instruction it names. Inserting instructions therefore never invalidates
//! a target; the writer resolves labels to new offsets during layout.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use std::collections::{HashMap, HashSet};

use super::opcodes as op;
use super::reader::ByteReader;
use crate::domain::{MalformedInput, SerializationError};

/// Original bytecode offset naming an instruction (or the end of the code)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Opcodes without operands, including the `iload_0`-style short forms
    Op(u8),
    Bipush(i8),
    Sipush(i16),
    /// `ldc` or `ldc_w`, chosen from the index when encoding
    Ldc(u16),
    Ldc2W(u16),
    /// Loads, stores and `ret` with an explicit slot (`wide` chosen when encoding)
    Local { opcode: u8, index: u16 },
    Iinc { index: u16, delta: i16 },
    /// Field access, `invokevirtual`/`special`/`static`, `new`, `anewarray`, `checkcast`, `instanceof`
    Member { opcode: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    NewArray { atype: u8 },
    MultiANewArray { index: u16, dimensions: u8 },
    /// Conditional branches, `goto` and `jsr` with a 16-bit displacement
    Jump { opcode: u8, target: Label },
    /// `goto_w` and `jsr_w`
    JumpWide { opcode: u8, target: Label },
    TableSwitch { default: Label, low: i32, targets: Vec<Label> },
    LookupSwitch { default: Label, pairs: Vec<(i32, Label)> },
}

impl Instruction {
    /// Primary opcode (the short form for [`Instruction::Ldc`])
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::Op(opcode)
            | Instruction::Local { opcode, .. }
            | Instruction::Member { opcode, .. }
            | Instruction::Jump { opcode, .. }
            | Instruction::JumpWide { opcode, .. } => *opcode,
            Instruction::Bipush(_) => op::BIPUSH,
            Instruction::Sipush(_) => op::SIPUSH,
            Instruction::Ldc(_) => op::LDC,
            Instruction::Ldc2W(_) => op::LDC2_W,
            Instruction::Iinc { .. } => op::IINC,
            Instruction::InvokeInterface { .. } => op::INVOKEINTERFACE,
            Instruction::InvokeDynamic { .. } => op::INVOKEDYNAMIC,
            Instruction::NewArray { .. } => op::NEWARRAY,
            Instruction::MultiANewArray { .. } => op::MULTIANEWARRAY,
            Instruction::TableSwitch { .. } => op::TABLESWITCH,
            Instruction::LookupSwitch { .. } => op::LOOKUPSWITCH,
        }
    }

    /// Every label this instruction may transfer control to
    #[must_use]
    pub fn targets(&self) -> Vec<Label> {
        match self {
            Instruction::Jump { target, .. } | Instruction::JumpWide { target, .. } => {
                vec![*target]
            }
            Instruction::TableSwitch { default, targets, .. } => {
                std::iter::once(*default).chain(targets.iter().copied()).collect()
            }
            Instruction::LookupSwitch { default, pairs } => {
                std::iter::once(*default).chain(pairs.iter().map(|(_, l)| *l)).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Encoded size in bytes when placed at `offset`
    #[must_use]
    pub fn size_at(&self, offset: u32) -> u32 {
        match self {
            Instruction::Op(_) => 1,
            Instruction::Bipush(_) | Instruction::NewArray { .. } => 2,
            Instruction::Sipush(_)
            | Instruction::Ldc2W(_)
            | Instruction::Member { .. }
            | Instruction::Jump { .. } => 3,
            Instruction::Ldc(index) => {
                if *index <= 0xff {
                    2
                } else {
                    3
                }
            }
            Instruction::Local { index, .. } => {
                if *index <= 0xff {
                    2
                } else {
                    4
                }
            }
            Instruction::Iinc { index, delta } => {
                if *index <= 0xff && i8::try_from(*delta).is_ok() {
                    3
                } else {
                    6
                }
            }
            Instruction::MultiANewArray { .. } => 4,
            Instruction::InvokeInterface { .. }
            | Instruction::InvokeDynamic { .. }
            | Instruction::JumpWide { .. } => 5,
            Instruction::TableSwitch { targets, .. } => {
                1 + switch_padding(offset) + 12 + 4 * targets.len() as u32
            }
            Instruction::LookupSwitch { pairs, .. } => {
                1 + switch_padding(offset) + 8 + 8 * pairs.len() as u32
            }
        }
    }
}

/// Zero bytes between a switch opcode and its 4-byte aligned operands
fn switch_padding(offset: u32) -> u32 {
    (4 - (offset + 1) % 4) % 4
}

/// An instruction in a method body. Original instructions carry the label of
/// their original offset; inserted ones carry none unless they take one over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    pub label: Option<Label>,
    pub instruction: Instruction,
}

impl Insn {
    #[must_use]
    pub fn new(instruction: Instruction) -> Self {
        Self { label: None, instruction }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a `code` array. `base` is the array's offset in the class file, used
/// for error positions.
///
/// # Errors
/// Returns [`MalformedInput`] for unknown opcodes, truncated operands and
/// branch targets that do not start an instruction.
pub fn decode(code: &[u8], base: usize) -> Result<Vec<Insn>, MalformedInput> {
    let mut reader = ByteReader::with_base(code, base);
    let mut insns = Vec::new();

    while !reader.is_empty() {
        let start = reader.position() as u32;
        let opcode = reader.u8()?;
        let instruction = decode_one(&mut reader, opcode, start)?;
        insns.push(Insn { label: Some(Label(start)), instruction });
    }

    let boundaries: HashSet<Label> = insns.iter().filter_map(|i| i.label).collect();
    for insn in &insns {
        for target in insn.instruction.targets() {
            if !boundaries.contains(&target) {
                return Err(MalformedInput::new(
                    base + target.0 as usize,
                    format!("branch target {} is not an instruction boundary", target.0),
                ));
            }
        }
    }

    Ok(insns)
}

fn branch_target(start: u32, displacement: i32, reader: &ByteReader<'_>) -> Result<Label, MalformedInput> {
    let target = i64::from(start) + i64::from(displacement);
    u32::try_from(target)
        .map(Label)
        .map_err(|_| reader.error(format!("branch target {target} before start of code")))
}

fn decode_one(reader: &mut ByteReader<'_>, opcode: u8, start: u32) -> Result<Instruction, MalformedInput> {
    let instruction = match opcode {
        op::BIPUSH => Instruction::Bipush(reader.i8()?),
        op::SIPUSH => Instruction::Sipush(reader.i16()?),
        op::LDC => Instruction::Ldc(u16::from(reader.u8()?)),
        op::LDC_W => Instruction::Ldc(reader.u16()?),
        op::LDC2_W => Instruction::Ldc2W(reader.u16()?),
        op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE | op::RET => {
            Instruction::Local { opcode, index: u16::from(reader.u8()?) }
        }
        op::IINC => Instruction::Iinc {
            index: u16::from(reader.u8()?),
            delta: i16::from(reader.i8()?),
        },
        op::IFEQ..=op::JSR | op::IFNULL | op::IFNONNULL => {
            let displacement = i32::from(reader.i16()?);
            Instruction::Jump { opcode, target: branch_target(start, displacement, reader)? }
        }
        op::GOTO_W | op::JSR_W => {
            let displacement = reader.i32()?;
            Instruction::JumpWide { opcode, target: branch_target(start, displacement, reader)? }
        }
        op::TABLESWITCH => {
            reader.skip(switch_padding(start) as usize)?;
            let default = branch_target(start, reader.i32()?, reader)?;
            let low = reader.i32()?;
            let high = reader.i32()?;
            if high < low {
                return Err(reader.error(format!("tableswitch high {high} below low {low}")));
            }
            let count = (i64::from(high) - i64::from(low) + 1) as usize;
            if count * 4 > reader.remaining() {
                return Err(reader.error("tableswitch jump table truncated"));
            }
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(branch_target(start, reader.i32()?, reader)?);
            }
            Instruction::TableSwitch { default, low, targets }
        }
        op::LOOKUPSWITCH => {
            reader.skip(switch_padding(start) as usize)?;
            let default = branch_target(start, reader.i32()?, reader)?;
            let npairs = reader.i32()?;
            let count = usize::try_from(npairs)
                .map_err(|_| reader.error(format!("negative lookupswitch npairs {npairs}")))?;
            if count * 8 > reader.remaining() {
                return Err(reader.error("lookupswitch match table truncated"));
            }
            let mut pairs = Vec::with_capacity(count);
            for _ in 0..count {
                let key = reader.i32()?;
                pairs.push((key, branch_target(start, reader.i32()?, reader)?));
            }
            Instruction::LookupSwitch { default, pairs }
        }
        op::GETSTATIC..=op::INVOKESTATIC
        | op::NEW
        | op::ANEWARRAY
        | op::CHECKCAST
        | op::INSTANCEOF => Instruction::Member { opcode, index: reader.u16()? },
        op::INVOKEINTERFACE => {
            let index = reader.u16()?;
            let count = reader.u8()?;
            reader.u8()?;
            Instruction::InvokeInterface { index, count }
        }
        op::INVOKEDYNAMIC => {
            let index = reader.u16()?;
            reader.u16()?;
            Instruction::InvokeDynamic { index }
        }
        op::NEWARRAY => Instruction::NewArray { atype: reader.u8()? },
        op::MULTIANEWARRAY => Instruction::MultiANewArray {
            index: reader.u16()?,
            dimensions: reader.u8()?,
        },
        op::WIDE => {
            let modified = reader.u8()?;
            match modified {
                op::ILOAD..=op::ALOAD | op::ISTORE..=op::ASTORE | op::RET => {
                    Instruction::Local { opcode: modified, index: reader.u16()? }
                }
                op::IINC => Instruction::Iinc { index: reader.u16()?, delta: reader.i16()? },
                other => return Err(reader.error(format!("opcode 0x{other:02x} cannot be wide"))),
            }
        }
        // Every remaining defined opcode up to monitorexit has no operands
        op::NOP..=op::MONITOREXIT => Instruction::Op(opcode),
        other => return Err(reader.error(format!("unknown opcode 0x{other:02x}"))),
    };
    Ok(instruction)
}

// ============================================================================
// Encoding
// ============================================================================

/// Result of laying out a method body
#[derive(Debug, Clone)]
pub struct Layout {
    /// New offset of every instruction, by position
    pub offsets: Vec<u32>,
    /// New offset of every label carried by an instruction, plus the end label
    pub labels: HashMap<Label, u32>,
    pub code_length: u32,
}

impl Layout {
    /// # Errors
    /// Returns [`SerializationError::UnresolvedLabel`] if no instruction carries `label`.
    pub fn resolve(&self, label: Label, method: &str) -> Result<u32, SerializationError> {
        self.labels.get(&label).copied().ok_or_else(|| SerializationError::UnresolvedLabel {
            method: method.to_string(),
            label: label.0,
        })
    }
}

/// Assign new offsets. `end` is the label standing for the end of the code.
#[must_use]
pub fn layout(insns: &[Insn], end: Label) -> Layout {
    let mut offsets = Vec::with_capacity(insns.len());
    let mut labels = HashMap::with_capacity(insns.len() + 1);
    let mut offset: u32 = 0;

    for insn in insns {
        offsets.push(offset);
        if let Some(label) = insn.label {
            labels.insert(label, offset);
        }
        offset += insn.instruction.size_at(offset);
    }
    labels.entry(end).or_insert(offset);

    Layout { offsets, labels, code_length: offset }
}

/// Encode instructions according to `layout`
///
/// # Errors
/// Returns [`SerializationError`] when the code is too large, a label does not
/// resolve, or a 16-bit branch cannot reach its target.
pub fn encode(insns: &[Insn], layout: &Layout, method: &str) -> Result<Vec<u8>, SerializationError> {
    if layout.code_length > u32::from(u16::MAX) {
        return Err(SerializationError::CodeTooLarge {
            method: method.to_string(),
            size: layout.code_length as usize,
        });
    }

    let mut out = Vec::with_capacity(layout.code_length as usize);
    for (insn, &at) in insns.iter().zip(&layout.offsets) {
        let relative = |label: Label| -> Result<i32, SerializationError> {
            Ok(layout.resolve(label, method)? as i32 - at as i32)
        };

        match &insn.instruction {
            Instruction::Op(opcode) => out.push(*opcode),
            Instruction::Bipush(value) => {
                out.push(op::BIPUSH);
                out.push(*value as u8);
            }
            Instruction::Sipush(value) => {
                out.push(op::SIPUSH);
                out.extend_from_slice(&value.to_be_bytes());
            }
            Instruction::Ldc(index) => {
                if *index <= 0xff {
                    out.push(op::LDC);
                    out.push(*index as u8);
                } else {
                    out.push(op::LDC_W);
                    out.extend_from_slice(&index.to_be_bytes());
                }
            }
            Instruction::Ldc2W(index) => {
                out.push(op::LDC2_W);
                out.extend_from_slice(&index.to_be_bytes());
            }
            Instruction::Local { opcode, index } => {
                if *index <= 0xff {
                    out.push(*opcode);
                    out.push(*index as u8);
                } else {
                    out.push(op::WIDE);
                    out.push(*opcode);
                    out.extend_from_slice(&index.to_be_bytes());
                }
            }
            Instruction::Iinc { index, delta } => {
                if *index <= 0xff && i8::try_from(*delta).is_ok() {
                    out.push(op::IINC);
                    out.push(*index as u8);
                    out.push(*delta as u8);
                } else {
                    out.push(op::WIDE);
                    out.push(op::IINC);
                    out.extend_from_slice(&index.to_be_bytes());
                    out.extend_from_slice(&delta.to_be_bytes());
                }
            }
            Instruction::Member { opcode, index } => {
                out.push(*opcode);
                out.extend_from_slice(&index.to_be_bytes());
            }
            Instruction::InvokeInterface { index, count } => {
                out.push(op::INVOKEINTERFACE);
                out.extend_from_slice(&index.to_be_bytes());
                out.push(*count);
                out.push(0);
            }
            Instruction::InvokeDynamic { index } => {
                out.push(op::INVOKEDYNAMIC);
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&[0, 0]);
            }
            Instruction::NewArray { atype } => {
                out.push(op::NEWARRAY);
                out.push(*atype);
            }
            Instruction::MultiANewArray { index, dimensions } => {
                out.push(op::MULTIANEWARRAY);
                out.extend_from_slice(&index.to_be_bytes());
                out.push(*dimensions);
            }
            Instruction::Jump { opcode, target } => {
                let displacement = relative(*target)?;
                let short = i16::try_from(displacement).map_err(|_| {
                    SerializationError::BranchOutOfRange {
                        method: method.to_string(),
                        from: at,
                        to: (at as i32 + displacement) as u32,
                    }
                })?;
                out.push(*opcode);
                out.extend_from_slice(&short.to_be_bytes());
            }
            Instruction::JumpWide { opcode, target } => {
                out.push(*opcode);
                out.extend_from_slice(&relative(*target)?.to_be_bytes());
            }
            Instruction::TableSwitch { default, low, targets } => {
                out.push(op::TABLESWITCH);
                out.extend(std::iter::repeat(0).take(switch_padding(at) as usize));
                out.extend_from_slice(&relative(*default)?.to_be_bytes());
                out.extend_from_slice(&low.to_be_bytes());
                let high = low + targets.len() as i32 - 1;
                out.extend_from_slice(&high.to_be_bytes());
                for target in targets {
                    out.extend_from_slice(&relative(*target)?.to_be_bytes());
                }
            }
            Instruction::LookupSwitch { default, pairs } => {
                out.push(op::LOOKUPSWITCH);
                out.extend(std::iter::repeat(0).take(switch_padding(at) as usize));
                out.extend_from_slice(&relative(*default)?.to_be_bytes());
                out.extend_from_slice(&(pairs.len() as i32).to_be_bytes());
                for (key, target) in pairs {
                    out.extend_from_slice(&key.to_be_bytes());
                    out.extend_from_slice(&relative(*target)?.to_be_bytes());
                }
            }
        }
    }

    debug_assert_eq!(out.len(), layout.code_length as usize);
    Ok(out)
}
