//! `StackMapTable` frames in label form
//!
//! Frames are decoded to absolute labels so the writer can recompute every
//! `offset_delta` after instructions move. Inserted probe calls leave the
//! operand stack and locals exactly as they found them, so frame contents
//! never change; only their positions and encodings do.

#![allow(clippy::cast_possible_truncation)]

use super::instruction::{Label, Layout};
use super::reader::ByteReader;
use crate::domain::{MalformedInput, SerializationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Constant pool index of a `CONSTANT_Class`
    Object(u16),
    /// Object created by the `new` instruction at this label
    Uninitialized(Label),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Same,
    SameLocals1StackItem(VerificationType),
    /// Drop the last 1..=3 locals
    Chop(u8),
    /// Add 1..=3 locals
    Append(Vec<VerificationType>),
    Full { locals: Vec<VerificationType>, stack: Vec<VerificationType> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMapFrame {
    pub label: Label,
    pub kind: FrameKind,
}

fn read_type(
    r: &mut ByteReader<'_>,
    is_boundary: &dyn Fn(Label) -> bool,
) -> Result<VerificationType, MalformedInput> {
    let tag = r.u8()?;
    Ok(match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(r.u16()?),
        8 => {
            let label = Label(u32::from(r.u16()?));
            if !is_boundary(label) {
                return Err(r.error(format!("uninitialized offset {} is not an instruction", label.0)));
            }
            VerificationType::Uninitialized(label)
        }
        other => return Err(r.error(format!("unknown verification type tag {other}"))),
    })
}

fn read_types(
    r: &mut ByteReader<'_>,
    count: usize,
    is_boundary: &dyn Fn(Label) -> bool,
) -> Result<Vec<VerificationType>, MalformedInput> {
    (0..count).map(|_| read_type(r, is_boundary)).collect()
}

/// Decode a `StackMapTable` attribute body
///
/// # Errors
/// Returns [`MalformedInput`] for reserved frame types and frames that do not
/// land on an instruction.
pub fn decode(
    data: &[u8],
    base: usize,
    is_boundary: &dyn Fn(Label) -> bool,
) -> Result<Vec<StackMapFrame>, MalformedInput> {
    let mut r = ByteReader::with_base(data, base);
    let count = r.u16()?;
    let mut frames = Vec::with_capacity(usize::from(count));
    let mut previous: Option<u32> = None;

    for _ in 0..count {
        let frame_type = r.u8()?;
        let (delta, kind) = match frame_type {
            0..=63 => (u32::from(frame_type), FrameKind::Same),
            64..=127 => (
                u32::from(frame_type - 64),
                FrameKind::SameLocals1StackItem(read_type(&mut r, is_boundary)?),
            ),
            247 => {
                let delta = u32::from(r.u16()?);
                (delta, FrameKind::SameLocals1StackItem(read_type(&mut r, is_boundary)?))
            }
            248..=250 => (u32::from(r.u16()?), FrameKind::Chop(251 - frame_type)),
            251 => (u32::from(r.u16()?), FrameKind::Same),
            252..=254 => {
                let delta = u32::from(r.u16()?);
                let locals = read_types(&mut r, usize::from(frame_type - 251), is_boundary)?;
                (delta, FrameKind::Append(locals))
            }
            255 => {
                let delta = u32::from(r.u16()?);
                let local_count = r.u16()?;
                let locals = read_types(&mut r, usize::from(local_count), is_boundary)?;
                let stack_count = r.u16()?;
                let stack = read_types(&mut r, usize::from(stack_count), is_boundary)?;
                (delta, FrameKind::Full { locals, stack })
            }
            reserved => return Err(r.error(format!("reserved stack map frame type {reserved}"))),
        };

        let offset = match previous {
            None => delta,
            Some(prev) => prev + delta + 1,
        };
        let label = Label(offset);
        if !is_boundary(label) {
            return Err(r.error(format!("stack map frame at {offset} is not an instruction")));
        }
        previous = Some(offset);
        frames.push(StackMapFrame { label, kind });
    }

    if !r.is_empty() {
        return Err(r.error("trailing bytes in StackMapTable"));
    }
    Ok(frames)
}

fn write_type(
    out: &mut Vec<u8>,
    ty: &VerificationType,
    layout: &Layout,
    method: &str,
) -> Result<(), SerializationError> {
    match ty {
        VerificationType::Top => out.push(0),
        VerificationType::Integer => out.push(1),
        VerificationType::Float => out.push(2),
        VerificationType::Double => out.push(3),
        VerificationType::Long => out.push(4),
        VerificationType::Null => out.push(5),
        VerificationType::UninitializedThis => out.push(6),
        VerificationType::Object(index) => {
            out.push(7);
            out.extend_from_slice(&index.to_be_bytes());
        }
        VerificationType::Uninitialized(label) => {
            out.push(8);
            out.extend_from_slice(&(layout.resolve(*label, method)? as u16).to_be_bytes());
        }
    }
    Ok(())
}

fn write_types(
    out: &mut Vec<u8>,
    types: &[VerificationType],
    layout: &Layout,
    method: &str,
) -> Result<(), SerializationError> {
    types.iter().try_for_each(|ty| write_type(out, ty, layout, method))
}

/// Encode frames against a new layout, picking the compact form when the
/// recomputed delta allows it
///
/// # Errors
/// Returns [`SerializationError`] when a frame label no longer resolves or
/// two frames collapse onto the same offset.
pub fn encode(
    frames: &[StackMapFrame],
    layout: &Layout,
    method: &str,
) -> Result<Vec<u8>, SerializationError> {
    let mut out = Vec::new();
    out.extend_from_slice(&(frames.len() as u16).to_be_bytes());
    let mut previous: Option<u32> = None;

    for frame in frames {
        let offset = layout.resolve(frame.label, method)?;
        let delta = match previous {
            None => offset,
            Some(prev) if offset > prev => offset - prev - 1,
            Some(_) => {
                return Err(SerializationError::UnresolvedLabel {
                    method: method.to_string(),
                    label: frame.label.0,
                })
            }
        };
        previous = Some(offset);
        let delta16 = u16::try_from(delta).map_err(|_| SerializationError::CodeTooLarge {
            method: method.to_string(),
            size: offset as usize,
        })?;

        match &frame.kind {
            FrameKind::Same if delta <= 63 => out.push(delta as u8),
            FrameKind::Same => {
                out.push(251);
                out.extend_from_slice(&delta16.to_be_bytes());
            }
            FrameKind::SameLocals1StackItem(ty) => {
                if delta <= 63 {
                    out.push(64 + delta as u8);
                } else {
                    out.push(247);
                    out.extend_from_slice(&delta16.to_be_bytes());
                }
                write_type(&mut out, ty, layout, method)?;
            }
            FrameKind::Chop(k) => {
                out.push(251 - k);
                out.extend_from_slice(&delta16.to_be_bytes());
            }
            FrameKind::Append(locals) => {
                out.push(251 + locals.len() as u8);
                out.extend_from_slice(&delta16.to_be_bytes());
                write_types(&mut out, locals, layout, method)?;
            }
            FrameKind::Full { locals, stack } => {
                out.push(255);
                out.extend_from_slice(&delta16.to_be_bytes());
                out.extend_from_slice(&(locals.len() as u16).to_be_bytes());
                write_types(&mut out, locals, layout, method)?;
                out.extend_from_slice(&(stack.len() as u16).to_be_bytes());
                write_types(&mut out, stack, layout, method)?;
            }
        }
    }

    Ok(out)
}
