//! Code Writer: [`CodeUnit`] → class file bytes
//!
//! Bodies the rewriter did not touch are copied verbatim. Modified bodies are
//! laid out again and every derived value is recomputed from the new layout.

#![allow(clippy::cast_possible_truncation)]

use log::debug;

use super::analysis;
use super::constant_pool::{Constant, ConstantPool};
use super::frames;
use super::instruction::{self, Layout};
use super::{
    CodeAttribute, CodeUnit, LocalVariable, MemberAttribute, MethodBody, MethodUnit, RawAttribute,
};
use crate::domain::SerializationError;

/// Big-endian output buffer
#[derive(Default)]
struct ByteWriter {
    out: Vec<u8>,
}

impl ByteWriter {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }

    fn count(&mut self, n: usize, what: &'static str) -> Result<(), SerializationError> {
        let n16 = u16::try_from(n).map_err(|_| SerializationError::TooManyEntries { what, count: n })?;
        self.u16(n16);
        Ok(())
    }

    fn attribute(&mut self, name_index: u16, info: &[u8]) -> Result<(), SerializationError> {
        let len = u32::try_from(info.len()).map_err(|_| SerializationError::TooManyEntries {
            what: "attribute bytes",
            count: info.len(),
        })?;
        self.u16(name_index);
        self.u32(len);
        self.bytes(info);
        Ok(())
    }
}

/// Serialize a class
///
/// # Errors
/// Returns [`SerializationError`] when a modified body cannot be laid out or
/// analysed, or a table outgrows its length field.
pub fn serialize(unit: &CodeUnit) -> Result<Vec<u8>, SerializationError> {
    let mut w = ByteWriter::default();
    w.u32(0xCAFE_BABE);
    w.u16(unit.minor_version);
    w.u16(unit.major_version);
    write_constant_pool(&mut w, &unit.constant_pool)?;

    w.u16(unit.access_flags);
    w.u16(unit.this_class);
    w.u16(unit.super_class);
    w.count(unit.interfaces.len(), "interfaces")?;
    for &interface in &unit.interfaces {
        w.u16(interface);
    }

    w.count(unit.fields.len(), "fields")?;
    for field in &unit.fields {
        w.u16(field.access_flags);
        w.u16(field.name_index);
        w.u16(field.descriptor_index);
        write_raw_attributes(&mut w, &field.attributes)?;
    }

    w.count(unit.methods.len(), "methods")?;
    for method in &unit.methods {
        write_method(&mut w, method, unit)?;
    }

    write_raw_attributes(&mut w, &unit.attributes)?;
    Ok(w.out)
}

fn write_constant_pool(w: &mut ByteWriter, pool: &ConstantPool) -> Result<(), SerializationError> {
    w.count(pool.count(), "constant pool entries")?;
    for constant in pool.entries().iter().flatten() {
        match constant {
            Constant::Utf8(bytes) => {
                w.u8(1);
                w.count(bytes.len(), "Utf8 bytes")?;
                w.bytes(bytes);
            }
            Constant::Integer(v) => {
                w.u8(3);
                w.bytes(&v.to_be_bytes());
            }
            Constant::Float(bits) => {
                w.u8(4);
                w.u32(*bits);
            }
            Constant::Long(v) => {
                w.u8(5);
                w.bytes(&v.to_be_bytes());
            }
            Constant::Double(bits) => {
                w.u8(6);
                w.bytes(&bits.to_be_bytes());
            }
            Constant::Class { name_index } => {
                w.u8(7);
                w.u16(*name_index);
            }
            Constant::String { string_index } => {
                w.u8(8);
                w.u16(*string_index);
            }
            Constant::Fieldref { class_index, name_and_type_index } => {
                w.u8(9);
                w.u16(*class_index);
                w.u16(*name_and_type_index);
            }
            Constant::Methodref { class_index, name_and_type_index } => {
                w.u8(10);
                w.u16(*class_index);
                w.u16(*name_and_type_index);
            }
            Constant::InterfaceMethodref { class_index, name_and_type_index } => {
                w.u8(11);
                w.u16(*class_index);
                w.u16(*name_and_type_index);
            }
            Constant::NameAndType { name_index, descriptor_index } => {
                w.u8(12);
                w.u16(*name_index);
                w.u16(*descriptor_index);
            }
            Constant::MethodHandle { reference_kind, reference_index } => {
                w.u8(15);
                w.u8(*reference_kind);
                w.u16(*reference_index);
            }
            Constant::MethodType { descriptor_index } => {
                w.u8(16);
                w.u16(*descriptor_index);
            }
            Constant::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                w.u8(17);
                w.u16(*bootstrap_method_attr_index);
                w.u16(*name_and_type_index);
            }
            Constant::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                w.u8(18);
                w.u16(*bootstrap_method_attr_index);
                w.u16(*name_and_type_index);
            }
            Constant::Module { name_index } => {
                w.u8(19);
                w.u16(*name_index);
            }
            Constant::Package { name_index } => {
                w.u8(20);
                w.u16(*name_index);
            }
        }
    }
    Ok(())
}

fn write_raw_attributes(w: &mut ByteWriter, attributes: &[RawAttribute]) -> Result<(), SerializationError> {
    w.count(attributes.len(), "attributes")?;
    for attribute in attributes {
        w.attribute(attribute.name_index, &attribute.info)?;
    }
    Ok(())
}

fn write_method(w: &mut ByteWriter, method: &MethodUnit, unit: &CodeUnit) -> Result<(), SerializationError> {
    w.u16(method.access_flags);
    w.u16(method.name_index);
    w.u16(method.descriptor_index);
    w.count(method.attributes.len(), "method attributes")?;
    for attribute in &method.attributes {
        match attribute {
            MemberAttribute::Code { name_index, body } => {
                let info = if body.modified {
                    encode_body(body, method, unit)?
                } else {
                    body.original.clone()
                };
                w.attribute(*name_index, &info)?;
            }
            MemberAttribute::Other(raw) => w.attribute(raw.name_index, &raw.info)?,
        }
    }
    Ok(())
}

/// Re-encode a `Code` attribute body from its label form
fn encode_body(body: &MethodBody, method: &MethodUnit, unit: &CodeUnit) -> Result<Vec<u8>, SerializationError> {
    let name = method.display_name(&unit.name);
    let layout = instruction::layout(&body.instructions, body.end);
    let code = instruction::encode(&body.instructions, &layout, &name)?;

    let max_stack = if analysis::uses_subroutines(body) {
        // Probe calls push at most two words over whatever is on the stack
        body.max_stack.saturating_add(2)
    } else {
        // Never shrink below the compiler's value
        analysis::max_stack(body, &unit.constant_pool, &name)?.max(body.max_stack)
    };
    let max_locals =
        analysis::max_locals(body, method.access_flags, &method.descriptor).max(body.max_locals);
    debug!("{name}: max_stack {} -> {max_stack}, code {} bytes", body.max_stack, code.len());

    let mut w = ByteWriter::default();
    w.u16(max_stack);
    w.u16(max_locals);
    w.u32(code.len() as u32);
    w.bytes(&code);

    w.count(body.handlers.len(), "exception handlers")?;
    for handler in &body.handlers {
        w.u16(layout.resolve(handler.start, &name)? as u16);
        w.u16(layout.resolve(handler.end, &name)? as u16);
        w.u16(layout.resolve(handler.handler, &name)? as u16);
        w.u16(handler.catch_type);
    }

    // Type annotations on code point at offsets we cannot remap, drop them
    let attributes: Vec<&CodeAttribute> = body
        .attributes
        .iter()
        .filter(|a| match a {
            CodeAttribute::Other(raw) => !matches!(
                unit.constant_pool.utf8(raw.name_index).as_deref(),
                Some("RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations")
            ),
            _ => true,
        })
        .collect();
    w.count(attributes.len(), "code attributes")?;
    for attribute in attributes {
        match attribute {
            CodeAttribute::StackMapTable { name_index, frames } => {
                w.attribute(*name_index, &frames::encode(frames, &layout, &name)?)?;
            }
            CodeAttribute::LineNumberTable { name_index, entries } => {
                let mut t = ByteWriter::default();
                t.count(entries.len(), "line numbers")?;
                for entry in entries {
                    t.u16(layout.resolve(entry.start, &name)? as u16);
                    t.u16(entry.line);
                }
                w.attribute(*name_index, &t.out)?;
            }
            CodeAttribute::LocalVariableTable { name_index, entries }
            | CodeAttribute::LocalVariableTypeTable { name_index, entries } => {
                w.attribute(*name_index, &encode_local_variables(entries, &layout, &name)?)?;
            }
            CodeAttribute::Other(raw) => w.attribute(raw.name_index, &raw.info)?,
        }
    }

    Ok(w.out)
}

fn encode_local_variables(
    entries: &[LocalVariable],
    layout: &Layout,
    method: &str,
) -> Result<Vec<u8>, SerializationError> {
    let mut t = ByteWriter::default();
    t.count(entries.len(), "local variables")?;
    for entry in entries {
        let start = layout.resolve(entry.start, method)?;
        let end = layout.resolve(entry.end, method)?;
        t.u16(start as u16);
        t.u16(end.saturating_sub(start) as u16);
        t.u16(entry.name_index);
        t.u16(entry.descriptor_index);
        t.u16(entry.index);
    }
    Ok(t.out)
}
