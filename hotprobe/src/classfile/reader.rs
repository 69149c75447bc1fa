//! Code Reader: class file bytes → [`CodeUnit`]
//!
//! Parsing never panics on hostile input; every structural problem becomes a
//! [`MalformedInput`] carrying the byte offset where it was detected.

use std::collections::HashSet;

use super::constant_pool::{Constant, ConstantPool};
use super::frames;
use super::instruction::{self, Label};
use super::{
    CodeAttribute, CodeUnit, ExceptionHandler, FieldUnit, LineNumber, LocalVariable,
    MemberAttribute, MethodBody, MethodUnit, RawAttribute,
};
use crate::domain::MalformedInput;

const MAGIC: u32 = 0xCAFE_BABE;

/// Big-endian cursor over a byte slice
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Offset of `data[0]` within the whole class file, for error messages
    base: usize,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_base(data, 0)
    }

    #[must_use]
    pub fn with_base(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn absolute(&self) -> usize {
        self.base + self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn error(&self, reason: impl Into<String>) -> MalformedInput {
        MalformedInput::new(self.absolute(), reason)
    }

    /// # Errors
    /// Returns [`MalformedInput`] if fewer than `n` bytes remain.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], MalformedInput> {
        if n > self.remaining() {
            return Err(self.error(format!("unexpected end of data, wanted {n} bytes")));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// # Errors
    /// Returns [`MalformedInput`] if fewer than `n` bytes remain.
    pub fn skip(&mut self, n: usize) -> Result<(), MalformedInput> {
        self.bytes(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], MalformedInput> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    /// # Errors
    /// Returns [`MalformedInput`] at end of data.
    pub fn u8(&mut self) -> Result<u8, MalformedInput> {
        Ok(self.array::<1>()?[0])
    }

    /// # Errors
    /// Returns [`MalformedInput`] at end of data.
    pub fn i8(&mut self) -> Result<i8, MalformedInput> {
        Ok(i8::from_be_bytes(self.array()?))
    }

    /// # Errors
    /// Returns [`MalformedInput`] at end of data.
    pub fn u16(&mut self) -> Result<u16, MalformedInput> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    /// # Errors
    /// Returns [`MalformedInput`] at end of data.
    pub fn i16(&mut self) -> Result<i16, MalformedInput> {
        Ok(i16::from_be_bytes(self.array()?))
    }

    /// # Errors
    /// Returns [`MalformedInput`] at end of data.
    pub fn u32(&mut self) -> Result<u32, MalformedInput> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// # Errors
    /// Returns [`MalformedInput`] at end of data.
    pub fn i32(&mut self) -> Result<i32, MalformedInput> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    /// # Errors
    /// Returns [`MalformedInput`] at end of data.
    pub fn u64(&mut self) -> Result<u64, MalformedInput> {
        Ok(u64::from_be_bytes(self.array()?))
    }
}

/// Parse a class file
///
/// # Errors
/// Returns [`MalformedInput`] if the bytes are not a well-formed class file.
pub fn parse(bytes: &[u8]) -> Result<CodeUnit, MalformedInput> {
    let mut r = ByteReader::new(bytes);

    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(MalformedInput::new(0, format!("bad magic 0x{magic:08x}")));
    }
    let minor_version = r.u16()?;
    let major_version = r.u16()?;
    let constant_pool = read_constant_pool(&mut r)?;

    let access_flags = r.u16()?;
    let this_class = r.u16()?;
    let super_class = r.u16()?;
    let name = constant_pool
        .class_name(this_class)
        .ok_or_else(|| r.error(format!("this_class #{this_class} is not a class constant")))?;

    let interface_count = r.u16()?;
    let mut interfaces = Vec::with_capacity(usize::from(interface_count));
    for _ in 0..interface_count {
        interfaces.push(r.u16()?);
    }

    let field_count = r.u16()?;
    let mut fields = Vec::with_capacity(usize::from(field_count));
    for _ in 0..field_count {
        fields.push(FieldUnit {
            access_flags: r.u16()?,
            name_index: r.u16()?,
            descriptor_index: r.u16()?,
            attributes: read_raw_attributes(&mut r)?,
        });
    }

    let method_count = r.u16()?;
    let mut methods = Vec::with_capacity(usize::from(method_count));
    for _ in 0..method_count {
        methods.push(read_method(&mut r, &constant_pool)?);
    }

    let attributes = read_raw_attributes(&mut r)?;

    if !r.is_empty() {
        return Err(r.error(format!("{} trailing bytes after class attributes", r.remaining())));
    }

    Ok(CodeUnit {
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
        name,
    })
}

fn read_constant_pool(r: &mut ByteReader<'_>) -> Result<ConstantPool, MalformedInput> {
    let count = r.u16()?;
    if count == 0 {
        return Err(r.error("constant_pool_count is zero"));
    }

    let mut entries: Vec<Option<Constant>> = Vec::with_capacity(usize::from(count));
    entries.push(None);

    while entries.len() < usize::from(count) {
        let tag = r.u8()?;
        let constant = match tag {
            1 => {
                let len = r.u16()?;
                Constant::Utf8(r.bytes(usize::from(len))?.to_vec())
            }
            3 => Constant::Integer(r.i32()?),
            4 => Constant::Float(r.u32()?),
            5 => Constant::Long(r.u64()? as i64),
            6 => Constant::Double(r.u64()?),
            7 => Constant::Class { name_index: r.u16()? },
            8 => Constant::String { string_index: r.u16()? },
            9 => Constant::Fieldref { class_index: r.u16()?, name_and_type_index: r.u16()? },
            10 => Constant::Methodref { class_index: r.u16()?, name_and_type_index: r.u16()? },
            11 => Constant::InterfaceMethodref {
                class_index: r.u16()?,
                name_and_type_index: r.u16()?,
            },
            12 => Constant::NameAndType { name_index: r.u16()?, descriptor_index: r.u16()? },
            15 => Constant::MethodHandle { reference_kind: r.u8()?, reference_index: r.u16()? },
            16 => Constant::MethodType { descriptor_index: r.u16()? },
            17 => Constant::Dynamic {
                bootstrap_method_attr_index: r.u16()?,
                name_and_type_index: r.u16()?,
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method_attr_index: r.u16()?,
                name_and_type_index: r.u16()?,
            },
            19 => Constant::Module { name_index: r.u16()? },
            20 => Constant::Package { name_index: r.u16()? },
            other => return Err(r.error(format!("unknown constant pool tag {other}"))),
        };

        let wide = constant.is_wide();
        entries.push(Some(constant));
        if wide {
            if entries.len() >= usize::from(count) {
                return Err(r.error("long/double constant in the last pool slot"));
            }
            entries.push(None);
        }
    }

    Ok(ConstantPool::from_entries(entries))
}

fn read_raw_attributes(r: &mut ByteReader<'_>) -> Result<Vec<RawAttribute>, MalformedInput> {
    let count = r.u16()?;
    let mut attributes = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let name_index = r.u16()?;
        let len = r.u32()? as usize;
        attributes.push(RawAttribute { name_index, info: r.bytes(len)?.to_vec() });
    }
    Ok(attributes)
}

fn read_method(r: &mut ByteReader<'_>, pool: &ConstantPool) -> Result<MethodUnit, MalformedInput> {
    let access_flags = r.u16()?;
    let name_index = r.u16()?;
    let descriptor_index = r.u16()?;
    let name = pool
        .utf8(name_index)
        .ok_or_else(|| r.error(format!("method name #{name_index} is not a Utf8 constant")))?;
    let descriptor = pool.utf8(descriptor_index).ok_or_else(|| {
        r.error(format!("method descriptor #{descriptor_index} is not a Utf8 constant"))
    })?;

    let count = r.u16()?;
    let mut attributes = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let attr_name_index = r.u16()?;
        let len = r.u32()? as usize;
        let at = r.absolute();
        let info = r.bytes(len)?;
        if pool.utf8(attr_name_index).as_deref() == Some("Code") {
            let body = read_code(info, at, pool)?;
            attributes.push(MemberAttribute::Code { name_index: attr_name_index, body: Box::new(body) });
        } else {
            attributes.push(MemberAttribute::Other(RawAttribute {
                name_index: attr_name_index,
                info: info.to_vec(),
            }));
        }
    }

    Ok(MethodUnit { access_flags, name_index, descriptor_index, name, descriptor, attributes })
}

fn read_code(info: &[u8], base: usize, pool: &ConstantPool) -> Result<MethodBody, MalformedInput> {
    let mut r = ByteReader::with_base(info, base);
    let max_stack = r.u16()?;
    let max_locals = r.u16()?;
    let code_length = r.u32()? as usize;
    if code_length == 0 || code_length > usize::from(u16::MAX) {
        return Err(r.error(format!("invalid code_length {code_length}")));
    }
    let code_base = r.absolute();
    let code = r.bytes(code_length)?;
    let instructions = instruction::decode(code, code_base)?;

    let end = Label(code_length as u32);
    let boundaries: HashSet<Label> = instructions.iter().filter_map(|i| i.label).collect();
    let is_boundary = |label: Label| boundaries.contains(&label);
    let is_boundary_or_end = |label: Label| label == end || boundaries.contains(&label);

    let handler_count = r.u16()?;
    let mut handlers = Vec::with_capacity(usize::from(handler_count));
    for _ in 0..handler_count {
        let handler = ExceptionHandler {
            start: Label(u32::from(r.u16()?)),
            end: Label(u32::from(r.u16()?)),
            handler: Label(u32::from(r.u16()?)),
            catch_type: r.u16()?,
        };
        if !is_boundary(handler.start)
            || !is_boundary_or_end(handler.end)
            || !is_boundary(handler.handler)
            || handler.start >= handler.end
        {
            return Err(r.error(format!(
                "exception handler [{}, {}) -> {} does not match instruction boundaries",
                handler.start.0, handler.end.0, handler.handler.0
            )));
        }
        handlers.push(handler);
    }

    let attribute_count = r.u16()?;
    let mut attributes = Vec::with_capacity(usize::from(attribute_count));
    for _ in 0..attribute_count {
        let name_index = r.u16()?;
        let len = r.u32()? as usize;
        let at = r.absolute();
        let data = r.bytes(len)?;
        let attribute = match pool.utf8(name_index).as_deref() {
            Some("StackMapTable") => CodeAttribute::StackMapTable {
                name_index,
                frames: frames::decode(data, at, &is_boundary)?,
            },
            Some("LineNumberTable") => CodeAttribute::LineNumberTable {
                name_index,
                entries: read_line_numbers(data, at, &is_boundary)?,
            },
            Some("LocalVariableTable") => CodeAttribute::LocalVariableTable {
                name_index,
                entries: read_local_variables(data, at, &is_boundary, &is_boundary_or_end)?,
            },
            Some("LocalVariableTypeTable") => CodeAttribute::LocalVariableTypeTable {
                name_index,
                entries: read_local_variables(data, at, &is_boundary, &is_boundary_or_end)?,
            },
            _ => CodeAttribute::Other(RawAttribute { name_index, info: data.to_vec() }),
        };
        attributes.push(attribute);
    }

    if !r.is_empty() {
        return Err(r.error("trailing bytes in Code attribute"));
    }

    Ok(MethodBody {
        max_stack,
        max_locals,
        instructions,
        end,
        handlers,
        attributes,
        modified: false,
        original: info.to_vec(),
    })
}

/// Entries that do not start an instruction are dropped; line numbers are
/// debugging aids and HotSpot tolerates their absence.
fn read_line_numbers(
    data: &[u8],
    base: usize,
    is_boundary: &dyn Fn(Label) -> bool,
) -> Result<Vec<LineNumber>, MalformedInput> {
    let mut r = ByteReader::with_base(data, base);
    let count = r.u16()?;
    let mut entries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let start = Label(u32::from(r.u16()?));
        let line = r.u16()?;
        if is_boundary(start) {
            entries.push(LineNumber { start, line });
        }
    }
    Ok(entries)
}

fn read_local_variables(
    data: &[u8],
    base: usize,
    is_boundary: &dyn Fn(Label) -> bool,
    is_boundary_or_end: &dyn Fn(Label) -> bool,
) -> Result<Vec<LocalVariable>, MalformedInput> {
    let mut r = ByteReader::with_base(data, base);
    let count = r.u16()?;
    let mut entries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let start_pc = u32::from(r.u16()?);
        let length = u32::from(r.u16()?);
        let entry = LocalVariable {
            start: Label(start_pc),
            end: Label(start_pc + length),
            name_index: r.u16()?,
            descriptor_index: r.u16()?,
            index: r.u16()?,
        };
        if is_boundary(entry.start) && is_boundary_or_end(entry.end) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        let err = parse(&[]).unwrap_err();
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn test_bad_magic() {
        let err = parse(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 52]).unwrap_err();
        assert!(err.reason.contains("bad magic"));
    }

    #[test]
    fn test_truncated_constant_pool() {
        // magic, version 52, pool count 3, one Utf8 of length 10 with 2 bytes present
        let bytes = [0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52, 0, 3, 1, 0, 10, b'a', b'b'];
        let err = parse(&bytes).unwrap_err();
        assert!(err.reason.contains("unexpected end"));
    }

    #[test]
    fn test_unknown_tag() {
        let bytes = [0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52, 0, 2, 99];
        let err = parse(&bytes).unwrap_err();
        assert_eq!(err.offset, 11);
        assert!(err.reason.contains("tag 99"));
    }

    #[test]
    fn test_reader_primitives() {
        let mut r = ByteReader::new(&[0xff, 0x80, 0x00, 0x12, 0x34]);
        assert_eq!(r.i8().unwrap(), -1);
        assert_eq!(r.i16().unwrap(), -32768);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert!(r.u8().is_err());
    }
}
