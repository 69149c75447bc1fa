//! Code Reader / Code Writer for JVM class files
//!
//! [`parse`] turns class file bytes into a [`CodeUnit`]; [`serialize`] turns a
//! (possibly rewritten) unit back into bytes. Method bodies are held in label
//! form (see [`instruction::Label`]) so the rewriter can insert instructions
//! without touching any offset. The writer recomputes everything the insertion
//! invalidates: offsets, `max_stack`, `max_locals`, stack map frame deltas and
//! the offset-bearing debug tables.
//!
//! A `CodeUnit` lives for a single transform call and is never shared.

pub mod analysis;
pub mod builder;
pub mod constant_pool;
pub mod descriptor;
pub mod frames;
pub mod instruction;
pub mod mutf8;
pub mod opcodes;
pub mod reader;
pub mod writer;

pub use builder::{ClassBuilder, MethodCode};
pub use constant_pool::{Constant, ConstantPool, MemberRef, PoolFull};
pub use frames::{FrameKind, StackMapFrame, VerificationType};
pub use instruction::{Insn, Instruction, Label};
pub use reader::parse;
pub use writer::serialize;

pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_ABSTRACT: u16 = 0x0400;

/// An attribute kept as opaque bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

/// A parsed class
#[derive(Debug, Clone)]
pub struct CodeUnit {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldUnit>,
    pub methods: Vec<MethodUnit>,
    pub attributes: Vec<RawAttribute>,
    /// Internal name (`pkg/Name`), resolved from `this_class`
    pub name: String,
}

impl CodeUnit {
    #[must_use]
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodUnit> {
        self.methods.iter().find(|m| m.name == name && m.descriptor == descriptor)
    }
}

/// Fields are carried through untouched
#[derive(Debug, Clone)]
pub struct FieldUnit {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone)]
pub enum MemberAttribute {
    Code { name_index: u16, body: Box<MethodBody> },
    Other(RawAttribute),
}

#[derive(Debug, Clone)]
pub struct MethodUnit {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub name: String,
    pub descriptor: String,
    pub attributes: Vec<MemberAttribute>,
}

impl MethodUnit {
    /// The decoded `Code` attribute; `None` for abstract and native methods
    #[must_use]
    pub fn body(&self) -> Option<&MethodBody> {
        self.attributes.iter().find_map(|a| match a {
            MemberAttribute::Code { body, .. } => Some(body.as_ref()),
            MemberAttribute::Other(_) => None,
        })
    }

    pub fn body_mut(&mut self) -> Option<&mut MethodBody> {
        self.attributes.iter_mut().find_map(|a| match a {
            MemberAttribute::Code { body, .. } => Some(body.as_mut()),
            MemberAttribute::Other(_) => None,
        })
    }

    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    /// `Name.method(desc)` style identifier for log lines and errors
    #[must_use]
    pub fn display_name(&self, unit: &str) -> String {
        format!("{unit}.{}{}", self.name, self.descriptor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: Label,
    /// Exclusive; may be the body's end label
    pub end: Label,
    pub handler: Label,
    /// 0 catches everything (`finally`)
    pub catch_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    pub start: Label,
    pub line: u16,
}

/// Entry of `LocalVariableTable` or `LocalVariableTypeTable`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariable {
    pub start: Label,
    /// Exclusive; may be the body's end label
    pub end: Label,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

/// Attributes nested in `Code`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeAttribute {
    StackMapTable { name_index: u16, frames: Vec<StackMapFrame> },
    LineNumberTable { name_index: u16, entries: Vec<LineNumber> },
    LocalVariableTable { name_index: u16, entries: Vec<LocalVariable> },
    LocalVariableTypeTable { name_index: u16, entries: Vec<LocalVariable> },
    Other(RawAttribute),
}

/// A decoded `Code` attribute
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub instructions: Vec<Insn>,
    /// Label standing for the offset just past the last original instruction
    pub end: Label,
    pub handlers: Vec<ExceptionHandler>,
    pub attributes: Vec<CodeAttribute>,
    /// Set by the rewriter; unmodified bodies are written back byte for byte
    pub modified: bool,
    pub(crate) original: Vec<u8>,
}

impl MethodBody {
    /// Build a body from scratch (used when generating classes)
    #[must_use]
    pub fn new(max_stack: u16, max_locals: u16, instructions: Vec<Insn>) -> Self {
        Self {
            max_stack,
            max_locals,
            instructions,
            end: Label(u32::MAX),
            handlers: Vec::new(),
            attributes: Vec::new(),
            modified: true,
            original: Vec::new(),
        }
    }

    /// The instruction stream without labels, in order
    pub fn opcodes(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter().map(|i| &i.instruction)
    }

    #[must_use]
    pub fn frames(&self) -> Option<&[StackMapFrame]> {
        self.attributes.iter().find_map(|a| match a {
            CodeAttribute::StackMapTable { frames, .. } => Some(frames.as_slice()),
            _ => None,
        })
    }
}
