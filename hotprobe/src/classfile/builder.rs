//! Generating classes from scratch
//!
//! Used for the probe sink class the agent defines in the target VM, and by
//! tests to produce fixtures without a Java compiler.

use super::constant_pool::{ConstantPool, PoolFull};
use super::{CodeUnit, ExceptionHandler, Insn, Label, MemberAttribute, MethodBody, MethodUnit};

/// Class file version 52 (Java 8), the oldest that requires stack map frames
pub const DEFAULT_MAJOR_VERSION: u16 = 52;

const ACC_PUBLIC_SUPER: u16 = 0x0021;

/// Code for one generated method. Instructions that are branch or handler
/// targets must carry labels.
#[derive(Debug, Clone, Default)]
pub struct MethodCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub instructions: Vec<Insn>,
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodCode {
    #[must_use]
    pub fn new(instructions: Vec<Insn>) -> Self {
        Self { instructions, ..Self::default() }
    }

    #[must_use]
    pub fn with_handler(mut self, start: Label, end: Label, handler: Label, catch_type: u16) -> Self {
        self.handlers.push(ExceptionHandler { start, end, handler, catch_type });
        self
    }
}

pub struct ClassBuilder {
    unit: CodeUnit,
}

impl ClassBuilder {
    /// # Errors
    /// Returns [`PoolFull`] if the pool overflows (never for a fresh pool).
    pub fn new(name: &str, super_name: &str) -> Result<Self, PoolFull> {
        let mut pool = ConstantPool::new();
        let this_class = pool.intern_class(name)?;
        let super_class = pool.intern_class(super_name)?;
        Ok(Self {
            unit: CodeUnit {
                minor_version: 0,
                major_version: DEFAULT_MAJOR_VERSION,
                constant_pool: pool,
                access_flags: ACC_PUBLIC_SUPER,
                this_class,
                super_class,
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                attributes: Vec::new(),
                name: name.to_string(),
            },
        })
    }

    #[must_use]
    pub fn version(mut self, major: u16) -> Self {
        self.unit.major_version = major;
        self
    }

    /// Mutable pool, for interning constants referenced by method code
    pub fn pool(&mut self) -> &mut ConstantPool {
        &mut self.unit.constant_pool
    }

    /// Add a method. `code` is `None` for native and abstract methods.
    ///
    /// # Errors
    /// Returns [`PoolFull`] when the names cannot be interned.
    pub fn method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Option<MethodCode>,
    ) -> Result<&mut Self, PoolFull> {
        let pool = &mut self.unit.constant_pool;
        let name_index = pool.intern_utf8(name)?;
        let descriptor_index = pool.intern_utf8(descriptor)?;
        let mut attributes = Vec::new();
        if let Some(code) = code {
            let code_index = pool.intern_utf8("Code")?;
            let mut body = MethodBody::new(code.max_stack, code.max_locals, code.instructions);
            body.handlers = code.handlers;
            attributes.push(MemberAttribute::Code { name_index: code_index, body: Box::new(body) });
        }
        self.unit.methods.push(MethodUnit {
            access_flags,
            name_index,
            descriptor_index,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            attributes,
        });
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> CodeUnit {
        self.unit
    }
}

/// Label every instruction with its position, for hand-written fixtures
#[must_use]
pub fn labelled(instructions: Vec<super::Instruction>) -> Vec<Insn> {
    instructions
        .into_iter()
        .enumerate()
        .map(|(i, instruction)| Insn { label: Some(Label(u32::try_from(i).unwrap_or(u32::MAX))), instruction })
        .collect()
}
