//! The class constant pool
//!
//! Entries keep their original numbering so every index stored elsewhere in the
//! class stays valid. New entries are only ever appended.

use thiserror::Error;

use super::mutf8;

/// One `cp_info` entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Raw modified UTF-8 bytes, decoded on demand so unpaired surrogates survive
    Utf8(Vec<u8>),
    Integer(i32),
    /// Raw IEEE bits, keeps NaN payloads intact
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

impl Constant {
    /// `CONSTANT_Long` and `CONSTANT_Double` take two pool slots
    #[must_use]
    pub fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// A resolved field or method reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

/// The pool was already at its 65535 entry limit
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("constant pool is full (65535 entries)")]
pub struct PoolFull;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    /// Slot 0 and the slot after each long/double are `None`
    entries: Vec<Option<Constant>>,
}

impl ConstantPool {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: vec![None] }
    }

    pub(crate) fn from_entries(entries: Vec<Option<Constant>>) -> Self {
        Self { entries }
    }

    /// The `constant_pool_count` value: one more than the highest index
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Iterate `(index, entry)` over occupied slots
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i as u16, c)))
    }

    #[must_use]
    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.entries.get(usize::from(index))?.as_ref()
    }

    #[must_use]
    pub fn utf8(&self, index: u16) -> Option<String> {
        match self.get(index)? {
            Constant::Utf8(bytes) => mutf8::decode(bytes),
            _ => None,
        }
    }

    /// Internal name behind a `CONSTANT_Class`
    #[must_use]
    pub fn class_name(&self, index: u16) -> Option<String> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => None,
        }
    }

    #[must_use]
    pub fn name_and_type(&self, index: u16) -> Option<(String, String)> {
        match self.get(index)? {
            Constant::NameAndType { name_index, descriptor_index } => {
                Some((self.utf8(*name_index)?, self.utf8(*descriptor_index)?))
            }
            _ => None,
        }
    }

    /// Resolve a field, method or interface method reference
    #[must_use]
    pub fn member_ref(&self, index: u16) -> Option<MemberRef> {
        let (class_index, nat_index) = match self.get(index)? {
            Constant::Fieldref { class_index, name_and_type_index }
            | Constant::Methodref { class_index, name_and_type_index }
            | Constant::InterfaceMethodref { class_index, name_and_type_index } => {
                (*class_index, *name_and_type_index)
            }
            _ => return None,
        };
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Some(MemberRef { owner: self.class_name(class_index)?, name, descriptor })
    }

    /// Descriptor of the call site behind a `CONSTANT_InvokeDynamic`
    #[must_use]
    pub fn invoke_dynamic_descriptor(&self, index: u16) -> Option<String> {
        match self.get(index)? {
            Constant::InvokeDynamic { name_and_type_index, .. } => {
                self.name_and_type(*name_and_type_index).map(|(_, d)| d)
            }
            _ => None,
        }
    }

    /// Append an entry, returning its index
    ///
    /// # Errors
    /// Returns [`PoolFull`] when the entry would not be addressable by a `u16`.
    pub fn push(&mut self, constant: Constant) -> Result<u16, PoolFull> {
        let needed = if constant.is_wide() { 2 } else { 1 };
        if self.entries.len() + needed > usize::from(u16::MAX) {
            return Err(PoolFull);
        }
        let index = self.entries.len() as u16;
        let wide = constant.is_wide();
        self.entries.push(Some(constant));
        if wide {
            self.entries.push(None);
        }
        Ok(index)
    }

    fn find_or_push(&mut self, constant: Constant) -> Result<u16, PoolFull> {
        if let Some((index, _)) = self.iter().find(|(_, c)| **c == constant) {
            return Ok(index);
        }
        self.push(constant)
    }

    /// Index of a `CONSTANT_Utf8` holding `value`, adding one if absent
    ///
    /// # Errors
    /// Returns [`PoolFull`] when the pool has no room left.
    pub fn intern_utf8(&mut self, value: &str) -> Result<u16, PoolFull> {
        self.find_or_push(Constant::Utf8(mutf8::encode(value)))
    }

    /// # Errors
    /// Returns [`PoolFull`] when the pool has no room left.
    pub fn intern_string(&mut self, value: &str) -> Result<u16, PoolFull> {
        let string_index = self.intern_utf8(value)?;
        self.find_or_push(Constant::String { string_index })
    }

    /// # Errors
    /// Returns [`PoolFull`] when the pool has no room left.
    pub fn intern_class(&mut self, internal_name: &str) -> Result<u16, PoolFull> {
        let name_index = self.intern_utf8(internal_name)?;
        self.find_or_push(Constant::Class { name_index })
    }

    /// # Errors
    /// Returns [`PoolFull`] when the pool has no room left.
    pub fn intern_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, PoolFull> {
        let class_index = self.intern_class(owner)?;
        let name_index = self.intern_utf8(name)?;
        let descriptor_index = self.intern_utf8(descriptor)?;
        let name_and_type_index =
            self.find_or_push(Constant::NameAndType { name_index, descriptor_index })?;
        self.find_or_push(Constant::Methodref { class_index, name_and_type_index })
    }

    pub(crate) fn entries(&self) -> &[Option<Constant>] {
        &self.entries
    }
}
