//! Probe call templates

use hotprobe_common::{ENTRY_METHOD, EXIT_METHOD, PROBE_DESCRIPTOR, SINK_CLASS};

use crate::classfile::constant_pool::{ConstantPool, PoolFull};
use crate::classfile::{opcodes, Insn, Instruction};

/// Where injected calls go. Holds no state besides the names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Internal name of the class declaring the probe methods
    pub owner: String,
    pub entry_method: String,
    pub exit_method: String,
    /// Shared by both methods, must take two `String`s and return `void`
    pub descriptor: String,
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            owner: SINK_CLASS.to_string(),
            entry_method: ENTRY_METHOD.to_string(),
            exit_method: EXIT_METHOD.to_string(),
            descriptor: PROBE_DESCRIPTOR.to_string(),
        }
    }
}

impl Probe {
    /// Call injected before the first instruction of `method`
    #[must_use]
    pub fn entry_call<'a>(&'a self, unit: &'a str, method: &'a str) -> ProbeCall<'a> {
        ProbeCall { probe: self, target: &self.entry_method, unit, method }
    }

    /// Call injected before every exit instruction of `method`
    #[must_use]
    pub fn exit_call<'a>(&'a self, unit: &'a str, method: &'a str) -> ProbeCall<'a> {
        ProbeCall { probe: self, target: &self.exit_method, unit, method }
    }
}

/// `push(unit); push(method); invokestatic owner.target`
#[derive(Debug, Clone, Copy)]
pub struct ProbeCall<'a> {
    probe: &'a Probe,
    target: &'a str,
    pub unit: &'a str,
    pub method: &'a str,
}

impl ProbeCall<'_> {
    /// Name of the probe method being called
    #[must_use]
    pub fn target(&self) -> &str {
        self.target
    }

    /// Resolve the template against `pool`, interning whatever is missing.
    /// The returned instructions carry no labels and leave the operand stack
    /// as they found it.
    ///
    /// # Errors
    /// Returns [`PoolFull`] when a constant cannot be added.
    pub fn emit(&self, pool: &mut ConstantPool) -> Result<Vec<Insn>, PoolFull> {
        let unit = pool.intern_string(self.unit)?;
        let method = pool.intern_string(self.method)?;
        let target = pool.intern_method_ref(&self.probe.owner, self.target, &self.probe.descriptor)?;
        Ok(vec![
            Insn::new(Instruction::Ldc(unit)),
            Insn::new(Instruction::Ldc(method)),
            Insn::new(Instruction::Member { opcode: opcodes::INVOKESTATIC, index: target }),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_interns_once() {
        let probe = Probe::default();
        let mut pool = ConstantPool::new();
        let first = probe.entry_call("Sample", "run").emit(&mut pool).unwrap();
        let count = pool.count();
        let second = probe.entry_call("Sample", "run").emit(&mut pool).unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.count(), count);
    }

    #[test]
    fn test_entry_and_exit_target_different_methods() {
        let probe = Probe::default();
        let mut pool = ConstantPool::new();
        let entry = probe.entry_call("Sample", "run").emit(&mut pool).unwrap();
        let exit = probe.exit_call("Sample", "run").emit(&mut pool).unwrap();
        assert_eq!(entry[..2], exit[..2]);
        assert_ne!(entry[2], exit[2]);

        let Instruction::Member { index, .. } = exit[2].instruction else {
            panic!("expected invokestatic");
        };
        let member = pool.member_ref(index).unwrap();
        assert_eq!(member.owner, "hotprobe/ProbeSink");
        assert_eq!(member.name, "end");
        assert_eq!(member.descriptor, PROBE_DESCRIPTOR);
    }
}
