//! Exit-point discovery

use crate::classfile::{opcodes, MethodBody};

/// An instruction that ends the method's activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPoint {
    /// Position in the body's instruction list
    pub index: usize,
    pub opcode: u8,
}

impl ExitPoint {
    /// `athrow` rather than one of the return variants
    #[must_use]
    pub fn is_throw(&self) -> bool {
        self.opcode == opcodes::ATHROW
    }
}

/// Every return variant and every `athrow`, wherever it sits in the body.
/// Classification is by opcode alone, so exits inside protected ranges and
/// unreachable ones are found too.
#[must_use]
pub fn discover_exit_points(body: &MethodBody) -> Vec<ExitPoint> {
    body.opcodes()
        .enumerate()
        .filter(|(_, instruction)| opcodes::is_exit(instruction.opcode()))
        .map(|(index, instruction)| ExitPoint { index, opcode: instruction.opcode() })
        .collect()
}
