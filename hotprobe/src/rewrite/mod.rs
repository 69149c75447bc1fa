//! Method Probe Rewriter
//!
//! Splices probe calls into every method of a [`CodeUnit`]:
//!
//! ```text
//! ldc "pkg/Unit"; ldc "method"; invokestatic ProbeSink.start   <- before the first instruction
//! ...
//! ldc "pkg/Unit"; ldc "method"; invokestatic ProbeSink.end     <- before every return / athrow
//! ireturn
//! ```
//!
//! The rewrite is a pipeline of functions over snapshots:
//! [`intern_probe_constants`] → [`insert_entry_probe`] → [`insert_exit_probes`].
//! Each step takes the previous snapshot by reference and returns a new one;
//! nothing is patched in place.
//!
//! Inserted calls are stack-neutral, so stack map frames keep their contents.
//! An exit probe takes over the label of the exit instruction it precedes, which
//! moves every branch, handler bound, frame and line number that pointed at the
//! exit onto the probe. The entry probe gets no label: a loop jumping back to
//! the first instruction must not record a second `start`.

pub mod exits;
pub mod probe;

pub use exits::{discover_exit_points, ExitPoint};
pub use probe::{Probe, ProbeCall};

use log::debug;

use crate::classfile::{self, CodeUnit, ConstantPool, Insn, MemberAttribute, MethodBody, MethodUnit};
use crate::domain::{RewriteError, TransformError};

/// Probe instructions for one method, resolved against the unit's pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSequences {
    pub entry: Vec<Insn>,
    pub exit: Vec<Insn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodReport {
    pub name: String,
    pub descriptor: String,
    pub exit_points: usize,
}

/// What [`instrument_unit`] did to one class
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentReport {
    pub unit: String,
    pub instrumented: Vec<MethodReport>,
    /// `name+descriptor` of methods without code (abstract, native)
    pub skipped: Vec<String>,
}

impl InstrumentReport {
    /// Number of probe calls inserted across all methods
    #[must_use]
    pub fn probe_calls(&self) -> usize {
        self.instrumented.iter().map(|m| 1 + m.exit_points).sum()
    }
}

/// Step 1: a new pool holding every constant the probes reference, plus the
/// resolved sequences for each method. `None` marks methods without code.
///
/// # Errors
/// Returns [`RewriteError::ConstantPoolFull`] if the pool cannot take the
/// extra entries.
pub fn intern_probe_constants(
    unit: &CodeUnit,
    probe: &Probe,
) -> Result<(ConstantPool, Vec<Option<ProbeSequences>>), RewriteError> {
    let mut pool = unit.constant_pool.clone();
    let mut sequences = Vec::with_capacity(unit.methods.len());

    for method in &unit.methods {
        if method.body().is_none() {
            sequences.push(None);
            continue;
        }
        let entry = probe.entry_call(&unit.name, &method.name).emit(&mut pool);
        let exit = probe.exit_call(&unit.name, &method.name).emit(&mut pool);
        match (entry, exit) {
            (Ok(entry), Ok(exit)) => sequences.push(Some(ProbeSequences { entry, exit })),
            _ => return Err(RewriteError::ConstantPoolFull),
        }
    }

    Ok((pool, sequences))
}

/// Step 2: the entry sequence in front of the first instruction
#[must_use]
pub fn insert_entry_probe(body: &MethodBody, entry: &[Insn]) -> MethodBody {
    let mut instructions = Vec::with_capacity(entry.len() + body.instructions.len());
    instructions.extend(entry.iter().map(|insn| Insn::new(insn.instruction.clone())));
    instructions.extend(body.instructions.iter().cloned());
    MethodBody { instructions, modified: true, ..body.clone() }
}

/// Step 3: the exit sequence in front of each exit point. `exits` must come
/// from [`discover_exit_points`] on this same `body`.
#[must_use]
pub fn insert_exit_probes(body: &MethodBody, exit: &[Insn], exits: &[ExitPoint]) -> MethodBody {
    let mut instructions = Vec::with_capacity(body.instructions.len() + exit.len() * exits.len());
    let mut pending = exits.iter().map(|e| e.index).peekable();

    for (index, insn) in body.instructions.iter().enumerate() {
        let mut insn = insn.clone();
        if pending.next_if_eq(&index).is_some() {
            for (i, call) in exit.iter().enumerate() {
                let label = if i == 0 { insn.label.take() } else { None };
                instructions.push(Insn { label, instruction: call.instruction.clone() });
            }
        }
        instructions.push(insn);
    }

    MethodBody { instructions, modified: true, ..body.clone() }
}

/// Check a rewritten body against the one it came from: the entry call comes
/// first and the original instructions survive in their original order.
fn verify(original: &MethodBody, rewritten: &MethodBody, sequences: &ProbeSequences, method: &str) -> Result<(), RewriteError> {
    let leading = rewritten.instructions.iter().take(sequences.entry.len());
    if !leading.map(|i| &i.instruction).eq(sequences.entry.iter().map(|i| &i.instruction)) {
        return Err(RewriteError::EntryNotFirst { method: method.to_string() });
    }

    let mut remaining = rewritten.opcodes();
    let in_order = original.opcodes().all(|want| remaining.any(|have| have == want));
    if !in_order {
        return Err(RewriteError::OriginalOrderLost { method: method.to_string() });
    }
    Ok(())
}

fn instrument_method(
    method: &MethodUnit,
    sequences: &ProbeSequences,
    unit_name: &str,
) -> Result<(MethodUnit, MethodReport), RewriteError> {
    let name = method.display_name(unit_name);
    let mut exit_points = 0;
    let mut attributes = Vec::with_capacity(method.attributes.len());

    for attribute in &method.attributes {
        let MemberAttribute::Code { name_index, body } = attribute else {
            attributes.push(attribute.clone());
            continue;
        };
        let with_entry = insert_entry_probe(body, &sequences.entry);
        let exits = discover_exit_points(&with_entry);
        let rewritten = insert_exit_probes(&with_entry, &sequences.exit, &exits);
        verify(body, &rewritten, sequences, &name)?;

        exit_points = exits.len();
        debug!("{name}: 1 entry probe, {exit_points} exit probes");
        attributes.push(MemberAttribute::Code { name_index: *name_index, body: Box::new(rewritten) });
    }

    let report = MethodReport {
        name: method.name.clone(),
        descriptor: method.descriptor.clone(),
        exit_points,
    };
    Ok((MethodUnit { attributes, ..method.clone() }, report))
}

/// Rewrite every method of `unit` that has code. Methods of the probe's own
/// class are left alone, as are abstract and native methods.
///
/// Applying this twice probes twice: rewritten methods are not recognised.
///
/// # Errors
/// Returns [`RewriteError`] if any method could not be rewritten; the unit is
/// then to be used unmodified.
pub fn instrument_unit(unit: CodeUnit, probe: &Probe) -> Result<(CodeUnit, InstrumentReport), RewriteError> {
    let mut report = InstrumentReport { unit: unit.name.clone(), ..InstrumentReport::default() };
    if unit.name == probe.owner {
        debug!("{}: probe owner, not instrumented", unit.name);
        return Ok((unit, report));
    }

    let (constant_pool, sequences) = intern_probe_constants(&unit, probe)?;

    let mut methods = Vec::with_capacity(unit.methods.len());
    for (method, sequences) in unit.methods.iter().zip(&sequences) {
        let Some(sequences) = sequences else {
            report.skipped.push(format!("{}{}", method.name, method.descriptor));
            methods.push(method.clone());
            continue;
        };
        let (rewritten, method_report) = instrument_method(method, sequences, &unit.name)?;
        report.instrumented.push(method_report);
        methods.push(rewritten);
    }

    Ok((CodeUnit { constant_pool, methods, ..unit }, report))
}

/// Parse, instrument and serialize one class file
///
/// # Errors
/// Returns the first [`TransformError`] of any stage.
pub fn instrument_class(bytes: &[u8], probe: &Probe) -> Result<(Vec<u8>, InstrumentReport), TransformError> {
    let unit = classfile::parse(bytes)?;
    let (unit, report) = instrument_unit(unit, probe)?;
    let out = classfile::serialize(&unit)?;
    Ok((out, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::{labelled, ClassBuilder, MethodCode};
    use crate::classfile::{opcodes, Instruction, Label, ACC_STATIC};

    /// `static int pick(int x) { if (x == 0) throw null; return x; }`
    fn pick_class() -> CodeUnit {
        let mut builder = ClassBuilder::new("demo/Pick", "java/lang/Object").unwrap();
        let code = MethodCode {
            max_stack: 1,
            max_locals: 1,
            instructions: labelled(vec![
                Instruction::Local { opcode: opcodes::ILOAD, index: 0 },
                Instruction::Jump { opcode: opcodes::IFNE, target: Label(4) },
                Instruction::Op(opcodes::ACONST_NULL),
                Instruction::Op(opcodes::ATHROW),
                Instruction::Local { opcode: opcodes::ILOAD, index: 0 },
                Instruction::Op(opcodes::IRETURN),
            ]),
            handlers: vec![],
        };
        builder.method(ACC_STATIC, "pick", "(I)I", Some(code)).unwrap();
        builder.method(ACC_STATIC | 0x0100, "native", "()V", None).unwrap();
        builder.build()
    }

    fn invocations(body: &MethodBody, pool: &ConstantPool, target: &str) -> usize {
        body.opcodes()
            .filter(|i| match i {
                Instruction::Member { opcode: opcodes::INVOKESTATIC, index } => {
                    pool.member_ref(*index).is_some_and(|m| m.name == target)
                }
                _ => false,
            })
            .count()
    }

    #[test]
    fn test_one_entry_and_one_exit_per_exit_point() {
        let (unit, report) = instrument_unit(pick_class(), &Probe::default()).unwrap();
        let body = unit.method("pick", "(I)I").unwrap().body().unwrap();
        assert_eq!(invocations(body, &unit.constant_pool, "start"), 1);
        assert_eq!(invocations(body, &unit.constant_pool, "end"), 2);
        assert_eq!(report.instrumented[0].exit_points, 2);
        assert_eq!(report.skipped, vec!["native()V".to_string()]);
        assert_eq!(report.probe_calls(), 3);
    }

    #[test]
    fn test_exit_probe_takes_over_branch_target() {
        let (unit, _) = instrument_unit(pick_class(), &Probe::default()).unwrap();
        let body = unit.method("pick", "(I)I").unwrap().body().unwrap();
        // Entry (3) + iload + ifne + aconst_null + exit (3) + athrow + ...
        let target = body.instructions.iter().position(|i| i.label == Some(Label(4))).unwrap();
        assert_eq!(body.instructions[target].instruction, Instruction::Local { opcode: opcodes::ILOAD, index: 0 });
        let throw_probe = body.instructions.iter().position(|i| i.label == Some(Label(3))).unwrap();
        assert!(matches!(body.instructions[throw_probe].instruction, Instruction::Ldc(_)));
        assert_eq!(body.instructions[throw_probe + 3].instruction, Instruction::Op(opcodes::ATHROW));
        assert_eq!(body.instructions[throw_probe + 3].label, None);
        // The entry probe is unlabelled, the first original instruction keeps its label
        assert_eq!(body.instructions[0].label, None);
        assert_eq!(body.instructions[3].label, Some(Label(0)));
    }

    #[test]
    fn test_probe_owner_is_left_alone() {
        let mut builder = ClassBuilder::new("hotprobe/ProbeSink", "java/lang/Object").unwrap();
        builder
            .method(ACC_STATIC, "flush", "()V", Some(MethodCode::new(labelled(vec![Instruction::Op(opcodes::RETURN)]))))
            .unwrap();
        let (unit, report) = instrument_unit(builder.build(), &Probe::default()).unwrap();
        assert!(report.instrumented.is_empty());
        assert_eq!(unit.methods[0].body().unwrap().instructions.len(), 1);
    }

    #[test]
    fn test_reinstrumenting_is_additive() {
        let (once, _) = instrument_unit(pick_class(), &Probe::default()).unwrap();
        let (twice, _) = instrument_unit(once, &Probe::default()).unwrap();
        let body = twice.method("pick", "(I)I").unwrap().body().unwrap();
        assert_eq!(invocations(body, &twice.constant_pool, "start"), 2);
    }

    #[test]
    fn test_verify_detects_lost_instruction() {
        let unit = pick_class();
        let (_, sequences) = intern_probe_constants(&unit, &Probe::default()).unwrap();
        let seq = sequences[0].as_ref().unwrap();
        let body = unit.methods[0].body().unwrap();
        let mut broken = insert_entry_probe(body, &seq.entry);
        broken.instructions.pop();
        assert!(matches!(verify(body, &broken, seq, "pick"), Err(RewriteError::OriginalOrderLost { .. })));

        let no_entry = MethodBody { modified: true, ..body.clone() };
        assert!(matches!(verify(body, &no_entry, seq, "pick"), Err(RewriteError::EntryNotFirst { .. })));
    }

    #[test]
    fn test_instrument_class_round_trip() {
        let bytes = classfile::serialize(&pick_class()).unwrap();
        let (out, report) = instrument_class(&bytes, &Probe::default()).unwrap();
        assert_eq!(report.instrumented.len(), 1);
        let unit = classfile::parse(&out).unwrap();
        let body = unit.method("pick", "(I)I").unwrap().body().unwrap();
        assert_eq!(body.instructions.len(), 6 + 9);
        assert_eq!(body.max_stack, 3);
    }
}
