//! Class fixtures and a small bytecode interpreter for integration tests
//!
//! The interpreter covers the int/reference subset the fixtures use. Calls to
//! the probe sink are routed to a [`ProbeRecorder`], so a rewritten method can
//! be run and its events checked without a JVM.

#![allow(dead_code)]

use std::collections::HashMap;

use hotprobe::classfile::builder::labelled;
use hotprobe::classfile::descriptor::method_shape;
use hotprobe::classfile::{
    opcodes as op, serialize, ClassBuilder, CodeAttribute, CodeUnit, Constant, FrameKind, Instruction, Label,
    MethodBody, MethodCode, StackMapFrame, ACC_NATIVE, ACC_STATIC,
};
use hotprobe::sink::ProbeRecorder;
use hotprobe_common::{ENTRY_METHOD, EXIT_METHOD, SINK_CLASS};

const ACC_PUBLIC: u16 = 0x0001;
const STEP_LIMIT: usize = 100_000;

// ============================================================================
// Fixtures
// ============================================================================

/// `public static void run() { return; }` in class `Sample`
pub fn sample_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new("Sample", "java/lang/Object").unwrap();
    builder
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "run",
            "()V",
            Some(MethodCode::new(labelled(vec![Instruction::Op(op::RETURN)]))),
        )
        .unwrap();
    serialize(&builder.build()).unwrap()
}

/// `static int pick(int x) { if (x == 0) throw null; return x * 2; }`
pub fn pick_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new("demo/Pick", "java/lang/Object").unwrap();
    let code = MethodCode {
        max_stack: 2,
        max_locals: 1,
        instructions: labelled(vec![
            Instruction::Local { opcode: op::ILOAD, index: 0 },
            Instruction::Jump { opcode: op::IFNE, target: Label(4) },
            Instruction::Op(op::ACONST_NULL),
            Instruction::Op(op::ATHROW),
            Instruction::Local { opcode: op::ILOAD, index: 0 },
            Instruction::Op(op::ICONST_1 + 1),
            Instruction::Op(op::IMUL),
            Instruction::Op(op::IRETURN),
        ]),
        handlers: vec![],
    };
    builder.method(ACC_STATIC, "pick", "(I)I", Some(code)).unwrap();
    builder.method(ACC_STATIC | ACC_NATIVE, "nativeHelper", "()V", None).unwrap();
    serialize(&builder.build()).unwrap()
}

/// `static int drain(int n) { while (n > 0) n--; return 0; }` compiled with
/// the loop test at offset 0, so the back edge targets the first instruction
pub fn drain_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new("demo/Drain", "java/lang/Object").unwrap();
    let code = MethodCode {
        max_stack: 1,
        max_locals: 1,
        instructions: labelled(vec![
            Instruction::Local { opcode: op::ILOAD, index: 0 },
            Instruction::Jump { opcode: op::IFGT, target: Label(4) },
            Instruction::Op(op::ICONST_0),
            Instruction::Op(op::IRETURN),
            Instruction::Iinc { index: 0, delta: -1 },
            Instruction::Jump { opcode: op::GOTO, target: Label(0) },
        ]),
        handlers: vec![],
    };
    builder.method(ACC_STATIC, "drain", "(I)I", Some(code)).unwrap();
    serialize(&builder.build()).unwrap()
}

/// ```java
/// static int guarded(int x) {
///     try { if (x == 0) throw null; return x; }
///     catch (Throwable t) { return -1; }
/// }
/// ```
pub fn guarded_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new("demo/Guarded", "java/lang/Object").unwrap();
    let code = MethodCode {
        max_stack: 1,
        max_locals: 1,
        instructions: labelled(vec![
            Instruction::Local { opcode: op::ILOAD, index: 0 },
            Instruction::Jump { opcode: op::IFNE, target: Label(4) },
            Instruction::Op(op::ACONST_NULL),
            Instruction::Op(op::ATHROW),
            Instruction::Local { opcode: op::ILOAD, index: 0 },
            Instruction::Op(op::IRETURN),
            Instruction::Op(op::POP),
            Instruction::Op(op::ICONST_0 - 1),
            Instruction::Op(op::IRETURN),
        ]),
        handlers: vec![],
    }
    .with_handler(Label(0), Label(6), Label(6), 0);
    builder.method(ACC_STATIC, "guarded", "(I)I", Some(code)).unwrap();
    serialize(&builder.build()).unwrap()
}

/// `static int outer(int x) { return inner(x) + 1; }` and
/// `static int inner(int x) { return x; }`
pub fn nested_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new("demo/Nested", "java/lang/Object").unwrap();
    let inner_ref = builder.pool().intern_method_ref("demo/Nested", "inner", "(I)I").unwrap();
    let outer = MethodCode {
        max_stack: 2,
        max_locals: 1,
        instructions: labelled(vec![
            Instruction::Local { opcode: op::ILOAD, index: 0 },
            Instruction::Member { opcode: op::INVOKESTATIC, index: inner_ref },
            Instruction::Op(op::ICONST_1),
            Instruction::Op(op::IADD),
            Instruction::Op(op::IRETURN),
        ]),
        handlers: vec![],
    };
    let inner = MethodCode {
        max_stack: 1,
        max_locals: 1,
        instructions: labelled(vec![
            Instruction::Local { opcode: op::ILOAD, index: 0 },
            Instruction::Op(op::IRETURN),
        ]),
        handlers: vec![],
    };
    builder
        .method(ACC_STATIC, "outer", "(I)I", Some(outer))
        .unwrap()
        .method(ACC_STATIC, "inner", "(I)I", Some(inner))
        .unwrap();
    serialize(&builder.build()).unwrap()
}

/// Filler constants interned ahead of the instrumentation constants
pub const CROWDED_POOL_FILLER: usize = 300;

/// `static void settle(int x) { if (x != 0) x++; return; }` in a class whose
/// pool already holds more than 256 entries. The `return` is a branch target
/// and carries a `same` stack map frame.
pub fn crowded_class() -> Vec<u8> {
    let mut builder = ClassBuilder::new("demo/Crowded", "java/lang/Object").unwrap();
    for i in 0..CROWDED_POOL_FILLER {
        builder.pool().intern_utf8(&format!("filler{i}")).unwrap();
    }
    let frames_name = builder.pool().intern_utf8("StackMapTable").unwrap();
    let code = MethodCode {
        max_stack: 1,
        max_locals: 1,
        instructions: labelled(vec![
            Instruction::Local { opcode: op::ILOAD, index: 0 },
            Instruction::Jump { opcode: op::IFEQ, target: Label(3) },
            Instruction::Iinc { index: 0, delta: 1 },
            Instruction::Op(op::RETURN),
        ]),
        handlers: vec![],
    };
    builder.method(ACC_STATIC, "settle", "(I)V", Some(code)).unwrap();

    let mut unit = builder.build();
    let body = unit.methods[0].body_mut().unwrap();
    body.attributes.push(CodeAttribute::StackMapTable {
        name_index: frames_name,
        frames: vec![StackMapFrame { label: Label(3), kind: FrameKind::Same }],
    });
    serialize(&unit).unwrap()
}

// ============================================================================
// Interpreter
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Str(String),
    Null,
}

impl Value {
    fn int(&self) -> i32 {
        match self {
            Value::Int(v) => *v,
            other => panic!("expected int, found {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Returned(Option<Value>),
    /// The exception value that left the method
    Threw(Value),
}

/// Executes static methods of one class
pub struct Interpreter<'a> {
    unit: &'a CodeUnit,
    recorder: Option<&'a ProbeRecorder>,
    /// Probe calls seen when no recorder is attached
    pub probe_calls: Vec<(String, String, String)>,
}

impl<'a> Interpreter<'a> {
    pub fn new(unit: &'a CodeUnit) -> Self {
        Self { unit, recorder: None, probe_calls: Vec::new() }
    }

    pub fn with_recorder(unit: &'a CodeUnit, recorder: &'a ProbeRecorder) -> Self {
        Self { unit, recorder: Some(recorder), probe_calls: Vec::new() }
    }

    pub fn call(&mut self, name: &str, descriptor: &str, args: Vec<Value>) -> Outcome {
        let method = self
            .unit
            .method(name, descriptor)
            .unwrap_or_else(|| panic!("no method {name}{descriptor}"));
        let body = method.body().unwrap_or_else(|| panic!("{name} has no code"));
        let mut locals = vec![Value::Null; usize::from(body.max_locals).max(args.len())];
        for (slot, arg) in args.into_iter().enumerate() {
            locals[slot] = arg;
        }
        self.execute(body, locals)
    }

    fn execute(&mut self, body: &MethodBody, mut locals: Vec<Value>) -> Outcome {
        let positions = label_positions(body);
        let at = |label: Label| -> usize {
            *positions.get(&label).unwrap_or_else(|| panic!("unresolved {label:?}"))
        };
        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0;

        for _ in 0..STEP_LIMIT {
            assert!(
                stack.len() <= usize::from(body.max_stack),
                "stack depth {} exceeds max_stack {}",
                stack.len(),
                body.max_stack
            );
            let insn = &body.instructions[pc].instruction;
            let mut next = pc + 1;
            match insn {
                Instruction::Op(code) => match *code {
                    op::ACONST_NULL => stack.push(Value::Null),
                    c @ 0x02..=0x08 => stack.push(Value::Int(i32::from(c) - 3)),
                    c @ 0x1a..=0x1d => stack.push(locals[usize::from(c - 0x1a)].clone()),
                    c @ op::ALOAD_0..=op::ALOAD_3 => stack.push(locals[usize::from(c - op::ALOAD_0)].clone()),
                    c @ op::ISTORE_0..=0x3e => locals[usize::from(c - op::ISTORE_0)] = pop(&mut stack),
                    c @ 0x4b..=op::ASTORE_3 => locals[usize::from(c - 0x4b)] = pop(&mut stack),
                    op::POP => {
                        pop(&mut stack);
                    }
                    op::DUP => {
                        let top = pop(&mut stack);
                        stack.push(top.clone());
                        stack.push(top);
                    }
                    op::IADD | op::ISUB | op::IMUL => {
                        let b = pop(&mut stack).int();
                        let a = pop(&mut stack).int();
                        stack.push(Value::Int(match *code {
                            op::IADD => a.wrapping_add(b),
                            op::ISUB => a.wrapping_sub(b),
                            _ => a.wrapping_mul(b),
                        }));
                    }
                    op::IRETURN | op::ARETURN => return Outcome::Returned(Some(pop(&mut stack))),
                    op::RETURN => return Outcome::Returned(None),
                    op::ATHROW => {
                        let exception = pop(&mut stack);
                        match handler_for(body, &positions, pc) {
                            Some(handler) => {
                                stack.clear();
                                stack.push(exception);
                                next = handler;
                            }
                            None => return Outcome::Threw(exception),
                        }
                    }
                    other => panic!("unsupported opcode {other:#04x}"),
                },
                Instruction::Bipush(v) => stack.push(Value::Int(i32::from(*v))),
                Instruction::Sipush(v) => stack.push(Value::Int(i32::from(*v))),
                Instruction::Ldc(index) => stack.push(self.constant(*index)),
                Instruction::Local { opcode, index } => {
                    let slot = usize::from(*index);
                    match *opcode {
                        op::ILOAD | op::ALOAD => stack.push(locals[slot].clone()),
                        op::ISTORE | op::ASTORE => locals[slot] = pop(&mut stack),
                        other => panic!("unsupported local opcode {other:#04x}"),
                    }
                }
                Instruction::Iinc { index, delta } => {
                    let slot = usize::from(*index);
                    locals[slot] = Value::Int(locals[slot].int().wrapping_add(i32::from(*delta)));
                }
                Instruction::Jump { opcode, target } | Instruction::JumpWide { opcode, target } => {
                    let taken = match *opcode {
                        op::GOTO | op::GOTO_W => true,
                        op::IFEQ..=op::IFLE => {
                            let v = pop(&mut stack).int();
                            compare(*opcode - op::IFEQ, v, 0)
                        }
                        op::IF_ICMPEQ..=op::IF_ICMPLE => {
                            let b = pop(&mut stack).int();
                            let a = pop(&mut stack).int();
                            compare(*opcode - op::IF_ICMPEQ, a, b)
                        }
                        op::IFNULL => pop(&mut stack) == Value::Null,
                        op::IFNONNULL => pop(&mut stack) != Value::Null,
                        other => panic!("unsupported branch {other:#04x}"),
                    };
                    if taken {
                        next = at(*target);
                    }
                }
                Instruction::TableSwitch { default, low, targets } => {
                    let key = pop(&mut stack).int();
                    let target = usize::try_from(key.wrapping_sub(*low))
                        .ok()
                        .and_then(|i| targets.get(i))
                        .unwrap_or(default);
                    next = at(*target);
                }
                Instruction::LookupSwitch { default, pairs } => {
                    let key = pop(&mut stack).int();
                    let target = pairs.iter().find(|(k, _)| *k == key).map_or(default, |(_, l)| l);
                    next = at(*target);
                }
                Instruction::Member { opcode: op::INVOKESTATIC, index } => {
                    let member = self.unit.constant_pool.member_ref(*index).expect("method ref");
                    if member.owner == SINK_CLASS {
                        let method = pop(&mut stack);
                        let unit = pop(&mut stack);
                        self.probe(&member.name, unit, method);
                    } else {
                        assert_eq!(member.owner, self.unit.name, "only calls within the class are supported");
                        let shape = method_shape(&member.descriptor).expect("method descriptor");
                        let argc = usize::from(shape.arg_slots);
                        let args = stack.split_off(stack.len() - argc);
                        match self.call(&member.name, &member.descriptor, args) {
                            Outcome::Returned(Some(v)) => stack.push(v),
                            Outcome::Returned(None) => {}
                            Outcome::Threw(exception) => match handler_for(body, &positions, pc) {
                                Some(handler) => {
                                    stack.clear();
                                    stack.push(exception);
                                    next = handler;
                                }
                                None => return Outcome::Threw(exception),
                            },
                        }
                    }
                }
                other => panic!("unsupported instruction {other:?}"),
            }
            pc = next;
        }
        panic!("step limit exceeded");
    }

    fn constant(&self, index: u16) -> Value {
        let pool = &self.unit.constant_pool;
        match pool.get(index) {
            Some(Constant::Integer(v)) => Value::Int(*v),
            Some(Constant::String { string_index }) => Value::Str(pool.utf8(*string_index).expect("utf8")),
            other => panic!("unsupported constant {other:?}"),
        }
    }

    fn probe(&mut self, name: &str, unit: Value, method: Value) {
        let (Value::Str(unit), Value::Str(method)) = (unit, method) else {
            panic!("probe arguments must be strings");
        };
        match self.recorder {
            Some(recorder) if name == ENTRY_METHOD => recorder.on_start(&unit, &method),
            Some(recorder) if name == EXIT_METHOD => recorder.on_end(&unit, &method),
            Some(_) => panic!("unknown probe method {name}"),
            None => self.probe_calls.push((name.to_string(), unit, method)),
        }
    }
}

fn pop(stack: &mut Vec<Value>) -> Value {
    stack.pop().expect("operand stack underflow")
}

/// `if<cond>` family in opcode order: eq, ne, lt, ge, gt, le
fn compare(condition: u8, a: i32, b: i32) -> bool {
    match condition {
        0 => a == b,
        1 => a != b,
        2 => a < b,
        3 => a >= b,
        4 => a > b,
        _ => a <= b,
    }
}

fn label_positions(body: &MethodBody) -> HashMap<Label, usize> {
    let mut positions: HashMap<Label, usize> = body
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(i, insn)| insn.label.map(|l| (l, i)))
        .collect();
    positions.insert(body.end, body.instructions.len());
    positions
}

/// First handler covering instruction `pc`; every handler catches everything
fn handler_for(body: &MethodBody, positions: &HashMap<Label, usize>, pc: usize) -> Option<usize> {
    body.handlers
        .iter()
        .find(|h| (positions[&h.start]..positions[&h.end]).contains(&pc))
        .map(|h| positions[&h.handler])
}
