//! End-to-end rewriting: parse, instrument, serialize, then execute the result

mod support;

use hotprobe::classfile::{self, opcodes};
use hotprobe::rewrite::{instrument_class, Probe};
use hotprobe::sink::{MemorySink, ProbeRecorder};
use hotprobe_common::{Phase, ProbeEvent};

use support::{Interpreter, Outcome, Value};

fn instrumented(bytes: &[u8]) -> classfile::CodeUnit {
    let (out, _) = instrument_class(bytes, &Probe::default()).unwrap();
    classfile::parse(&out).unwrap()
}

fn phases(events: &[ProbeEvent]) -> Vec<Phase> {
    events.iter().map(|e| e.phase).collect()
}

#[test]
fn test_sample_run_emits_start_then_end() {
    let unit = instrumented(&support::sample_class());
    let memory = MemorySink::new();
    let recorder = ProbeRecorder::new(memory.clone());

    let outcome = Interpreter::with_recorder(&unit, &recorder).call("run", "()V", vec![]);
    assert_eq!(outcome, Outcome::Returned(None));

    let events = memory.events();
    assert_eq!(events.len(), 2);
    assert_eq!((events[0].unit_name.as_str(), events[0].method_name.as_str()), ("Sample", "run"));
    assert_eq!(events[0].phase, Phase::Start);
    assert_eq!(events[1].phase, Phase::End);
    assert!(events[1].timestamp_millis >= events[0].timestamp_millis);
    assert!(events[0].to_string().starts_with("Sample\trun\tstart\t"));
}

#[test]
fn test_one_start_and_one_end_on_either_exit_path() {
    let unit = instrumented(&support::pick_class());

    for (arg, expected) in [
        (3, Outcome::Returned(Some(Value::Int(6)))),
        (0, Outcome::Threw(Value::Null)),
    ] {
        let memory = MemorySink::new();
        let recorder = ProbeRecorder::new(memory.clone());
        let outcome = Interpreter::with_recorder(&unit, &recorder).call("pick", "(I)I", vec![Value::Int(arg)]);
        assert_eq!(outcome, expected, "pick({arg})");
        assert_eq!(phases(&memory.events()), vec![Phase::Start, Phase::End], "pick({arg})");
    }
}

#[test]
fn test_rewritten_methods_behave_like_the_originals() {
    let cases: [(Vec<u8>, &str, Vec<i32>); 4] = [
        (support::pick_class(), "pick", vec![-5, 0, 1, 40_000]),
        (support::drain_class(), "drain", vec![0, 1, 7]),
        (support::guarded_class(), "guarded", vec![0, 9]),
        (support::nested_class(), "outer", vec![0, 41]),
    ];

    for (bytes, method, inputs) in cases {
        let original = classfile::parse(&bytes).unwrap();
        let rewritten = instrumented(&bytes);
        for input in inputs {
            let before = Interpreter::new(&original).call(method, "(I)I", vec![Value::Int(input)]);
            let after = Interpreter::new(&rewritten).call(method, "(I)I", vec![Value::Int(input)]);
            assert_eq!(before, after, "{method}({input})");
        }
    }
}

#[test]
fn test_back_edge_to_first_instruction_does_not_repeat_entry() {
    let unit = instrumented(&support::drain_class());
    let mut interpreter = Interpreter::new(&unit);
    interpreter.call("drain", "(I)I", vec![Value::Int(5)]);

    let names: Vec<&str> = interpreter.probe_calls.iter().map(|(probe, _, _)| probe.as_str()).collect();
    assert_eq!(names, vec!["start", "end"]);
}

#[test]
fn test_nested_calls_are_properly_bracketed() {
    let unit = instrumented(&support::nested_class());
    let mut interpreter = Interpreter::new(&unit);
    assert_eq!(
        interpreter.call("outer", "(I)I", vec![Value::Int(1)]),
        Outcome::Returned(Some(Value::Int(2)))
    );

    let calls: Vec<(&str, &str)> =
        interpreter.probe_calls.iter().map(|(probe, _, method)| (probe.as_str(), method.as_str())).collect();
    assert_eq!(calls, vec![("start", "outer"), ("start", "inner"), ("end", "inner"), ("end", "outer")]);
}

#[test]
fn test_throw_caught_in_the_same_method_runs_its_exit_probe() {
    let unit = instrumented(&support::guarded_class());
    let mut interpreter = Interpreter::new(&unit);
    assert_eq!(
        interpreter.call("guarded", "(I)I", vec![Value::Int(0)]),
        Outcome::Returned(Some(Value::Int(-1)))
    );
    let names: Vec<&str> = interpreter.probe_calls.iter().map(|(probe, _, _)| probe.as_str()).collect();
    assert_eq!(names, vec!["start", "end", "end"]);
}

#[test]
fn test_handler_range_still_covers_the_throw() {
    let unit = instrumented(&support::guarded_class());
    let body = unit.method("guarded", "(I)I").unwrap().body().unwrap();
    let handler = &body.handlers[0];
    let position = |label| body.instructions.iter().position(|i| i.label == Some(label)).unwrap();
    let throw = body
        .instructions
        .iter()
        .position(|i| i.instruction.opcode() == opcodes::ATHROW)
        .unwrap();
    assert!((position(handler.start)..position(handler.end)).contains(&throw));
    // The entry probe stays outside the protected range
    assert_eq!(position(handler.start), 3);
    assert_eq!(body.instructions[position(handler.handler)].instruction.opcode(), opcodes::POP);
}

#[test]
fn test_every_exit_is_preceded_by_an_exit_probe() {
    let unit = instrumented(&support::pick_class());
    let body = unit.method("pick", "(I)I").unwrap().body().unwrap();
    for (i, insn) in body.instructions.iter().enumerate() {
        if opcodes::is_exit(insn.instruction.opcode()) {
            let call = &body.instructions[i - 1].instruction;
            let classfile::Instruction::Member { index, .. } = call else {
                panic!("exit at {i} is not preceded by a probe call");
            };
            assert_eq!(unit.constant_pool.member_ref(*index).unwrap().name, "end");
        }
    }
}

#[test]
fn test_native_methods_are_untouched() {
    let (out, report) = instrument_class(&support::pick_class(), &Probe::default()).unwrap();
    assert_eq!(report.skipped, vec!["nativeHelper()V".to_string()]);
    let unit = classfile::parse(&out).unwrap();
    assert!(unit.method("nativeHelper", "()V").unwrap().body().is_none());
}

#[test]
fn test_events_survive_the_line_format() {
    let unit = instrumented(&support::sample_class());
    let memory = MemorySink::new();
    let recorder = ProbeRecorder::with_clock(memory.clone(), || 1_700_000_000_000);
    Interpreter::with_recorder(&unit, &recorder).call("run", "()V", vec![]);

    for event in memory.events() {
        assert_eq!(ProbeEvent::parse_line(&event.to_string()).unwrap(), event);
    }
}

#[test]
fn test_crowded_pool_uses_wide_constant_loads() {
    let unit = instrumented(&support::crowded_class());
    let body = unit.method("settle", "(I)V").unwrap().body().unwrap();

    let classfile::Instruction::Ldc(unit_name) = body.instructions[0].instruction else {
        panic!("entry sequence does not start with a constant load");
    };
    assert!(usize::from(unit_name) > support::CROWDED_POOL_FILLER);
    // Labels of a parsed body are byte offsets: ldc_w is three bytes, ldc two
    assert_eq!(body.instructions[1].label, Some(classfile::Label(3)));
    assert_eq!(body.instructions[2].label, Some(classfile::Label(6)));

    for input in [0, 5] {
        let mut interpreter = Interpreter::new(&unit);
        assert_eq!(interpreter.call("settle", "(I)V", vec![Value::Int(input)]), Outcome::Returned(None));
        let calls: Vec<(&str, &str, &str)> = interpreter
            .probe_calls
            .iter()
            .map(|(target, unit, method)| (target.as_str(), unit.as_str(), method.as_str()))
            .collect();
        assert_eq!(calls, vec![("start", "demo/Crowded", "settle"), ("end", "demo/Crowded", "settle")]);
    }
}

#[test]
fn test_frame_at_branch_target_moves_to_exit_call() {
    let unit = instrumented(&support::crowded_class());
    let body = unit.method("settle", "(I)V").unwrap().body().unwrap();

    let frames = body.frames().expect("stack map table survives the rewrite");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, classfile::FrameKind::Same);

    let frame_at = body
        .instructions
        .iter()
        .position(|i| i.label == Some(frames[0].label))
        .expect("frame label resolves to an instruction");
    assert!(matches!(body.instructions[frame_at].instruction, classfile::Instruction::Ldc(_)));
    let classfile::Instruction::Member { index, .. } = body.instructions[frame_at + 2].instruction else {
        panic!("frame does not sit on the inserted exit call");
    };
    assert_eq!(unit.constant_pool.member_ref(index).unwrap().name, "end");
    assert_eq!(body.instructions[frame_at + 3].instruction.opcode(), opcodes::RETURN);

    // The branch that reached the return now reaches the call inserted in front of it
    let branch_target = body
        .opcodes()
        .find_map(|i| match i {
            classfile::Instruction::Jump { opcode: opcodes::IFEQ, target } => Some(*target),
            _ => None,
        })
        .unwrap();
    assert_eq!(branch_target, frames[0].label);
}
