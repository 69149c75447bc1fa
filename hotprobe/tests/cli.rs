//! The `hotprobe` binary on class files and event logs

mod support;

use std::fs;
use std::process::Command;

fn hotprobe() -> Command {
    Command::new(env!("CARGO_BIN_EXE_hotprobe"))
}

#[test]
fn test_instrument_and_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("Pick.class");
    let output = dir.path().join("out.class");
    fs::write(&input, support::pick_class()).unwrap();

    let status = hotprobe()
        .args(["-q", "instrument"])
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .status()
        .unwrap();
    assert!(status.success());

    let inspect = hotprobe().arg("inspect").arg(&output).output().unwrap();
    assert!(inspect.status.success());
    let text = String::from_utf8(inspect.stdout).unwrap();
    assert!(text.starts_with("demo/Pick"));
    assert!(text.contains("pick(I)I"));
    assert!(text.contains("exits=2 (throw=1)"));
    assert!(text.contains("nativeHelper()V  (no code)"));
}

#[test]
fn test_instrument_refuses_out_of_scope_class_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ProbeSink.class");
    let output = dir.path().join("out.class");
    let mut builder =
        hotprobe::classfile::ClassBuilder::new(hotprobe_common::SINK_CLASS, "java/lang/Object").unwrap();
    builder.method(0x0108, "start", hotprobe_common::PROBE_DESCRIPTOR, None).unwrap();
    fs::write(&input, hotprobe::classfile::serialize(&builder.build()).unwrap()).unwrap();

    let refused = hotprobe().arg("instrument").arg(&input).arg("-o").arg(&output).output().unwrap();
    assert_eq!(refused.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&refused.stderr).contains("out of scope"));
    assert!(!output.exists());
}

#[test]
fn test_export_writes_chrome_trace() {
    let dir = tempfile::tempdir().unwrap();
    let events = dir.path().join("events.log");
    let trace = dir.path().join("trace.json");
    fs::write(&events, "Sample\trun\tstart\t1000\n\nSample\trun\tend\t1003\n").unwrap();

    let status = hotprobe().args(["-q", "export"]).arg(&events).arg("-o").arg(&trace).status().unwrap();
    assert!(status.success());

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&trace).unwrap()).unwrap();
    let trace_events = json["traceEvents"].as_array().unwrap();
    let phases: Vec<&str> = trace_events.iter().filter_map(|e| e["ph"].as_str()).collect();
    assert!(phases.contains(&"B"));
    assert!(phases.contains(&"E"));
    let end = trace_events.iter().find(|e| e["ph"] == "E").unwrap();
    assert_eq!(end["ts"].as_f64(), Some(3000.0));
}

#[test]
fn test_export_reports_bad_line() {
    let dir = tempfile::tempdir().unwrap();
    let events = dir.path().join("events.log");
    fs::write(&events, "Sample\trun\tstart\t1000\nnot an event\n").unwrap();

    let out = hotprobe().arg("export").arg(&events).arg("-o").arg(dir.path().join("t.json")).output().unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("line 2"));
}

#[test]
fn test_attach_to_missing_process() {
    let dir = tempfile::tempdir().unwrap();
    let agent = dir.path().join("libhotprobe_agent.so");
    fs::write(&agent, b"").unwrap();

    let out = hotprobe()
        .args(["attach", "--pid", "999999999", "--agent"])
        .arg(&agent)
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("PID:999999999"));
}

#[test]
fn test_attach_rejects_comma_in_output_path() {
    let dir = tempfile::tempdir().unwrap();
    let agent = dir.path().join("libhotprobe_agent.so");
    fs::write(&agent, b"").unwrap();

    let out = hotprobe()
        .args(["attach", "--pid", "999999999", "-o", "/tmp/events,old.log", "--agent"])
        .arg(&agent)
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("output value '/tmp/events,old.log' contains ','"), "{stderr}");
    // Rejected before any attach attempt
    assert!(!stderr.contains("PID:999999999"));
}
