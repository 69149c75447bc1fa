//! # hotprobe - Main Entry Point
//!
//! - **attach**: load the agent into a live JVM, which instruments its classes
//! - **detach**: ask the loaded agent to remove its hook
//! - **instrument** / **inspect**: the same rewriting pipeline on class files
//! - **export**: turn an event log into a Chrome trace

use anyhow::{bail, Context, Result};
use clap::Parser;
use hotprobe_common::{to_internal_name, AgentOptions};
use log::info;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hotprobe::attach::{attach, AttachOptions};
use hotprobe::classfile;
use hotprobe::cli::{Args, Command};
use hotprobe::domain::{AttachErrorKind, Pid};
use hotprobe::export::ChromeTraceExporter;
use hotprobe::rewrite::{self, discover_exit_points, Probe};
use hotprobe::scope::{LoaderId, ScopeFilter};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

const AGENT_FILE_NAME: &str = "libhotprobe_agent.so";

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(attach) = err.downcast_ref::<hotprobe::domain::AttachError>() {
        return match attach.kind {
            AttachErrorKind::PermissionDenied => EXIT_NOPERM,
            AttachErrorKind::BridgeMissing => EXIT_USAGE,
            _ => EXIT_ERROR,
        };
    }
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Attach { pid, agent, output, include, exclude, timeout } => {
            let options = AgentOptions {
                output: output.map(|p| absolute(&p).display().to_string()),
                excludes: exclude.iter().map(String::as_str).map(to_internal_name).collect(),
                includes: include.iter().map(String::as_str).map(to_internal_name).collect(),
                detach: false,
                unknown: Vec::new(),
            };
            options.validate()?;
            run_attach(Pid(pid), agent, &options, Duration::from_secs(timeout), args.quiet)
        }
        Command::Detach { pid, agent, timeout } => {
            let options = AgentOptions { detach: true, ..AgentOptions::default() };
            run_attach(Pid(pid), agent, &options, Duration::from_secs(timeout), args.quiet)
        }
        Command::Instrument { input, output, force } => run_instrument(&input, &output, force, args.quiet),
        Command::Inspect { input } => run_inspect(&input),
        Command::Export { input, output } => run_export(&input, &output, args.quiet),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// The agent library shipped next to the executable
fn default_agent_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the hotprobe executable")?;
    let dir = exe.parent().context("hotprobe executable has no parent directory")?;
    Ok(dir.join(AGENT_FILE_NAME))
}

fn run_attach(pid: Pid, agent: Option<PathBuf>, options: &AgentOptions, timeout: Duration, quiet: bool) -> Result<()> {
    let library = match agent {
        Some(path) => absolute(&path),
        None => default_agent_path()?,
    };

    let attach_options = AttachOptions {
        timeout,
        ..AttachOptions::new(library, options.to_argument())
    };
    let handle = attach(pid, &attach_options)?;

    if quiet {
        return Ok(());
    }
    if options.detach {
        println!("Removed the hook from {}, instrumented classes keep their probes", handle.pid);
    } else {
        println!("Attached {} to {}", handle.library.display(), handle.pid);
        match options.output {
            Some(ref path) => println!("Events are appended to {path}"),
            None => println!("Events are printed on the target's stdout"),
        }
    }
    Ok(())
}

fn run_instrument(input: &Path, output: &Path, force: bool, quiet: bool) -> Result<()> {
    let bytes = fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;

    if !force {
        let unit = classfile::parse(&bytes).with_context(|| format!("Failed to parse {}", input.display()))?;
        let decision = ScopeFilter::default().decide(Some(&unit.name), &LoaderId::System);
        if !decision.admits() {
            bail!("{} is out of scope ({decision:?}), use --force to instrument it anyway", unit.name);
        }
    }

    let (out, report) = rewrite::instrument_class(&bytes, &Probe::default())
        .with_context(|| format!("Failed to instrument {}", input.display()))?;
    fs::write(output, &out).with_context(|| format!("Failed to write {}", output.display()))?;

    info!("{}: {} bytes -> {} bytes", report.unit, bytes.len(), out.len());
    if !quiet {
        println!(
            "{}: {} methods instrumented, {} probe calls, {} skipped",
            report.unit,
            report.instrumented.len(),
            report.probe_calls(),
            report.skipped.len()
        );
    }
    Ok(())
}

fn run_inspect(input: &Path) -> Result<()> {
    let bytes = fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let unit = classfile::parse(&bytes).with_context(|| format!("Failed to parse {}", input.display()))?;

    println!("{} (class file {}.{})", unit.name, unit.major_version, unit.minor_version);
    for method in &unit.methods {
        match method.body() {
            Some(body) => {
                let exits = discover_exit_points(body);
                let throws = exits.iter().filter(|e| e.is_throw()).count();
                println!(
                    "  {}{}  insns={} exits={} (throw={}) max_stack={} max_locals={}",
                    method.name,
                    method.descriptor,
                    body.instructions.len(),
                    exits.len(),
                    throws,
                    body.max_stack,
                    body.max_locals
                );
            }
            None => println!("  {}{}  (no code)", method.name, method.descriptor),
        }
    }
    Ok(())
}

fn run_export(input: &Path, output: &Path, quiet: bool) -> Result<()> {
    let file = File::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    let mut exporter = ChromeTraceExporter::new();
    exporter.read_lines(BufReader::new(file))?;

    let out = File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
    exporter.export(BufWriter::new(out)).context("Failed to write trace JSON")?;

    if !quiet {
        println!("Wrote {} events to {}", exporter.event_count(), output.display());
    }
    Ok(())
}
