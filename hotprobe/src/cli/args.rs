//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hotprobe",
    version,
    about = "Inject method timing probes into running JVMs",
    after_help = "\
EXAMPLES:
    hotprobe attach --pid 1234 --include com.acme.    Probe com.acme.* in a live JVM
    hotprobe attach --pid 1234 -o /tmp/events.log     Write events to a file in the target
    hotprobe detach --pid 1234                        Stop instrumenting newly loaded classes
    hotprobe instrument Sample.class -o out/Sample.class
    hotprobe inspect Sample.class                     List methods and exit points
    hotprobe export events.log -o trace.json          Convert events for chrome://tracing"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Attach the agent to a running JVM and instrument its classes
    Attach {
        /// Process ID of the target JVM
        #[arg(short, long)]
        pid: i32,

        /// Agent library (default: libhotprobe_agent.so next to this binary)
        #[arg(long, value_name = "PATH")]
        agent: Option<PathBuf>,

        /// File the target appends event lines to (default: its stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Only instrument classes under this prefix (repeatable)
        #[arg(long, value_name = "PREFIX")]
        include: Vec<String>,

        /// Never instrument classes under this prefix (repeatable)
        #[arg(long, value_name = "PREFIX")]
        exclude: Vec<String>,

        /// Seconds to wait for the JVM's attach listener
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Remove the hook installed by a previous attach
    Detach {
        /// Process ID of the target JVM
        #[arg(short, long)]
        pid: i32,

        /// Agent library used for the attach
        #[arg(long, value_name = "PATH")]
        agent: Option<PathBuf>,

        /// Seconds to wait for the JVM's attach listener
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Instrument a class file offline
    Instrument {
        /// Input .class file
        #[arg(value_name = "CLASS")]
        input: PathBuf,

        /// Where to write the instrumented class
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Instrument even if the scope filter would skip the class
        #[arg(long)]
        force: bool,
    },

    /// List the methods of a class file and their exit points
    Inspect {
        #[arg(value_name = "CLASS")]
        input: PathBuf,
    },

    /// Convert an event log into Chrome Trace Event Format
    Export {
        /// Event lines as written by the agent
        #[arg(value_name = "EVENTS")]
        input: PathBuf,

        /// Trace JSON output
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
}
