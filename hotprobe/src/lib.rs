//! # hotprobe - Method Timing Probes for Running JVMs
//!
//! hotprobe attaches to a running HotSpot JVM, installs a class transformation
//! hook and rewrites the bytecode of every method in scope so it reports its
//! entry and exit, without restarting the process.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐  attach protocol  ┌───────────────────────────────────────┐
//! │   hotprobe   │──────────────────▶│            Target JVM                 │
//! │    (CLI)     │  load agent.so    │                                       │
//! └──────────────┘                   │  Agent_OnAttach                       │
//!                                    │     │ install                         │
//!                                    │     ▼                                 │
//!                                    │  InstrumentationEngine (hook slot)    │
//!                                    │     │ ClassFileLoadHook               │
//!                                    │     ▼                                 │
//!                                    │  scope ─▶ parse ─▶ rewrite ─▶ serialize│
//!                                    │                                       │
//!                                    │  rewritten methods ─▶ ProbeSink       │
//!                                    │                        │              │
//!                                    └────────────────────────┼──────────────┘
//!                                                             ▼
//!                                                  unit \t method \t start|end \t ms
//! ```
//!
//! ## Module Structure
//!
//! - [`classfile`]: Code Reader / Code Writer for class files, plus the stack
//!   and locals analysis the writer needs after an edit
//! - [`rewrite`]: Method Probe Rewriter (exit-point discovery, probe splicing)
//! - [`scope`]: which classes the hook may touch
//! - [`engine`]: the single-slot transformation hook and its host interface
//! - [`sink`]: probe event recorders
//! - [`attach`]: HotSpot dynamic attach client
//! - [`preflight`]: checks run before attaching
//! - [`export`]: Chrome Trace Event Format output
//! - [`cli`]: command-line argument parsing
//! - [`domain`]: error types and newtypes
//!
//! ## Failure Policy
//!
//! Transformation errors never leave the hook: a class that fails to parse,
//! rewrite or serialize is handed back unchanged and the failure is logged.
//! Attach errors are returned to the caller, tagged with a reason code.

pub mod attach;
pub mod classfile;
pub mod cli;
pub mod domain;
pub mod engine;
pub mod export;
pub mod preflight;
pub mod rewrite;
pub mod scope;
pub mod sink;
