//! Structured error types for hotprobe
//!
//! Using thiserror for automatic Display implementation and error chaining.
//!
//! Errors on the transformation path ([`MalformedInput`], [`RewriteError`],
//! [`SerializationError`]) are always recovered locally by returning the
//! original class bytes. Errors on the attach path ([`AttachError`]) and hook
//! lifecycle errors ([`EngineError`]) are reported to the caller.

use super::types::Pid;
use std::fmt;
use thiserror::Error;

/// The input bytes are not a class file the reader understands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed class file at byte {offset}: {reason}")]
pub struct MalformedInput {
    pub offset: usize,
    pub reason: String,
}

impl MalformedInput {
    pub fn new(offset: usize, reason: impl Into<String>) -> Self {
        Self { offset, reason: reason.into() }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("{method}: branch from offset {from} to {to} does not fit in 16 bits")]
    BranchOutOfRange { method: String, from: u32, to: u32 },

    #[error("{method}: code length {size} exceeds 65535 bytes")]
    CodeTooLarge { method: String, size: usize },

    #[error("{method}: label {label} does not resolve to an instruction")]
    UnresolvedLabel { method: String, label: u32 },

    #[error("{method}: stack analysis failed at instruction {index}: {reason}")]
    StackAnalysis { method: String, index: usize, reason: String },

    #[error("too many {what}: {count}")]
    TooManyEntries { what: &'static str, count: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("constant pool is full, cannot add probe constants")]
    ConstantPoolFull,

    #[error("{method}: entry probe must precede the first instruction")]
    EntryNotFirst { method: String },

    #[error("{method}: original instruction stream changed during rewriting")]
    OriginalOrderLost { method: String },
}

/// Anything that made a single class fall back to its original bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error(transparent)]
    Malformed(#[from] MalformedInput),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

/// Failure reported by the hosting runtime (JVMTI in the agent)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed: {detail}")]
pub struct HostError {
    pub operation: &'static str,
    pub detail: String,
}

impl HostError {
    pub fn new(operation: &'static str, detail: impl Into<String>) -> Self {
        Self { operation, detail: detail.into() }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("a transformation hook is already installed, uninstall it first")]
    HookConflict,

    #[error("no transformation hook is installed")]
    NotInstalled,

    #[error(transparent)]
    Host(#[from] HostError),
}

/// Distinguishing reason code of an [`AttachError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachErrorKind {
    /// No such process
    ProcessNotFound,
    /// The caller may not attach to the process (different user)
    PermissionDenied,
    /// The process is not a HotSpot JVM
    NotAJvm,
    /// The bridging library does not exist
    BridgeMissing,
    /// The attach listener never came up (disabled with `-XX:+DisableAttachMechanism` or hung)
    AttachUnavailable,
    /// The JVM answered with a non-zero attach status or agent return code
    AgentFailed(i32),
    /// The reply could not be understood
    Protocol,
    /// Socket or filesystem error while talking to the process
    Io,
}

impl fmt::Display for AttachErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachErrorKind::ProcessNotFound => f.write_str("process-not-found"),
            AttachErrorKind::PermissionDenied => f.write_str("permission-denied"),
            AttachErrorKind::NotAJvm => f.write_str("not-a-jvm"),
            AttachErrorKind::BridgeMissing => f.write_str("bridge-missing"),
            AttachErrorKind::AttachUnavailable => f.write_str("attach-unavailable"),
            AttachErrorKind::AgentFailed(code) => write!(f, "agent-failed({code})"),
            AttachErrorKind::Protocol => f.write_str("protocol"),
            AttachErrorKind::Io => f.write_str("io"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("attach to {pid} failed [{kind}]: {detail}")]
pub struct AttachError {
    pub pid: Pid,
    pub kind: AttachErrorKind,
    pub detail: String,
}

impl AttachError {
    pub fn new(pid: Pid, kind: AttachErrorKind, detail: impl Into<String>) -> Self {
        Self { pid, kind, detail: detail.into() }
    }
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("line {line}: {source}")]
    BadEventLine {
        line: usize,
        #[source]
        source: hotprobe_common::EventParseError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
