//! HotSpot attach listener wire format
//!
//! Request (protocol 1): NUL-terminated strings
//!
//! ```text
//! "1" \0 <command> \0 <arg0> \0 <arg1> \0 <arg2> \0
//! ```
//!
//! Reply: the attach status on the first line, then command output. For
//! `load` the output is the `Agent_OnAttach` return code, either bare or as
//! `return code: N` depending on the JDK.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "1";

/// The listener always expects exactly three arguments
const ARG_COUNT: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReplyError {
    #[error("empty reply")]
    Empty,

    #[error("unparseable {what}: '{text}'")]
    Unparseable { what: &'static str, text: String },

    #[error("attach listener returned status {status}: {message}")]
    Status { status: i32, message: String },
}

/// Encode a request. Missing arguments are sent empty.
#[must_use]
pub fn encode_request(command: &str, args: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in [PROTOCOL_VERSION, command]
        .into_iter()
        .chain((0..ARG_COUNT).map(|i| args.get(i).copied().unwrap_or("")))
    {
        out.extend_from_slice(part.as_bytes());
        out.push(0);
    }
    out
}

/// `load <library> true <options>`: load by absolute path, pass `options` to `Agent_OnAttach`
#[must_use]
pub fn load_request(library: &Path, options: &str) -> Vec<u8> {
    encode_request("load", &[&library.to_string_lossy(), "true", options])
}

/// Parse the reply to `load`, returning the agent's return code
///
/// # Errors
/// Returns [`ReplyError`] for a non-zero status or unparseable numbers.
pub fn parse_load_reply(reply: &str) -> Result<i32, ReplyError> {
    let mut lines = reply.lines().map(str::trim);
    let status_line = lines.next().filter(|l| !l.is_empty()).ok_or(ReplyError::Empty)?;
    let status: i32 = status_line.parse().map_err(|_| ReplyError::Unparseable {
        what: "status",
        text: status_line.to_string(),
    })?;

    if status != 0 {
        let message = lines.collect::<Vec<_>>().join(" ");
        return Err(ReplyError::Status { status, message });
    }

    // Older JDKs do not report a return code at all
    let Some(code_line) = lines.find(|l| !l.is_empty()) else {
        return Ok(0);
    };
    let code = code_line.strip_prefix("return code:").unwrap_or(code_line).trim();
    code.parse().map_err(|_| ReplyError::Unparseable { what: "return code", text: code_line.to_string() })
}

/// The pid the target sees for itself, from the last `NSpid:` field of
/// `/proc/<pid>/status`. Differs from the host pid inside containers.
#[must_use]
pub fn namespace_pid(status: &str) -> Option<i32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))
        .and_then(|fields| fields.split_whitespace().last())
        .and_then(|pid| pid.parse().ok())
}

/// Listener socket, seen through the target's root so mount namespaces work
#[must_use]
pub fn socket_path(proc_root: &Path, pid: i32, ns_pid: i32) -> PathBuf {
    proc_root.join(pid.to_string()).join(format!("root/tmp/.java_pid{ns_pid}"))
}

/// Where to create the trigger file, in order of preference
#[must_use]
pub fn trigger_paths(proc_root: &Path, pid: i32, ns_pid: i32) -> [PathBuf; 2] {
    let dir = proc_root.join(pid.to_string());
    [
        dir.join(format!("cwd/.attach_pid{ns_pid}")),
        dir.join(format!("root/tmp/.attach_pid{ns_pid}")),
    ]
}
