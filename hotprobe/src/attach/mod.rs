//! Process Attacher
//!
//! Loads the agent library into a running HotSpot JVM through its dynamic
//! attach listener:
//!
//! 1. Pre-flight checks ([`crate::preflight`])
//! 2. If `/tmp/.java_pid<pid>` does not exist yet, create `.attach_pid<pid>`
//!    and send `SIGQUIT`; the JVM starts its listener and creates the socket
//! 3. Send `load <library> true <options>` and read the agent's return code
//!
//! Every failure is terminal; nothing is retried.

#![allow(unsafe_code)] // kill() requires unsafe

pub mod protocol;

use log::{debug, info};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::domain::{AttachError, AttachErrorKind, Pid};
use crate::preflight;
use protocol::ReplyError;

/// How long to wait for the listener socket after `SIGQUIT`
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Absolute path of the agent library
    pub library: PathBuf,
    /// Free-text argument handed to `Agent_OnAttach`
    pub argument: String,
    /// Bound for the listener to come up, and for the socket exchange
    pub timeout: Duration,
    /// Mount point of procfs
    pub proc_root: PathBuf,
}

impl AttachOptions {
    pub fn new(library: impl Into<PathBuf>, argument: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            argument: argument.into(),
            timeout: DEFAULT_TIMEOUT,
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// A successfully attached agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachHandle {
    pub pid: Pid,
    pub library: PathBuf,
    pub options: String,
    /// `Agent_OnAttach` return code, always 0 in a handle
    pub agent_status: i32,
}

/// Attach the agent library to `pid`
///
/// # Errors
/// Returns an [`AttachError`] whose kind tells which step failed.
pub fn attach(pid: Pid, options: &AttachOptions) -> Result<AttachHandle, AttachError> {
    preflight::run_preflight_checks(&options.proc_root, pid, &options.library)?;

    let ns_pid = fs::read_to_string(options.proc_root.join(pid.0.to_string()).join("status"))
        .ok()
        .and_then(|status| protocol::namespace_pid(&status))
        .unwrap_or(pid.0);
    debug!("{pid}: namespace pid {ns_pid}");

    let socket = protocol::socket_path(&options.proc_root, pid.0, ns_pid);
    if !socket.exists() {
        start_listener(pid, ns_pid, &socket, options)?;
    }

    let reply = exchange(pid, &socket, &protocol::load_request(&options.library, &options.argument), options.timeout)?;
    let agent_status = protocol::parse_load_reply(&reply).map_err(|e| match e {
        ReplyError::Status { status, .. } => {
            AttachError::new(pid, AttachErrorKind::AgentFailed(status), e.to_string())
        }
        other => AttachError::new(pid, AttachErrorKind::Protocol, other.to_string()),
    })?;
    if agent_status != 0 {
        return Err(AttachError::new(
            pid,
            AttachErrorKind::AgentFailed(agent_status),
            format!("Agent_OnAttach returned {agent_status}, see the target's log output"),
        ));
    }

    info!("{pid}: agent {} attached", options.library.display());
    Ok(AttachHandle {
        pid,
        library: options.library.clone(),
        options: options.argument.clone(),
        agent_status,
    })
}

/// Trigger file + `SIGQUIT`, then wait for the socket
fn start_listener(pid: Pid, ns_pid: i32, socket: &Path, options: &AttachOptions) -> Result<(), AttachError> {
    let trigger = protocol::trigger_paths(&options.proc_root, pid.0, ns_pid)
        .into_iter()
        .find(|path| fs::write(path, b"").is_ok())
        .ok_or_else(|| {
            AttachError::new(pid, AttachErrorKind::PermissionDenied, "cannot create .attach_pid trigger file")
        })?;
    debug!("{pid}: trigger {}", trigger.display());

    let result = signal_and_wait(pid, socket, options.timeout);
    let _ = fs::remove_file(&trigger);
    result
}

fn signal_and_wait(pid: Pid, socket: &Path, timeout: Duration) -> Result<(), AttachError> {
    if unsafe { libc::kill(pid.0, libc::SIGQUIT) } != 0 {
        let e = std::io::Error::last_os_error();
        let kind = match e.raw_os_error() {
            Some(libc::ESRCH) => AttachErrorKind::ProcessNotFound,
            Some(libc::EPERM) => AttachErrorKind::PermissionDenied,
            _ => AttachErrorKind::Io,
        };
        return Err(AttachError::new(pid, kind, format!("SIGQUIT: {e}")));
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if socket.exists() {
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Err(AttachError::new(
        pid,
        AttachErrorKind::AttachUnavailable,
        format!(
            "no attach listener after {}s. Was the JVM started with -XX:+DisableAttachMechanism?",
            timeout.as_secs()
        ),
    ))
}

/// Send one request and read the whole reply
fn exchange(pid: Pid, socket: &Path, request: &[u8], timeout: Duration) -> Result<String, AttachError> {
    let io_error = |what: &str, e: std::io::Error| {
        let kind = if e.kind() == std::io::ErrorKind::PermissionDenied {
            AttachErrorKind::PermissionDenied
        } else {
            AttachErrorKind::Io
        };
        AttachError::new(pid, kind, format!("{what} {}: {e}", socket.display()))
    };

    let mut stream = UnixStream::connect(socket).map_err(|e| io_error("connect", e))?;
    stream.set_read_timeout(Some(timeout)).map_err(|e| io_error("configure", e))?;
    stream.write_all(request).map_err(|e| io_error("write", e))?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).map_err(|e| io_error("read", e))?;
    debug!("{pid}: reply {reply:?}");
    Ok(reply)
}
