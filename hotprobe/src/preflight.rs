//! Pre-flight checks for attaching
//!
//! Validates the target before touching its attach listener, so each failure
//! comes back with a precise [`AttachErrorKind`] and an actionable message.

#![allow(unsafe_code)] // geteuid() requires unsafe

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::domain::{AttachError, AttachErrorKind, Pid};

/// Run all pre-flight checks for attaching `library` to `pid`
///
/// # Errors
/// Returns the first failing check's [`AttachError`].
pub fn run_preflight_checks(proc_root: &Path, pid: Pid, library: &Path) -> Result<(), AttachError> {
    check_process_exists(proc_root, pid)?;
    check_bridge_library(pid, library)?;
    check_same_user(proc_root, pid)?;
    check_is_jvm(proc_root, pid)?;
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// [`AttachErrorKind::ProcessNotFound`] when there is no `/proc` entry.
pub fn check_process_exists(proc_root: &Path, pid: Pid) -> Result<(), AttachError> {
    let proc_path = proc_root.join(pid.0.to_string());
    if !proc_path.is_dir() {
        return Err(AttachError::new(
            pid,
            AttachErrorKind::ProcessNotFound,
            format!("Is the process still running? Check with: ps -p {}", pid.0),
        ));
    }
    Ok(())
}

/// Check that the agent library exists and is a file
///
/// # Errors
/// [`AttachErrorKind::BridgeMissing`] otherwise.
pub fn check_bridge_library(pid: Pid, library: &Path) -> Result<(), AttachError> {
    if !library.exists() {
        return Err(AttachError::new(
            pid,
            AttachErrorKind::BridgeMissing,
            format!(
                "agent library not found: {}\nBuild it with: cargo xtask build-agent",
                library.display()
            ),
        ));
    }
    if !library.is_file() {
        return Err(AttachError::new(
            pid,
            AttachErrorKind::BridgeMissing,
            format!("not a file: {}", library.display()),
        ));
    }
    if !library.is_absolute() {
        return Err(AttachError::new(
            pid,
            AttachErrorKind::BridgeMissing,
            format!("{} must be an absolute path, the JVM resolves it from its own cwd", library.display()),
        ));
    }
    Ok(())
}

/// HotSpot only accepts attach requests from its own effective user (or root)
///
/// # Errors
/// [`AttachErrorKind::PermissionDenied`] on a user mismatch.
pub fn check_same_user(proc_root: &Path, pid: Pid) -> Result<(), AttachError> {
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        return Ok(());
    }
    let owner = std::fs::metadata(proc_root.join(pid.0.to_string()))
        .map_err(|e| AttachError::new(pid, AttachErrorKind::ProcessNotFound, e.to_string()))?
        .uid();
    if owner != euid {
        return Err(AttachError::new(
            pid,
            AttachErrorKind::PermissionDenied,
            format!("process is owned by uid {owner}, we run as uid {euid}\n\nRun as the same user, or with sudo"),
        ));
    }
    Ok(())
}

/// Check that the process has `libjvm.so` mapped
///
/// # Errors
/// [`AttachErrorKind::NotAJvm`] if not, [`AttachErrorKind::PermissionDenied`]
/// if its maps cannot be read.
pub fn check_is_jvm(proc_root: &Path, pid: Pid) -> Result<(), AttachError> {
    let maps_path = proc_root.join(pid.0.to_string()).join("maps");
    let maps = std::fs::read_to_string(&maps_path).map_err(|e| {
        AttachError::new(
            pid,
            AttachErrorKind::PermissionDenied,
            format!("cannot read {}: {e}", maps_path.display()),
        )
    })?;
    if !maps.lines().any(|line| line.ends_with("/libjvm.so")) {
        return Err(AttachError::new(
            pid,
            AttachErrorKind::NotAJvm,
            "libjvm.so is not mapped, only HotSpot JVMs can be attached",
        ));
    }
    Ok(())
}
