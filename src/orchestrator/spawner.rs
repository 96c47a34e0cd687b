//! Session process construction.
//!
//! Builds the `tokio::process::Command` for a session:
//! - `env_clear()` plus an allowlist, so secrets in the orchestrator's own
//!   environment never reach the child.
//! - All three stdio streams piped.
//! - `kill_on_drop(true)` so a dropped supervisor never leaks a process.
//! - On unix, a fresh process group so cancellation can reach every
//!   descendant the child forks.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::errors::SpawnError;
use crate::models::session::SessionId;

/// Environment variables inherited by the spawned process.
///
/// Every other variable is stripped via `env_clear()`.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Variable carrying the session identifier into the child.
pub const SESSION_ID_ENV: &str = "AGENT_TIMELINE_SESSION_ID";

/// Everything needed to launch one session process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Session the process belongs to.
    pub session_id: SessionId,
    /// Resolved executable.
    pub executable: PathBuf,
    /// Full argument list.
    pub args: Vec<String>,
    /// Extra environment, applied after the allowlist.
    pub env: Vec<(String, String)>,
    /// Directory the process starts in.
    pub working_dir: PathBuf,
}

/// Check that `dir` exists, is a directory, and is readable and writable.
///
/// # Errors
///
/// Returns [`SpawnError::InvalidWorkingDir`] if it is missing or not a
/// directory, or [`SpawnError::PermissionDenied`] if it cannot be listed or
/// is read-only.
pub fn validate_working_dir(dir: &Path) -> Result<PathBuf, SpawnError> {
    let metadata =
        std::fs::metadata(dir).map_err(|_| SpawnError::InvalidWorkingDir(dir.to_path_buf()))?;
    if !metadata.is_dir() {
        return Err(SpawnError::InvalidWorkingDir(dir.to_path_buf()));
    }
    if metadata.permissions().readonly() {
        return Err(SpawnError::PermissionDenied(format!(
            "working directory {} is read-only",
            dir.display()
        )));
    }
    std::fs::read_dir(dir).map_err(|err| {
        SpawnError::PermissionDenied(format!(
            "working directory {} is not readable: {err}",
            dir.display()
        ))
    })?;
    dir.canonicalize()
        .map_err(|_| SpawnError::InvalidWorkingDir(dir.to_path_buf()))
}

/// Build the command for `request`.
#[must_use]
pub fn build_command(request: &SpawnRequest) -> Command {
    let mut cmd = Command::new(&request.executable);
    cmd.args(&request.args);

    // Strip inherited environment, then inject only the safe allowlist.
    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.env(SESSION_ID_ENV, request.session_id.as_str());
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    cmd.current_dir(&request.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

/// Translate an OS spawn failure into a [`SpawnError`].
#[must_use]
pub fn classify_spawn_error(err: &io::Error, executable: &Path) -> SpawnError {
    match err.kind() {
        io::ErrorKind::NotFound => return SpawnError::NotFound(executable.to_path_buf()),
        io::ErrorKind::PermissionDenied => {
            return SpawnError::PermissionDenied(format!("{}: {err}", executable.display()));
        }
        _ => {}
    }

    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        use nix::errno::Errno;
        match Errno::from_raw(code) {
            Errno::EAGAIN | Errno::EMFILE | Errno::ENFILE | Errno::ENOMEM => {
                return SpawnError::ProcessLimitExceeded(err.to_string());
            }
            Errno::ENOEXEC | Errno::EACCES => {
                return SpawnError::PermissionDenied(format!("{}: {err}", executable.display()));
            }
            _ => {}
        }
    }

    SpawnError::Io(err.to_string())
}
