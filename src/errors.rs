//! Error types shared across the application.
//!
//! Each failure domain has its own enum so callers can tell a session-level
//! failure apart from a content-integrity failure. [`AppError`] wraps them
//! all for the facade and the binary.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use crate::cas::Digest;
use crate::models::checkpoint::{CheckpointId, RestoreReport};
use crate::models::session::{SessionId, StateKind};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

// ── Spawn ────────────────────────────────────────────────────────────────────

/// Failure to start the external process for a session.
#[derive(Debug)]
pub enum SpawnError {
    /// The executable does not exist.
    NotFound(PathBuf),
    /// The executable or working directory is not accessible.
    PermissionDenied(String),
    /// The concurrent session limit or an OS process limit was hit.
    ProcessLimitExceeded(String),
    /// The working directory is missing, not a directory, or read-only.
    InvalidWorkingDir(PathBuf),
    /// A session with this identifier is already registered.
    DuplicateSession(SessionId),
    /// Any other OS failure while spawning.
    Io(String),
}

impl Display for SpawnError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "executable not found: {}", path.display()),
            Self::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            Self::ProcessLimitExceeded(msg) => write!(f, "process limit exceeded: {msg}"),
            Self::InvalidWorkingDir(path) => {
                write!(f, "invalid working directory: {}", path.display())
            }
            Self::DuplicateSession(id) => write!(f, "session {id} already registered"),
            Self::Io(msg) => write!(f, "spawn failed: {msg}"),
        }
    }
}

impl std::error::Error for SpawnError {}

// ── Cancel ───────────────────────────────────────────────────────────────────

/// Failure to cancel a session.
#[derive(Debug)]
pub enum CancelError {
    /// The session was never registered or has already been removed.
    NotFound(SessionId),
    /// Delivering a termination signal failed. The session is still marked
    /// `Cancelled` in the registry.
    Signal(String),
}

impl Display for CancelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "session {id} not found"),
            Self::Signal(msg) => write!(f, "signal delivery failed: {msg}"),
        }
    }
}

impl std::error::Error for CancelError {}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Failure raised by the session registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No session with this identifier is registered.
    NotFound(SessionId),
    /// A session with this identifier already exists.
    Duplicate(SessionId),
    /// The requested state is not reachable from the current one.
    InvalidTransition {
        /// Session whose transition was rejected.
        session_id: SessionId,
        /// State the session is currently in.
        from: StateKind,
        /// State the caller asked for.
        to: StateKind,
    },
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "session {id} not found"),
            Self::Duplicate(id) => write!(f, "session {id} already registered"),
            Self::InvalidTransition {
                session_id,
                from,
                to,
            } => write!(f, "invalid transition for {session_id}: {from} -> {to}"),
        }
    }
}

impl std::error::Error for RegistryError {}

// ── Supervisor ───────────────────────────────────────────────────────────────

/// Failure of a supervisor operation other than spawn or cancel.
#[derive(Debug)]
pub enum SupervisorError {
    /// No supervised process exists for this session.
    NotFound(SessionId),
    /// The output stream was already taken by another consumer.
    AlreadyAttached(SessionId),
    /// The process stdin is closed or was never captured.
    InputClosed(SessionId),
    /// Writing to the process failed.
    Io(String),
}

impl Display for SupervisorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "no supervised process for session {id}"),
            Self::AlreadyAttached(id) => write!(f, "output of session {id} already attached"),
            Self::InputClosed(id) => write!(f, "input of session {id} is closed"),
            Self::Io(msg) => write!(f, "supervisor io: {msg}"),
        }
    }
}

impl std::error::Error for SupervisorError {}

// ── Decode ───────────────────────────────────────────────────────────────────

/// A record the stream decoder could not turn into a structured message.
///
/// Decode errors never end the stream; they travel inside an `error`
/// message instead.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DecodeError {
    /// The line was not a JSON object with a string `type` field.
    Malformed {
        /// Parser diagnostic.
        detail: String,
    },
    /// The record exceeded the buffer bound before a newline arrived.
    Oversized {
        /// Number of bytes discarded.
        discarded_bytes: usize,
        /// Configured bound.
        limit: usize,
    },
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed { detail } => write!(f, "malformed record: {detail}"),
            Self::Oversized {
                discarded_bytes,
                limit,
            } => write!(
                f,
                "oversized record: discarded {discarded_bytes} bytes (limit {limit})"
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

// ── Content store ────────────────────────────────────────────────────────────

/// Failure raised by the content-addressed store.
#[derive(Debug)]
pub enum CasError {
    /// No object with this digest is stored.
    NotFound(Digest),
    /// The stored object does not hash back to its digest.
    Corrupted {
        /// Digest that was requested.
        expected: Digest,
        /// Digest of the bytes actually read (absent when decoding failed).
        actual: Option<Digest>,
    },
    /// A digest string was not 64 lowercase hex characters.
    InvalidDigest(String),
    /// Filesystem failure.
    Io(String),
}

impl Display for CasError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(digest) => write!(f, "object {digest} not found"),
            Self::Corrupted { expected, actual } => match actual {
                Some(actual) => write!(f, "object {expected} corrupted: content hashes to {actual}"),
                None => write!(f, "object {expected} corrupted: undecodable content"),
            },
            Self::InvalidDigest(raw) => write!(f, "invalid digest: {raw:?}"),
            Self::Io(msg) => write!(f, "content store io: {msg}"),
        }
    }
}

impl std::error::Error for CasError {}

// ── Checkpoint ───────────────────────────────────────────────────────────────

/// Failure of a snapshot, branch, list or diff operation.
#[derive(Debug)]
pub enum CheckpointError {
    /// The checkpoint does not exist in the project's timeline.
    NotFound(CheckpointId),
    /// The requested parent does not exist in the project's timeline.
    ParentNotFound(CheckpointId),
    /// The project root is missing or not a directory.
    InvalidProjectRoot(PathBuf),
    /// Object storage failed.
    Cas(CasError),
    /// The timeline index could not be read or appended.
    Timeline(String),
    /// Filesystem failure while walking or reading the project.
    Io(String),
}

impl Display for CheckpointError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "checkpoint {id} not found"),
            Self::ParentNotFound(id) => write!(f, "parent checkpoint {id} not found"),
            Self::InvalidProjectRoot(path) => {
                write!(f, "invalid project root: {}", path.display())
            }
            Self::Cas(err) => write!(f, "{err}"),
            Self::Timeline(msg) => write!(f, "timeline: {msg}"),
            Self::Io(msg) => write!(f, "checkpoint io: {msg}"),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<CasError> for CheckpointError {
    fn from(err: CasError) -> Self {
        Self::Cas(err)
    }
}

// ── Restore ──────────────────────────────────────────────────────────────────

/// Failure of a restore. Variants raised after files were touched carry the
/// partial [`RestoreReport`]; the target directory is left as-is.
#[derive(Debug)]
pub enum RestoreError {
    /// The checkpoint does not exist in the target's timeline.
    CheckpointNotFound(CheckpointId),
    /// The pre-restore backup snapshot failed; nothing was written.
    Backup(CheckpointError),
    /// A referenced object is gone (typically after an improper gc).
    MissingObject {
        /// Digest that could not be found.
        digest: Digest,
        /// File the digest belongs to.
        path: String,
        /// Work completed before the failure.
        partial: RestoreReport,
    },
    /// A referenced object failed verification.
    Corrupted {
        /// Underlying integrity error.
        source: CasError,
        /// File the digest belongs to.
        path: String,
        /// Work completed before the failure.
        partial: RestoreReport,
    },
    /// A record path would land outside the target root.
    PathViolation {
        /// Offending record path.
        path: String,
        /// Work completed before the failure.
        partial: RestoreReport,
    },
    /// Filesystem failure.
    Io {
        /// Diagnostic message.
        message: String,
        /// Work completed before the failure.
        partial: RestoreReport,
    },
}

impl RestoreError {
    /// Work completed before the failure, when any was attempted.
    #[must_use]
    pub fn partial_report(&self) -> Option<&RestoreReport> {
        match self {
            Self::CheckpointNotFound(_) | Self::Backup(_) => None,
            Self::MissingObject { partial, .. }
            | Self::Corrupted { partial, .. }
            | Self::PathViolation { partial, .. }
            | Self::Io { partial, .. } => Some(partial),
        }
    }
}

impl Display for RestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CheckpointNotFound(id) => write!(f, "checkpoint {id} not found"),
            Self::Backup(err) => write!(f, "pre-restore backup failed: {err}"),
            Self::MissingObject { digest, path, .. } => {
                write!(f, "object {digest} for {path} is missing")
            }
            Self::Corrupted { source, path, .. } => write!(f, "{path}: {source}"),
            Self::PathViolation { path, .. } => {
                write!(f, "path violation: {path} escapes the target root")
            }
            Self::Io { message, .. } => write!(f, "restore io: {message}"),
        }
    }
}

impl std::error::Error for RestoreError {}

// ── Application ──────────────────────────────────────────────────────────────

/// Coarse classification used to decide whether automated retry is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The failure is confined to one session.
    Session,
    /// Stored content is missing or does not verify.
    Integrity,
    /// A caller broke an API contract (unknown id, invalid transition).
    Contract,
    /// Configuration could not be loaded or validated.
    Config,
    /// Filesystem or OS failure.
    Io,
}

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Session could not be started.
    Spawn(SpawnError),
    /// Session could not be cancelled.
    Cancel(CancelError),
    /// Registry contract violation.
    Registry(RegistryError),
    /// Supervisor operation failure.
    Supervisor(SupervisorError),
    /// Content store failure.
    Cas(CasError),
    /// Checkpoint operation failure.
    Checkpoint(CheckpointError),
    /// Restore failure.
    Restore(RestoreError),
    /// Binary resolution failure.
    Resolve(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Classify the error for retry decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) => ErrorClass::Config,
            Self::Spawn(_) | Self::Resolve(_) => ErrorClass::Session,
            Self::Cancel(CancelError::NotFound(_))
            | Self::Registry(_)
            | Self::Supervisor(
                SupervisorError::NotFound(_)
                | SupervisorError::AlreadyAttached(_)
                | SupervisorError::InputClosed(_),
            ) => ErrorClass::Contract,
            Self::Cancel(CancelError::Signal(_)) | Self::Supervisor(SupervisorError::Io(_)) => {
                ErrorClass::Session
            }
            Self::Cas(err) | Self::Checkpoint(CheckpointError::Cas(err)) => cas_class(err),
            Self::Checkpoint(CheckpointError::NotFound(_) | CheckpointError::ParentNotFound(_))
            | Self::Restore(RestoreError::CheckpointNotFound(_) | RestoreError::PathViolation { .. }) => {
                ErrorClass::Contract
            }
            Self::Restore(RestoreError::MissingObject { .. } | RestoreError::Corrupted { .. }) => {
                ErrorClass::Integrity
            }
            Self::Checkpoint(_) | Self::Restore(_) | Self::Io(_) => ErrorClass::Io,
        }
    }

    /// Whether repeating the same call may reasonably succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Spawn(SpawnError::ProcessLimitExceeded(_)) => true,
            Self::Spawn(_) => false,
            other => other.class() == ErrorClass::Io,
        }
    }
}

fn cas_class(err: &CasError) -> ErrorClass {
    match err {
        CasError::NotFound(_) | CasError::Corrupted { .. } => ErrorClass::Integrity,
        CasError::InvalidDigest(_) => ErrorClass::Contract,
        CasError::Io(_) => ErrorClass::Io,
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(err) => write!(f, "spawn: {err}"),
            Self::Cancel(err) => write!(f, "cancel: {err}"),
            Self::Registry(err) => write!(f, "registry: {err}"),
            Self::Supervisor(err) => write!(f, "supervisor: {err}"),
            Self::Cas(err) => write!(f, "cas: {err}"),
            Self::Checkpoint(err) => write!(f, "checkpoint: {err}"),
            Self::Restore(err) => write!(f, "restore: {err}"),
            Self::Resolve(msg) => write!(f, "binary resolution: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<SpawnError> for AppError {
    fn from(err: SpawnError) -> Self {
        Self::Spawn(err)
    }
}

impl From<CancelError> for AppError {
    fn from(err: CancelError) -> Self {
        Self::Cancel(err)
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<SupervisorError> for AppError {
    fn from(err: SupervisorError) -> Self {
        Self::Supervisor(err)
    }
}

impl From<CasError> for AppError {
    fn from(err: CasError) -> Self {
        Self::Cas(err)
    }
}

impl From<CheckpointError> for AppError {
    fn from(err: CheckpointError) -> Self {
        Self::Checkpoint(err)
    }
}

impl From<RestoreError> for AppError {
    fn from(err: RestoreError) -> Self {
        Self::Restore(err)
    }
}
