//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status for a supervised session.
///
/// `Starting → Running → {Completed, Cancelled, Failed, TimedOut}`; every
/// terminal state is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Registered; the OS has not yet confirmed process creation.
    Starting,
    /// Process is alive.
    Running,
    /// Process exited with status zero.
    Completed {
        /// Exit code as reported by the OS.
        exit_code: i32,
    },
    /// Process was terminated on request.
    Cancelled {
        /// Caller-supplied reason.
        reason: String,
    },
    /// Process exited non-zero, died by signal, or failed to start.
    Failed {
        /// Diagnostic text.
        reason: String,
        /// Exit code, when the process exited normally.
        exit_code: Option<i32>,
    },
    /// Process outlived its configured deadline and was terminated.
    TimedOut {
        /// The deadline that was exceeded.
        deadline: DateTime<Utc>,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },
}

/// Discriminant of [`SessionState`] without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// See [`SessionState::Starting`].
    Starting,
    /// See [`SessionState::Running`].
    Running,
    /// See [`SessionState::Completed`].
    Completed,
    /// See [`SessionState::Cancelled`].
    Cancelled,
    /// See [`SessionState::Failed`].
    Failed,
    /// See [`SessionState::TimedOut`].
    TimedOut,
}

impl Display for StateKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(text)
    }
}

impl SessionState {
    /// Payload-free discriminant.
    #[must_use]
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Starting => StateKind::Starting,
            Self::Running => StateKind::Running,
            Self::Completed { .. } => StateKind::Completed,
            Self::Cancelled { .. } => StateKind::Cancelled,
            Self::Failed { .. } => StateKind::Failed,
            Self::TimedOut { .. } => StateKind::TimedOut,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Starting | Self::Running)
    }

    /// Whether the session ended through the cancellation path.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::TimedOut { .. })
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        matches!(
            (self.kind(), next.kind()),
            (
                StateKind::Starting,
                StateKind::Running | StateKind::Failed | StateKind::Cancelled
            ) | (
                StateKind::Running,
                StateKind::Completed
                    | StateKind::Cancelled
                    | StateKind::Failed
                    | StateKind::TimedOut
            )
        )
    }
}

/// Read-only snapshot of a registered session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    /// Session identifier.
    pub id: SessionId,
    /// Directory the process runs in.
    pub working_dir: PathBuf,
    /// Current lifecycle state.
    pub state: SessionState,
    /// OS process id once spawned.
    pub pid: Option<u32>,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Last state change or output activity.
    pub last_activity: DateTime<Utc>,
    /// Bytes of stdout consumed so far.
    pub output_bytes: u64,
    /// Messages decoded so far.
    pub messages: u64,
}

impl SessionView {
    /// Construct a view in the `Starting` state.
    #[must_use]
    pub fn new(id: SessionId, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            working_dir,
            state: SessionState::Starting,
            pid: None,
            created_at: now,
            last_activity: now,
            output_bytes: 0,
            messages: 0,
        }
    }
}

/// Handle returned when a process is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Session identifier.
    pub session_id: SessionId,
    /// OS process id (also the process-group id on unix).
    pub pid: Option<u32>,
}

/// Final result of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    /// Session identifier.
    pub session_id: SessionId,
    /// Terminal state the session reached.
    pub state: SessionState,
    /// Exit code captured verbatim from the OS.
    pub exit_code: Option<i32>,
    /// Terminating signal, when the process died by signal.
    pub signal: Option<i32>,
    /// When the outcome was recorded.
    pub finished_at: DateTime<Utc>,
}

/// Successful result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The process was terminated by this request.
    Cancelled,
    /// The session had already reached this terminal state; nothing changed.
    AlreadyTerminal(SessionState),
}
