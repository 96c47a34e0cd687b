//! Process supervision: spawn, observe, cancel and reap session processes.
//!
//! Each started process is owned by a dedicated monitor task. The monitor is
//! the only place the child handle lives, and it races three things: natural
//! exit, a cancel request, and the optional session deadline. Whichever wins
//! decides the terminal state; the outcome is then published on a watch
//! channel so any number of [`ProcessSupervisor::await_completion`] callers
//! observe it.
//!
//! Cancellation signals the whole process group: `SIGTERM`, a bounded grace
//! period, then `SIGKILL`, so descendants the child forked do not outlive it.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use super::output::OutputStream;
use super::registry::{BoundedRegisterError, SessionFilter, SessionRegistry};
use super::spawner::{build_command, classify_spawn_error, validate_working_dir, SpawnRequest};
use crate::errors::{CancelError, SpawnError, SupervisorError};
use crate::events::{EventBus, LifecycleEvent};
use crate::models::session::{CancelOutcome, ExitOutcome, SessionHandle, SessionId, SessionState};
use crate::stream::{StreamDecoder, DEFAULT_MAX_RECORD_BYTES};

/// Default window between `SIGTERM` and `SIGKILL`.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Default cap on concurrently running sessions.
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 8;

/// Stderr lines longer than this are logged in pieces.
const STDERR_LINE_MAX: usize = 64 * 1024;

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time a process gets to exit after `SIGTERM`.
    pub cancel_grace: Duration,
    /// Per-session deadline; `None` lets sessions run indefinitely.
    pub session_timeout: Option<Duration>,
    /// Maximum number of non-terminal sessions.
    pub max_concurrent_sessions: usize,
    /// Bound on a single output record.
    pub max_record_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            cancel_grace: DEFAULT_CANCEL_GRACE,
            session_timeout: None,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        }
    }
}

struct CancelRequest {
    reason: String,
    reply: oneshot::Sender<Result<(), CancelError>>,
}

/// Per-process handles shared between the supervisor API and the monitor.
struct Supervised {
    stdout: Mutex<Option<ChildStdout>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    cancel_tx: mpsc::Sender<CancelRequest>,
    outcome: watch::Receiver<Option<ExitOutcome>>,
}

impl Supervised {
    /// Suspend until the monitor has reaped the process.
    async fn reaped(&self) -> Option<ExitOutcome> {
        let mut outcome = self.outcome.clone();
        let guard = outcome.wait_for(Option::is_some).await.ok()?;
        guard.clone()
    }
}

struct Inner {
    registry: Arc<SessionRegistry>,
    config: SupervisorConfig,
    events: EventBus,
    processes: Mutex<HashMap<SessionId, Arc<Supervised>>>,
}

impl Inner {
    fn supervised(&self, id: &SessionId) -> Option<Arc<Supervised>> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn forget(&self, id: &SessionId) {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// Owns every session process from spawn to reaping.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Create a supervisor writing state into `registry` and publishing
    /// lifecycle events on `events`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: SupervisorConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                events,
                processes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The registry this supervisor writes to.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    // ── Start ────────────────────────────────────────────────────────────

    /// Spawn the process described by `request`.
    ///
    /// The session is registered as `Starting`, then moved to `Running` once
    /// the OS has created the process. A spawn failure moves it to `Failed`.
    ///
    /// # Errors
    ///
    /// - [`SpawnError::InvalidWorkingDir`] / [`SpawnError::PermissionDenied`]
    ///   for an unusable working directory.
    /// - [`SpawnError::ProcessLimitExceeded`] when the concurrent session
    ///   limit or an OS process limit is hit.
    /// - [`SpawnError::NotFound`] if the executable does not exist.
    /// - [`SpawnError::DuplicateSession`] if the id is already registered.
    pub fn start(&self, request: SpawnRequest) -> Result<SessionHandle, SpawnError> {
        let span = info_span!("start_session", session_id = %request.session_id);
        let _guard = span.enter();

        let session_id = request.session_id.clone();
        let working_dir = validate_working_dir(&request.working_dir)?;
        let limit = self.inner.config.max_concurrent_sessions;
        self.inner
            .registry
            .register_bounded(session_id.clone(), working_dir.clone(), limit)
            .map_err(|err| match err {
                BoundedRegisterError::LimitReached { active, limit } => {
                    SpawnError::ProcessLimitExceeded(format!(
                        "concurrent session limit reached ({active}/{limit})"
                    ))
                }
                BoundedRegisterError::Registry(_) => SpawnError::DuplicateSession(session_id.clone()),
            })?;

        let request = SpawnRequest {
            working_dir: working_dir.clone(),
            ..request
        };
        let mut child = match build_command(&request).spawn() {
            Ok(child) => child,
            Err(err) => {
                let spawn_err = classify_spawn_error(&err, &request.executable);
                warn!(executable = %request.executable.display(), %spawn_err, "session spawn failed");
                self.fail_start(&session_id, spawn_err.to_string());
                return Err(spawn_err);
            }
        };

        let pid = child.id();
        if let Err(err) = self.inner.registry.set_pid(&session_id, pid) {
            warn!(%err, "failed to record session pid");
        }
        if let Err(err) = self.inner.registry.transition(&session_id, SessionState::Running) {
            // Cancelled while starting; the monitor reaps the killed child.
            warn!(%err, "session left Starting before the process was confirmed");
            child.start_kill().ok();
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(session_id.clone(), stderr);
        }

        let (cancel_tx, cancel_rx) = mpsc::channel(4);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let supervised = Arc::new(Supervised {
            stdout: Mutex::new(stdout),
            stdin: tokio::sync::Mutex::new(stdin),
            cancel_tx,
            outcome: outcome_rx,
        });
        self.inner
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), supervised);

        info!(
            pid = pid.unwrap_or(0),
            executable = %request.executable.display(),
            working_dir = %working_dir.display(),
            "session process started"
        );
        self.inner.events.publish(LifecycleEvent::SessionStarted {
            session_id: session_id.clone(),
            working_dir,
            pid,
        });

        let monitor = Monitor {
            inner: Arc::clone(&self.inner),
            session_id: session_id.clone(),
            pid,
        };
        tokio::spawn(
            monitor
                .run(child, cancel_rx, outcome_tx)
                .instrument(info_span!("session_monitor", session_id = %session_id)),
        );

        Ok(SessionHandle { session_id, pid })
    }

    fn fail_start(&self, session_id: &SessionId, reason: String) {
        let failed = SessionState::Failed {
            reason,
            exit_code: None,
        };
        if let Err(err) = self.inner.registry.transition(session_id, failed) {
            warn!(%err, "failed to record spawn failure");
        }
        drop(self.inner.registry.remove_after_grace(session_id.clone()));
    }

    // ── Output and input ─────────────────────────────────────────────────

    /// Take the session's decoded output stream.
    ///
    /// The stream starts at the first byte the process wrote and can be
    /// taken once.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NotFound`] for an unknown session or
    /// [`SupervisorError::AlreadyAttached`] if the stream was already taken.
    pub fn attach_output(&self, session_id: &SessionId) -> Result<OutputStream, SupervisorError> {
        let supervised = self
            .inner
            .supervised(session_id)
            .ok_or_else(|| SupervisorError::NotFound(session_id.clone()))?;
        let stdout = supervised
            .stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SupervisorError::AlreadyAttached(session_id.clone()))?;

        debug!(session_id = %session_id, "session output attached");
        Ok(OutputStream::new(
            session_id.clone(),
            stdout,
            StreamDecoder::with_max_record_bytes(self.inner.config.max_record_bytes),
            Arc::clone(&self.inner.registry),
        ))
    }

    /// Write one newline-terminated record to the session's stdin.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::InputClosed`] once stdin is closed or the
    /// process stopped reading, [`SupervisorError::NotFound`] for an unknown
    /// session, or [`SupervisorError::Io`] on other write failures.
    pub async fn send_input(&self, session_id: &SessionId, line: &str) -> Result<(), SupervisorError> {
        let supervised = self
            .inner
            .supervised(session_id)
            .ok_or_else(|| SupervisorError::NotFound(session_id.clone()))?;
        let mut stdin = supervised.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(SupervisorError::InputClosed(session_id.clone()));
        };

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        if !line.ends_with('\n') {
            bytes.push(b'\n');
        }

        let written = match pipe.write_all(&bytes).await {
            Ok(()) => pipe.flush().await,
            Err(err) => Err(err),
        };
        match written {
            Ok(()) => {
                debug!(session_id = %session_id, bytes = bytes.len(), "session input written");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                *stdin = None;
                Err(SupervisorError::InputClosed(session_id.clone()))
            }
            Err(err) => {
                warn!(session_id = %session_id, %err, "session input write failed");
                Err(SupervisorError::Io(err.to_string()))
            }
        }
    }

    /// Close the session's stdin so the process sees end of input.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NotFound`] for an unknown session.
    pub async fn close_input(&self, session_id: &SessionId) -> Result<(), SupervisorError> {
        let supervised = self
            .inner
            .supervised(session_id)
            .ok_or_else(|| SupervisorError::NotFound(session_id.clone()))?;
        let pipe = supervised.stdin.lock().await.take();
        if let Some(mut pipe) = pipe {
            pipe.shutdown().await.ok();
            debug!(session_id = %session_id, "session input closed");
        }
        Ok(())
    }

    // ── Cancel and completion ────────────────────────────────────────────

    /// Terminate a session.
    ///
    /// Safe to call from any task and idempotent: a session that already
    /// reached a terminal state yields [`CancelOutcome::AlreadyTerminal`].
    /// On return the process group has been signalled and reaped and the
    /// registry shows the terminal state.
    ///
    /// # Errors
    ///
    /// - [`CancelError::NotFound`] if the session is unknown or was removed
    ///   after its grace period.
    /// - [`CancelError::Signal`] if signal delivery failed. The session is
    ///   still marked `Cancelled`.
    pub async fn cancel(&self, session_id: &SessionId, reason: &str) -> Result<CancelOutcome, CancelError> {
        let span = info_span!("cancel_session", session_id = %session_id, reason);
        async {
            let view = self
                .inner
                .registry
                .get(session_id)
                .ok_or_else(|| CancelError::NotFound(session_id.clone()))?;
            let supervised = self.inner.supervised(session_id);

            if view.state.is_terminal() {
                if let Some(supervised) = &supervised {
                    supervised.reaped().await;
                }
                debug!(state = %view.state.kind(), "cancel on terminal session is a no-op");
                return Ok(CancelOutcome::AlreadyTerminal(view.state));
            }

            let Some(supervised) = supervised else {
                // Still starting: no process handle exists yet.
                let cancelled = SessionState::Cancelled {
                    reason: reason.to_owned(),
                };
                return match self.inner.registry.transition(session_id, cancelled) {
                    Ok(_) => Ok(CancelOutcome::Cancelled),
                    Err(_) => Ok(CancelOutcome::AlreadyTerminal(self.current_state(session_id))),
                };
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            let request = CancelRequest {
                reason: reason.to_owned(),
                reply: reply_tx,
            };
            if supervised.cancel_tx.send(request).await.is_ok() {
                if let Ok(result) = reply_rx.await {
                    return result.map(|()| CancelOutcome::Cancelled);
                }
            }

            // The monitor finished on its own before taking the request.
            supervised.reaped().await;
            Ok::<_, CancelError>(CancelOutcome::AlreadyTerminal(self.current_state(session_id)))
        }
        .instrument(span)
        .await
    }

    fn current_state(&self, session_id: &SessionId) -> SessionState {
        self.inner
            .registry
            .get(session_id)
            .map_or(SessionState::Running, |view| view.state)
    }

    /// Suspend until the session's process has exited, been cancelled, or
    /// timed out.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NotFound`] if no process is supervised for
    /// this session.
    pub async fn await_completion(&self, session_id: &SessionId) -> Result<ExitOutcome, SupervisorError> {
        let supervised = self
            .inner
            .supervised(session_id)
            .ok_or_else(|| SupervisorError::NotFound(session_id.clone()))?;
        supervised
            .reaped()
            .await
            .ok_or_else(|| SupervisorError::Io(format!("monitor for {session_id} ended without an outcome")))
    }

    /// Cancel every live session.
    pub async fn shutdown(&self, reason: &str) {
        let live = self.inner.registry.list(&SessionFilter::active());
        for view in live {
            if let Err(err) = self.cancel(&view.id, reason).await {
                warn!(session_id = %view.id, %err, "failed to cancel session during shutdown");
            }
        }
    }
}

// ── Monitor ──────────────────────────────────────────────────────────────────

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    Cancelled(CancelRequest),
    Deadline,
}

struct Monitor {
    inner: Arc<Inner>,
    session_id: SessionId,
    pid: Option<u32>,
}

impl Monitor {
    async fn run(
        self,
        mut child: Child,
        mut cancel_rx: mpsc::Receiver<CancelRequest>,
        outcome_tx: watch::Sender<Option<ExitOutcome>>,
    ) {
        let timeout = self.inner.config.session_timeout;
        let deadline = timeout.map(|t| (tokio::time::Instant::now() + t, wall_deadline(t)));
        let sleep = async {
            match deadline {
                Some((at, _)) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(sleep);

        let mut requests_open = true;
        let ending = loop {
            tokio::select! {
                status = child.wait() => break Ending::Exited(status),
                request = cancel_rx.recv(), if requests_open => match request {
                    Some(request) => break Ending::Cancelled(request),
                    None => requests_open = false,
                },
                () = &mut sleep => break Ending::Deadline,
            }
        };
        // Late cancel requests see the channel closed and fall back to the
        // registry.
        drop(cancel_rx);

        let (status, state) = match ending {
            Ending::Exited(status) => {
                let state = exit_state(&status);
                self.record(state.clone());
                (status.ok(), state)
            }
            Ending::Cancelled(request) => {
                let state = SessionState::Cancelled {
                    reason: request.reason,
                };
                self.record(state.clone());
                info!("cancel requested, terminating process group");
                let (status, signal_error) = self.terminate(&mut child).await;
                let reply = match signal_error {
                    Some(message) => Err(CancelError::Signal(message)),
                    None => Ok(()),
                };
                request.reply.send(reply).ok();
                (status, state)
            }
            Ending::Deadline => {
                let (deadline, timeout_ms) = match (deadline, timeout) {
                    (Some((_, wall)), Some(t)) => (wall, u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
                    _ => (Utc::now(), 0),
                };
                let state = SessionState::TimedOut {
                    deadline,
                    timeout_ms,
                };
                self.record(state.clone());
                warn!(timeout_ms, "session deadline exceeded, terminating process group");
                let (status, _) = self.terminate(&mut child).await;
                (status, state)
            }
        };

        // The registry is authoritative if a concurrent path won.
        let final_state = self
            .inner
            .registry
            .get(&self.session_id)
            .map_or(state, |view| view.state);
        let outcome = ExitOutcome {
            session_id: self.session_id.clone(),
            state: final_state.clone(),
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(exit_signal),
            finished_at: Utc::now(),
        };
        info!(
            state = %final_state.kind(),
            exit_code = outcome.exit_code,
            signal = outcome.signal,
            "session finished"
        );
        self.inner.events.publish(LifecycleEvent::SessionFinished {
            session_id: self.session_id.clone(),
            state: final_state,
            exit_code: outcome.exit_code,
        });
        outcome_tx.send_replace(Some(outcome));

        if let Ok(removed) = self.inner.registry.remove_after_grace(self.session_id.clone()).await {
            debug!(removed = removed.is_some(), "session retention elapsed");
        }
        self.inner.forget(&self.session_id);
    }

    fn record(&self, state: SessionState) {
        if let Err(err) = self.inner.registry.transition(&self.session_id, state) {
            warn!(%err, "terminal transition rejected");
        }
    }

    /// `SIGTERM` the group, wait out the grace period, then `SIGKILL` it.
    ///
    /// Returns the reaped status and the first signal delivery failure.
    async fn terminate(&self, child: &mut Child) -> (Option<ExitStatus>, Option<String>) {
        let grace = self.inner.config.cancel_grace;
        let mut signal_error = None;

        if let Err(err) = signal_group(child, self.pid, GroupSignal::Terminate) {
            warn!(%err, "failed to deliver termination signal");
            signal_error = Some(err);
        }

        let mut status = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "process exited within grace period");
                Some(status)
            }
            Ok(Err(err)) => {
                warn!(%err, "error waiting for process");
                None
            }
            Err(_) => {
                warn!(?grace, "process did not exit within grace period, forcing kill");
                None
            }
        };

        // Descendants may outlive the group leader; sweep the group either way.
        if let Err(err) = signal_group(child, self.pid, GroupSignal::Kill) {
            if status.is_none() {
                warn!(%err, "failed to deliver kill signal");
                signal_error.get_or_insert(err);
            }
        }

        if status.is_none() {
            child.start_kill().ok();
            status = match child.wait().await {
                Ok(status) => Some(status),
                Err(err) => {
                    warn!(%err, "failed to reap killed process");
                    None
                }
            };
        }
        (status, signal_error)
    }
}

fn wall_deadline(timeout: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn exit_state(status: &std::io::Result<ExitStatus>) -> SessionState {
    match status {
        Ok(status) => match status.code() {
            Some(0) => SessionState::Completed { exit_code: 0 },
            Some(code) => SessionState::Failed {
                reason: format!("process exited with code {code}"),
                exit_code: Some(code),
            },
            None => SessionState::Failed {
                reason: exit_signal(*status).map_or_else(
                    || "process terminated by signal".to_owned(),
                    |signal| format!("process terminated by signal {signal}"),
                ),
                exit_code: None,
            },
        },
        Err(err) => SessionState::Failed {
            reason: format!("wait error: {err}"),
            exit_code: None,
        },
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_wraps)]
fn exit_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps, clippy::needless_pass_by_value)]
fn exit_signal(_status: ExitStatus) -> Option<i32> {
    None
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: Option<u32>, signal: GroupSignal) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return Ok(());
    };
    let pgid = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid), signal) {
        // The whole group is already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(format!("{signal:?} to process group {pgid}: {errno}")),
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _signal: GroupSignal) -> Result<(), String> {
    child.start_kill().map_err(|err| err.to_string())
}

/// Log the child's stderr line by line so the pipe never fills up.
fn spawn_stderr_drain(session_id: SessionId, mut stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut pending = BytesMut::new();
        let mut chunk = vec![0_u8; 8192];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => pending.extend_from_slice(&chunk[..n]),
                Err(err) => {
                    debug!(session_id = %session_id, %err, "session stderr read failed");
                    break;
                }
            }
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line = pending.split_to(pos + 1);
                log_stderr(&session_id, &line[..pos]);
            }
            if pending.len() > STDERR_LINE_MAX {
                let line = pending.split();
                log_stderr(&session_id, &line);
            }
        }
        if !pending.is_empty() {
            log_stderr(&session_id, &pending);
        }
    });
}

fn log_stderr(session_id: &SessionId, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    debug!(session_id = %session_id, line = text.trim_end(), "session stderr");
}
