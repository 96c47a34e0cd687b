//! Orchestrator facade.
//!
//! Composes binary resolution, the process supervisor, the session registry
//! and the checkpoint store into the operations a transport layer exposes:
//! create, send, attach, cancel and await sessions, plus snapshot, restore,
//! branch, list, diff and gc for checkpoints. Every checkpoint mutation is
//! published on the [`EventBus`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{info, info_span, warn, Instrument};

use super::output::OutputStream;
use super::registry::{SessionFilter, SessionRegistry};
use super::resolver::{BinaryResolver, StaticBinaryResolver};
use super::spawner::SpawnRequest;
use super::supervisor::ProcessSupervisor;
use crate::cas::{ContentStore, ZstdCompressor};
use crate::checkpoint::store::OBJECTS_DIR;
use crate::checkpoint::{CheckpointStore, GcReport};
use crate::config::{CheckpointStrategy, GlobalConfig};
use crate::events::{EventBus, LifecycleEvent};
use crate::models::checkpoint::{
    Checkpoint, CheckpointId, CheckpointSummary, DivergenceEntry, Metadata, RestoreReport,
};
use crate::models::session::{CancelOutcome, ExitOutcome, SessionHandle, SessionId, SessionView};
use crate::{AppError, Result};

/// Default variable carrying the session's working directory.
pub const DEFAULT_PROJECT_PATH_ENV: &str = "AGENT_PROJECT_PATH";

/// Label of checkpoints taken automatically when a session ends.
pub const SESSION_EXIT_LABEL: &str = "session exit";

/// How sessions are launched and checkpointed.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Arguments placed before everything else.
    pub host_cli_args: Vec<String>,
    /// Arguments asking the host CLI for line-delimited structured output.
    pub output_format_args: Vec<String>,
    /// Variable set to the working directory in the child environment.
    pub project_path_env: String,
    /// When checkpoints are taken without an explicit request.
    pub checkpoint_strategy: CheckpointStrategy,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            host_cli_args: Vec::new(),
            output_format_args: vec![
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
            ],
            project_path_env: DEFAULT_PROJECT_PATH_ENV.into(),
            checkpoint_strategy: CheckpointStrategy::Manual,
        }
    }
}

/// Parameters of [`Orchestrator::create_session`].
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Directory the session works in.
    pub working_dir: PathBuf,
    /// Initial prompt, passed as the final argument.
    pub prompt: Option<String>,
    /// Arguments appended after the configured ones.
    pub extra_args: Vec<String>,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
    /// Caller-chosen identifier; generated when absent.
    pub session_id: Option<SessionId>,
}

impl SessionRequest {
    /// A session in `working_dir` with no prompt.
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            prompt: None,
            extra_args: Vec::new(),
            env: Vec::new(),
            session_id: None,
        }
    }

    /// Set the initial prompt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Entry point composing sessions and checkpoints.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    supervisor: ProcessSupervisor,
    checkpoints: Arc<CheckpointStore>,
    resolver: Arc<dyn BinaryResolver>,
    events: EventBus,
    options: Arc<OrchestratorOptions>,
    background: TaskTracker,
}

impl Orchestrator {
    /// Assemble an orchestrator from its parts.
    ///
    /// The supervisor should publish on the same `events` bus.
    #[must_use]
    pub fn new(
        supervisor: ProcessSupervisor,
        checkpoints: Arc<CheckpointStore>,
        resolver: Arc<dyn BinaryResolver>,
        events: EventBus,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            supervisor,
            checkpoints,
            resolver,
            events,
            options: Arc::new(options),
            background: TaskTracker::new(),
        }
    }

    /// Build every component from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Checkpoint`] if the store directories cannot be
    /// created.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        let events = EventBus::default();
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(
            config.timeouts.retention_seconds,
        )));
        let supervisor = ProcessSupervisor::new(registry, config.supervisor_config(), events.clone());

        let compressor = Arc::new(ZstdCompressor::new(config.checkpoint.compression_level));
        let objects = ContentStore::with_compressor(config.store_root.join(OBJECTS_DIR), compressor)?;
        let checkpoints = Arc::new(CheckpointStore::with_content_store(
            config.store_root.clone(),
            objects,
            config.ignore_list(),
        ));

        let resolver = Arc::new(StaticBinaryResolver::new(&config.host_cli));
        let options = OrchestratorOptions {
            host_cli_args: config.host_cli_args.clone(),
            output_format_args: config.output_format_args.clone(),
            project_path_env: config.project_path_env.clone(),
            checkpoint_strategy: config.checkpoint.strategy,
        };
        Ok(Self::new(supervisor, checkpoints, resolver, events, options))
    }

    /// Lifecycle event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Underlying checkpoint store.
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Underlying process supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    fn registry(&self) -> &Arc<SessionRegistry> {
        self.supervisor.registry()
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// Resolve the host CLI and start a session.
    ///
    /// With the `on_exit` strategy a checkpoint of the working directory is
    /// taken once the session reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Resolve`] if no executable is available, or
    /// [`AppError::Spawn`] if the process cannot be started.
    pub fn create_session(&self, request: SessionRequest) -> Result<SessionHandle> {
        let binary = self.resolver.resolve()?;
        let session_id = request.session_id.unwrap_or_else(SessionId::generate);

        let mut args = self.options.host_cli_args.clone();
        args.extend(self.options.output_format_args.iter().cloned());
        args.extend(request.extra_args);
        if let Some(prompt) = request.prompt {
            args.push(prompt);
        }

        let mut env = vec![(
            self.options.project_path_env.clone(),
            request.working_dir.to_string_lossy().into_owned(),
        )];
        env.extend(request.env);

        let handle = self.supervisor.start(SpawnRequest {
            session_id,
            executable: binary.path,
            args,
            env,
            working_dir: request.working_dir,
        })?;

        if self.options.checkpoint_strategy == CheckpointStrategy::OnExit {
            self.spawn_exit_checkpoint(handle.session_id.clone());
        }
        Ok(handle)
    }

    fn spawn_exit_checkpoint(&self, session_id: SessionId) {
        let this = self.clone();
        let span = info_span!("exit_checkpoint", session_id = %session_id);
        self.background.spawn(
            async move {
                let outcome = match this.supervisor.await_completion(&session_id).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(%err, "cannot observe session completion");
                        return;
                    }
                };
                let Some(view) = this.registry().get(&session_id) else {
                    warn!("session left the registry before its exit checkpoint");
                    return;
                };

                let mut metadata = Metadata::new();
                metadata.insert("session_id".into(), session_id.as_str().into());
                metadata.insert("trigger".into(), "session_exit".into());
                metadata.insert("state".into(), outcome.state.kind().to_string().into());
                if let Err(err) = this
                    .create_checkpoint(&view.working_dir, SESSION_EXIT_LABEL, metadata)
                    .await
                {
                    warn!(%err, "exit checkpoint failed");
                }
            }
            .instrument(span),
        );
    }

    /// Take the session's decoded output stream.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Supervisor`] for an unknown session or when the
    /// stream was already taken.
    pub fn attach_output(&self, session_id: &SessionId) -> Result<OutputStream> {
        Ok(self.supervisor.attach_output(session_id)?)
    }

    /// Send one structured message to the session as a JSON line.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Supervisor`] if the session's input is closed.
    pub async fn send_message(&self, session_id: &SessionId, message: &serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(message)
            .map_err(|err| AppError::Io(format!("failed to encode message: {err}")))?;
        self.send_input(session_id, &line).await
    }

    /// Write one raw line to the session's stdin.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Supervisor`] if the session's input is closed.
    pub async fn send_input(&self, session_id: &SessionId, line: &str) -> Result<()> {
        Ok(self.supervisor.send_input(session_id, line).await?)
    }

    /// Close the session's stdin.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Supervisor`] for an unknown session.
    pub async fn close_input(&self, session_id: &SessionId) -> Result<()> {
        Ok(self.supervisor.close_input(session_id).await?)
    }

    /// Cancel a session. Idempotent on terminal sessions.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Cancel`] for an unknown session or a signal
    /// delivery failure.
    pub async fn cancel_session(&self, session_id: &SessionId, reason: &str) -> Result<CancelOutcome> {
        Ok(self.supervisor.cancel(session_id, reason).await?)
    }

    /// Wait for a session to reach a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Supervisor`] if no process is supervised for it.
    pub async fn await_session(&self, session_id: &SessionId) -> Result<ExitOutcome> {
        Ok(self.supervisor.await_completion(session_id).await?)
    }

    /// Current view of one session.
    #[must_use]
    pub fn session(&self, session_id: &SessionId) -> Option<SessionView> {
        self.registry().get(session_id)
    }

    /// Sessions matching `filter`, oldest first.
    #[must_use]
    pub fn sessions(&self, filter: &SessionFilter) -> Vec<SessionView> {
        self.registry().list(filter)
    }

    /// Cancel every live session and wait for pending exit checkpoints.
    pub async fn shutdown(&self, reason: &str) {
        info!(active = self.registry().active_count(), reason, "orchestrator shutting down");
        self.supervisor.shutdown(reason).await;
        self.background.close();
        self.background.wait().await;
    }

    // ── Checkpoints ──────────────────────────────────────────────────────

    /// Snapshot `project_root` on top of its current head.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Checkpoint`] on walk or storage failure.
    pub async fn create_checkpoint(
        &self,
        project_root: &Path,
        label: &str,
        metadata: Metadata,
    ) -> Result<Checkpoint> {
        let checkpoint = self
            .checkpoints
            .snapshot_on_head(project_root, label, metadata)
            .await?;
        self.publish_created(project_root, &checkpoint);
        Ok(checkpoint)
    }

    /// Snapshot `project_root` with an explicit parent (`None` for a root).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Checkpoint`] if the parent is unknown or on
    /// storage failure.
    pub async fn create_checkpoint_from(
        &self,
        project_root: &Path,
        label: &str,
        parent: Option<&CheckpointId>,
        metadata: Metadata,
    ) -> Result<Checkpoint> {
        let checkpoint = self
            .checkpoints
            .snapshot(project_root, label, parent, metadata)
            .await?;
        self.publish_created(project_root, &checkpoint);
        Ok(checkpoint)
    }

    fn publish_created(&self, project_root: &Path, checkpoint: &Checkpoint) {
        self.events.publish(LifecycleEvent::CheckpointCreated {
            project_root: project_root.to_path_buf(),
            checkpoint_id: checkpoint.id.clone(),
            label: checkpoint.label.clone(),
            files: checkpoint.files.len(),
        });
    }

    /// Replace `project_root` with the content of `checkpoint_id`, a
    /// checkpoint from that project's own timeline.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Restore`]; mid-restore failures carry the
    /// partial report.
    pub async fn restore_checkpoint(
        &self,
        checkpoint_id: &CheckpointId,
        project_root: &Path,
        create_backup: bool,
    ) -> Result<RestoreReport> {
        let report = self
            .checkpoints
            .restore(checkpoint_id, project_root, create_backup)
            .await?;
        self.events.publish(LifecycleEvent::CheckpointRestored {
            project_root: project_root.to_path_buf(),
            checkpoint_id: checkpoint_id.clone(),
            report: report.clone(),
        });
        Ok(report)
    }

    /// Create a branch node from `checkpoint_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Checkpoint`] if the checkpoint is unknown.
    pub async fn branch_checkpoint(
        &self,
        project_root: &Path,
        checkpoint_id: &CheckpointId,
        label: &str,
    ) -> Result<Checkpoint> {
        let branch = self
            .checkpoints
            .branch(project_root, checkpoint_id, label)
            .await?;
        self.events.publish(LifecycleEvent::CheckpointBranched {
            project_root: project_root.to_path_buf(),
            source_id: checkpoint_id.clone(),
            checkpoint_id: branch.id.clone(),
        });
        Ok(branch)
    }

    /// Checkpoint summaries, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Checkpoint`] if the timeline cannot be read.
    pub async fn list_checkpoints(
        &self,
        project_root: &Path,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointSummary>> {
        Ok(self.checkpoints.list(project_root, limit).await?)
    }

    /// Paths that differ between two checkpoints.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Checkpoint`] if either checkpoint is unknown.
    pub async fn diff_checkpoints(
        &self,
        project_root: &Path,
        from: &CheckpointId,
        to: &CheckpointId,
    ) -> Result<Vec<DivergenceEntry>> {
        Ok(self.checkpoints.diff(project_root, from, to).await?)
    }

    /// Paths in the live tree that differ from `checkpoint_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Checkpoint`] if the checkpoint is unknown.
    pub async fn divergence(
        &self,
        project_root: &Path,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<DivergenceEntry>> {
        Ok(self.checkpoints.divergence(project_root, checkpoint_id).await?)
    }

    /// Remove objects no timeline references.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Checkpoint`] if a timeline cannot be read.
    pub async fn collect_garbage(&self) -> Result<GcReport> {
        Ok(self.checkpoints.collect_garbage().await?)
    }
}
