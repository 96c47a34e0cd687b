#![forbid(unsafe_code)]

//! `agent-timeline`: run agent CLI sessions and manage working-tree
//! checkpoints from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_timeline::config::GlobalConfig;
use agent_timeline::events::{spawn_event_sink, JsonlEventWriter};
use agent_timeline::models::checkpoint::{CheckpointId, Metadata};
use agent_timeline::orchestrator::SessionRequest;
use agent_timeline::{AppError, Orchestrator, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-timeline", about = "Agent session supervisor with checkpoint timelines", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a session and print its messages as JSON lines.
    Run {
        /// Working directory of the session.
        #[arg(long)]
        dir: PathBuf,
        /// Initial prompt.
        #[arg(long)]
        prompt: Option<String>,
        /// Extra arguments passed to the host CLI after `--`.
        #[arg(last = true)]
        extra: Vec<String>,
    },
    /// Snapshot a project directory.
    Snapshot {
        /// Project directory.
        #[arg(long)]
        project: PathBuf,
        /// Checkpoint label.
        #[arg(long, default_value = "manual")]
        label: String,
        /// Explicit parent; defaults to the current head.
        #[arg(long)]
        parent: Option<String>,
    },
    /// Replace a project directory with a checkpoint.
    Restore {
        /// Project directory.
        #[arg(long)]
        project: PathBuf,
        /// Checkpoint to restore.
        #[arg(long)]
        checkpoint: String,
        /// Skip the automatic pre-restore snapshot.
        #[arg(long)]
        no_backup: bool,
    },
    /// Create a branch node from a checkpoint.
    Branch {
        /// Project directory.
        #[arg(long)]
        project: PathBuf,
        /// Checkpoint to branch from.
        #[arg(long)]
        checkpoint: String,
        /// Branch label.
        #[arg(long)]
        label: String,
    },
    /// List checkpoints, newest first.
    List {
        /// Project directory.
        #[arg(long)]
        project: PathBuf,
        /// Maximum number of entries.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show paths that differ between two checkpoints, or between a
    /// checkpoint and the live tree when `--to` is omitted.
    Diff {
        /// Project directory.
        #[arg(long)]
        project: PathBuf,
        /// Base checkpoint.
        #[arg(long)]
        from: String,
        /// Compared checkpoint.
        #[arg(long)]
        to: Option<String>,
    },
    /// Remove objects no checkpoint references.
    Gc,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(store_root = %config.store_root.display(), "configuration loaded");

    let orchestrator = Orchestrator::from_config(&config)?;

    // ── Start event sink ────────────────────────────────
    let ct = CancellationToken::new();
    let sink_handle = match &config.events_log_dir {
        Some(dir) => {
            let writer = Arc::new(JsonlEventWriter::new(dir.clone())?);
            info!(events_log_dir = %dir.display(), "event log enabled");
            Some(spawn_event_sink(orchestrator.events(), writer, ct.clone()))
        }
        None => None,
    };

    let result = dispatch(&orchestrator, args.command).await;

    // ── Drain background tasks ──────────────────────────
    orchestrator.shutdown("orchestrator exiting").await;
    ct.cancel();
    if let Some(handle) = sink_handle {
        let _ = handle.await;
    }
    result
}

async fn dispatch(orchestrator: &Orchestrator, command: Command) -> Result<()> {
    match command {
        Command::Run { dir, prompt, extra } => run_session(orchestrator, dir, prompt, extra).await,
        Command::Snapshot {
            project,
            label,
            parent,
        } => {
            let checkpoint = match parent {
                Some(parent) => {
                    let parent = CheckpointId::from(parent);
                    orchestrator
                        .create_checkpoint_from(&project, &label, Some(&parent), Metadata::new())
                        .await?
                }
                None => {
                    orchestrator
                        .create_checkpoint(&project, &label, Metadata::new())
                        .await?
                }
            };
            print_json(&checkpoint.summary())
        }
        Command::Restore {
            project,
            checkpoint,
            no_backup,
        } => {
            let report = orchestrator
                .restore_checkpoint(&CheckpointId::from(checkpoint), &project, !no_backup)
                .await?;
            print_json(&report)
        }
        Command::Branch {
            project,
            checkpoint,
            label,
        } => {
            let branch = orchestrator
                .branch_checkpoint(&project, &CheckpointId::from(checkpoint), &label)
                .await?;
            print_json(&branch.summary())
        }
        Command::List { project, limit } => {
            for summary in orchestrator.list_checkpoints(&project, limit).await? {
                print_json(&summary)?;
            }
            Ok(())
        }
        Command::Diff { project, from, to } => {
            let from = CheckpointId::from(from);
            let entries = match to {
                Some(to) => {
                    orchestrator
                        .diff_checkpoints(&project, &from, &CheckpointId::from(to))
                        .await?
                }
                None => orchestrator.divergence(&project, &from).await?,
            };
            for entry in &entries {
                print_json(entry)?;
            }
            Ok(())
        }
        Command::Gc => {
            let report = orchestrator.collect_garbage().await?;
            print_json(&report)
        }
    }
}

/// Run one session to completion, cancelling it on Ctrl-C or `SIGTERM`.
async fn run_session(
    orchestrator: &Orchestrator,
    dir: PathBuf,
    prompt: Option<String>,
    extra: Vec<String>,
) -> Result<()> {
    let mut request = SessionRequest::new(absolute(&dir)?);
    request.prompt = prompt;
    request.extra_args = extra;

    let handle = orchestrator.create_session(request)?;
    let session_id = handle.session_id;
    info!(session_id = %session_id, pid = handle.pid.unwrap_or(0), "session running");

    // The prompt travels as an argument; nothing is forwarded on stdin.
    orchestrator.close_input(&session_id).await?;
    let mut output = orchestrator.attach_output(&session_id)?;

    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut cancelled = false;

    loop {
        tokio::select! {
            message = output.next() => {
                let Some(message) = message else { break };
                let mut line = serde_json::to_vec(&message)
                    .map_err(|err| AppError::Io(format!("failed to encode message: {err}")))?;
                line.push(b'\n');
                stdout.write_all(&line).await?;
                stdout.flush().await?;
            }
            () = &mut shutdown, if !cancelled => {
                cancelled = true;
                info!(session_id = %session_id, "shutdown signal received, cancelling session");
                if let Err(err) = orchestrator.cancel_session(&session_id, "interrupted by user").await {
                    error!(%err, "failed to cancel session");
                }
            }
        }
    }

    let outcome = orchestrator.await_session(&session_id).await?;
    info!(
        session_id = %session_id,
        state = %outcome.state.kind(),
        exit_code = outcome.exit_code,
        "session ended"
    );
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|err| AppError::Config(format!("invalid directory {}: {err}", path.display())))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value)
        .map_err(|err| AppError::Io(format!("failed to encode output: {err}")))?;
    println!("{line}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
