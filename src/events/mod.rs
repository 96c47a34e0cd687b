//! Lifecycle event publication.
//!
//! The core publishes session and checkpoint transitions on an [`EventBus`].
//! Publishing never blocks and never fails: a subscriber that falls behind
//! loses the oldest events and is told how many it missed. Anything that
//! reacts to events (hook runners, loggers) runs on its own task and cannot
//! stall or mutate the core.
//!
//! [`spawn_event_sink`] drains the bus into an [`EventSink`], such as the
//! daily-rotated [`JsonlEventWriter`].

pub mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::checkpoint::{CheckpointId, RestoreReport};
use crate::models::session::{SessionId, SessionState};

pub use writer::JsonlEventWriter;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A lifecycle transition observed by the core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A session process is running.
    SessionStarted {
        /// Session identifier.
        session_id: SessionId,
        /// Working directory of the process.
        working_dir: PathBuf,
        /// OS process id.
        pid: Option<u32>,
    },
    /// A session reached a terminal state.
    SessionFinished {
        /// Session identifier.
        session_id: SessionId,
        /// Terminal state.
        state: SessionState,
        /// Exit code, when the process exited normally.
        exit_code: Option<i32>,
    },
    /// A snapshot was recorded.
    CheckpointCreated {
        /// Project the checkpoint belongs to.
        project_root: PathBuf,
        /// New checkpoint.
        checkpoint_id: CheckpointId,
        /// Checkpoint label.
        label: String,
        /// Number of files captured.
        files: usize,
    },
    /// A working tree was restored.
    CheckpointRestored {
        /// Restored directory.
        project_root: PathBuf,
        /// Checkpoint that was restored.
        checkpoint_id: CheckpointId,
        /// Restore counts.
        report: RestoreReport,
    },
    /// A branch node was created.
    CheckpointBranched {
        /// Project the checkpoint belongs to.
        project_root: PathBuf,
        /// Checkpoint branched from.
        source_id: CheckpointId,
        /// New branch node.
        checkpoint_id: CheckpointId,
    },
}

impl LifecycleEvent {
    /// Short name of the event kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionFinished { .. } => "session_finished",
            Self::CheckpointCreated { .. } => "checkpoint_created",
            Self::CheckpointRestored { .. } => "checkpoint_restored",
            Self::CheckpointBranched { .. } => "checkpoint_branched",
        }
    }
}

/// A published event with its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// The event itself.
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

/// Fan-out channel for lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<EventEnvelope>>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish `event` to every current subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let name = event.name();
        let envelope = EventEnvelope {
            timestamp: Utc::now(),
            event,
        };
        let delivered = self.sender.send(envelope).unwrap_or(0);
        debug!(event = name, delivered, "lifecycle event published");
        delivered
    }

    /// Subscribe to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Persists lifecycle events.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`Arc`].
pub trait EventSink: Send + Sync {
    /// Record a single event.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn record(&self, envelope: &EventEnvelope) -> crate::Result<()>;
}

/// Drain `bus` into `sink` on a background task until `cancel` fires or
/// the bus is dropped.
///
/// Sink failures are logged and do not stop the task.
#[must_use]
pub fn spawn_event_sink(
    bus: &EventBus,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    // Flush what was published before the cancel.
                    while let Ok(envelope) = receiver.try_recv() {
                        if let Err(err) = sink.record(&envelope) {
                            warn!(%err, event = envelope.event.name(), "event sink: write failed");
                        }
                    }
                    debug!("event sink: cancellation received, stopping");
                    break;
                }

                received = receiver.recv() => match received {
                    Ok(envelope) => {
                        if let Err(err) = sink.record(&envelope) {
                            warn!(%err, event = envelope.event.name(), "event sink: write failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event sink: lagged behind the bus, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("event sink: bus closed, stopping");
                        break;
                    }
                },
            }
        }
    })
}
