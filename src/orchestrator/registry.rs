//! In-memory index of session state.
//!
//! The registry is the single source of truth for which sessions exist and
//! what state they are in. Only the supervisor mutates it; any component
//! may read. It is injected by shared ownership, never global.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::errors::RegistryError;
use crate::models::session::{SessionId, SessionState, SessionView, StateKind};

/// Default time a terminal session stays queryable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// Selection criteria for [`SessionRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Only sessions in one of these states (any state when empty).
    pub states: Vec<StateKind>,
    /// Only sessions that have not reached a terminal state.
    pub active_only: bool,
    /// Only sessions running in this directory.
    pub working_dir: Option<PathBuf>,
}

impl SessionFilter {
    /// Filter matching every non-terminal session.
    #[must_use]
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    fn matches(&self, view: &SessionView) -> bool {
        if self.active_only && view.state.is_terminal() {
            return false;
        }
        if !self.states.is_empty() && !self.states.contains(&view.state.kind()) {
            return false;
        }
        self.working_dir
            .as_ref()
            .is_none_or(|dir| *dir == view.working_dir)
    }
}

/// Shared map of session views.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionView>>,
    retention: Duration,
}

impl SessionRegistry {
    /// Create a registry keeping terminal sessions for `retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Grace period applied by [`SessionRegistry::remove_after_grace`].
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Register a new session in the `Starting` state.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the id is already present.
    pub fn register(&self, id: SessionId, working_dir: PathBuf) -> Result<SessionView, RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        insert_new(&mut sessions, id, working_dir)
    }

    /// Register a new session unless `limit` sessions are already active.
    ///
    /// The count and the insert happen under one lock, so concurrent starts
    /// cannot overshoot the limit.
    ///
    /// # Errors
    ///
    /// Returns [`BoundedRegisterError::LimitReached`] when the limit is hit,
    /// or [`BoundedRegisterError::Registry`] for a duplicate id.
    pub fn register_bounded(
        &self,
        id: SessionId,
        working_dir: PathBuf,
        limit: usize,
    ) -> Result<SessionView, BoundedRegisterError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let active = sessions.values().filter(|s| !s.state.is_terminal()).count();
        if active >= limit {
            return Err(BoundedRegisterError::LimitReached { active, limit });
        }
        insert_new(&mut sessions, id, working_dir).map_err(BoundedRegisterError::Registry)
    }

    /// Move a session to `new_state`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::NotFound`] if the session is not registered.
    /// - [`RegistryError::InvalidTransition`] if `new_state` is not reachable
    ///   from the current state. Terminal states are final.
    pub fn transition(
        &self,
        id: &SessionId,
        new_state: SessionState,
    ) -> Result<SessionView, RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let view = sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        if !view.state.can_transition_to(&new_state) {
            return Err(RegistryError::InvalidTransition {
                session_id: id.clone(),
                from: view.state.kind(),
                to: new_state.kind(),
            });
        }

        debug!(
            session_id = %id,
            from = %view.state.kind(),
            to = %new_state.kind(),
            "session transition"
        );
        view.state = new_state;
        view.last_activity = Utc::now();
        Ok(view.clone())
    }

    /// Record the OS process id of a session.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the session is not registered.
    pub fn set_pid(&self, id: &SessionId, pid: Option<u32>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let view = sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        view.pid = pid;
        Ok(())
    }

    /// Account for output consumed from a session. Unknown ids are ignored.
    pub fn record_output(&self, id: &SessionId, bytes: u64, messages: u64) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(view) = sessions.get_mut(id) {
            view.output_bytes += bytes;
            view.messages += messages;
            view.last_activity = Utc::now();
        }
    }

    /// Snapshot of one session.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<SessionView> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Sessions matching `filter`, oldest first.
    #[must_use]
    pub fn list(&self, filter: &SessionFilter) -> Vec<SessionView> {
        let mut views: Vec<SessionView> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|view| filter.matches(view))
            .cloned()
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        views
    }

    /// Number of non-terminal sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|view| !view.state.is_terminal())
            .count()
    }

    /// Remove a terminal session now. Live sessions are never removed.
    pub fn remove(&self, id: &SessionId) -> Option<SessionView> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.get(id).is_some_and(|view| view.state.is_terminal()) {
            info!(session_id = %id, "session removed from registry");
            sessions.remove(id)
        } else {
            None
        }
    }

    /// Remove a terminal session once the retention period has passed.
    ///
    /// Late readers can still query the session until then.
    #[must_use]
    pub fn remove_after_grace(self: &Arc<Self>, id: SessionId) -> JoinHandle<Option<SessionView>> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(registry.retention).await;
            registry.remove(&id)
        })
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

/// Failure of [`SessionRegistry::register_bounded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundedRegisterError {
    /// Duplicate id.
    Registry(RegistryError),
    /// Too many active sessions.
    LimitReached {
        /// Active sessions at the time of the call.
        active: usize,
        /// Configured limit.
        limit: usize,
    },
}

fn insert_new(
    sessions: &mut HashMap<SessionId, SessionView>,
    id: SessionId,
    working_dir: PathBuf,
) -> Result<SessionView, RegistryError> {
    if sessions.contains_key(&id) {
        return Err(RegistryError::Duplicate(id));
    }
    let view = SessionView::new(id.clone(), working_dir);
    sessions.insert(id.clone(), view.clone());
    debug!(session_id = %id, "session registered");
    Ok(view)
}
