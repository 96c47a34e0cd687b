//! Unit tests for `SessionRegistry`.
//!
//! # Scenarios covered
//!
//! | Scenario | Expectation |
//! |----------|-------------|
//! | Register | New sessions start in `Starting` |
//! | Legal path | `Starting → Running → Completed` |
//! | Terminal is final | Any transition out of a terminal state is rejected |
//! | Skipping `Running` | `Starting → Completed` is rejected |
//! | Bounded register | Active count is enforced atomically |
//! | Grace removal | Terminal sessions disappear after the retention period |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_timeline::errors::RegistryError;
use agent_timeline::models::session::{SessionId, SessionState, StateKind};
use agent_timeline::orchestrator::registry::{BoundedRegisterError, SessionFilter, SessionRegistry};

fn dir() -> PathBuf {
    PathBuf::from("/work/project")
}

fn cancelled() -> SessionState {
    SessionState::Cancelled {
        reason: "test".into(),
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

#[test]
fn register_starts_in_starting_state() {
    let registry = SessionRegistry::default();
    let view = registry
        .register(SessionId::from("s1"), dir())
        .expect("register");

    assert_eq!(view.state, SessionState::Starting);
    assert_eq!(registry.get(&"s1".into()).expect("present").working_dir, dir());
    assert_eq!(registry.active_count(), 1);
}

#[test]
fn duplicate_registration_is_rejected() {
    let registry = SessionRegistry::default();
    registry.register("s1".into(), dir()).expect("first");

    assert_eq!(
        registry.register("s1".into(), dir()),
        Err(RegistryError::Duplicate("s1".into()))
    );
}

#[test]
fn bounded_register_enforces_active_limit() {
    let registry = SessionRegistry::default();
    registry
        .register_bounded("a".into(), dir(), 2)
        .expect("first");
    registry
        .register_bounded("b".into(), dir(), 2)
        .expect("second");

    assert_eq!(
        registry.register_bounded("c".into(), dir(), 2),
        Err(BoundedRegisterError::LimitReached {
            active: 2,
            limit: 2
        })
    );

    // A terminal session frees its slot.
    registry
        .transition(&"a".into(), cancelled())
        .expect("cancel a");
    registry
        .register_bounded("c".into(), dir(), 2)
        .expect("slot freed");
}

// ── Transitions ───────────────────────────────────────────────────────────────

#[test]
fn legal_lifecycle_path_is_accepted() {
    let registry = SessionRegistry::default();
    let id = SessionId::from("s1");
    registry.register(id.clone(), dir()).expect("register");

    registry
        .transition(&id, SessionState::Running)
        .expect("running");
    let view = registry
        .transition(&id, SessionState::Completed { exit_code: 0 })
        .expect("completed");

    assert_eq!(view.state.kind(), StateKind::Completed);
    assert_eq!(registry.active_count(), 0);
}

#[test]
fn terminal_states_are_final() {
    let registry = SessionRegistry::default();
    let id = SessionId::from("s1");
    registry.register(id.clone(), dir()).expect("register");
    registry
        .transition(&id, SessionState::Running)
        .expect("running");
    registry.transition(&id, cancelled()).expect("cancelled");

    for next in [
        SessionState::Running,
        SessionState::Completed { exit_code: 0 },
        cancelled(),
    ] {
        let to = next.kind();
        assert_eq!(
            registry.transition(&id, next),
            Err(RegistryError::InvalidTransition {
                session_id: id.clone(),
                from: StateKind::Cancelled,
                to,
            })
        );
    }
}

#[test]
fn starting_cannot_complete_directly() {
    let registry = SessionRegistry::default();
    let id = SessionId::from("s1");
    registry.register(id.clone(), dir()).expect("register");

    assert!(matches!(
        registry.transition(&id, SessionState::Completed { exit_code: 0 }),
        Err(RegistryError::InvalidTransition { .. })
    ));
}

#[test]
fn transition_of_unknown_session_is_not_found() {
    let registry = SessionRegistry::default();
    assert_eq!(
        registry.transition(&"ghost".into(), SessionState::Running),
        Err(RegistryError::NotFound("ghost".into()))
    );
}

// ── Queries ───────────────────────────────────────────────────────────────────

#[test]
fn list_filters_by_state_and_directory() {
    let registry = SessionRegistry::default();
    registry.register("a".into(), dir()).expect("a");
    registry
        .register("b".into(), PathBuf::from("/other"))
        .expect("b");
    registry
        .transition(&"a".into(), SessionState::Running)
        .expect("a running");

    let running = registry.list(&SessionFilter {
        states: vec![StateKind::Running],
        ..SessionFilter::default()
    });
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, SessionId::from("a"));

    let other = registry.list(&SessionFilter {
        working_dir: Some(PathBuf::from("/other")),
        ..SessionFilter::default()
    });
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].id, SessionId::from("b"));

    assert_eq!(registry.list(&SessionFilter::active()).len(), 2);
}

#[test]
fn record_output_accumulates() {
    let registry = SessionRegistry::default();
    let id = SessionId::from("s1");
    registry.register(id.clone(), dir()).expect("register");

    registry.record_output(&id, 100, 1);
    registry.record_output(&id, 50, 2);
    registry.record_output(&"unknown".into(), 1, 1);

    let view = registry.get(&id).expect("present");
    assert_eq!(view.output_bytes, 150);
    assert_eq!(view.messages, 3);
}

// ── Removal ───────────────────────────────────────────────────────────────────

#[test]
fn live_sessions_are_never_removed() {
    let registry = SessionRegistry::default();
    registry.register("s1".into(), dir()).expect("register");

    assert!(registry.remove(&"s1".into()).is_none());
    assert!(registry.get(&"s1".into()).is_some());
}

#[tokio::test]
async fn remove_after_grace_drops_terminal_session() {
    let registry = Arc::new(SessionRegistry::new(Duration::from_millis(20)));
    let id = SessionId::from("s1");
    registry.register(id.clone(), dir()).expect("register");
    registry.transition(&id, cancelled()).expect("cancel");

    let handle = registry.remove_after_grace(id.clone());
    assert!(registry.get(&id).is_some(), "still queryable during grace");

    let removed = handle.await.expect("join");
    assert!(removed.is_some());
    assert!(registry.get(&id).is_none());
}
