//! Integration tests for the process supervisor using `/bin/sh` scripts as
//! stand-in agent processes.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;

use agent_timeline::errors::{CancelError, SpawnError, SupervisorError};
use agent_timeline::events::{EventBus, LifecycleEvent};
use agent_timeline::models::message::{LifecycleBody, MessageBody, StreamMessage};
use agent_timeline::models::session::{CancelOutcome, SessionId, SessionState, StateKind};
use agent_timeline::orchestrator::{ProcessSupervisor, SessionRegistry, SpawnRequest, SupervisorConfig};

fn supervisor(config: SupervisorConfig) -> (ProcessSupervisor, EventBus) {
    let events = EventBus::default();
    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
    (ProcessSupervisor::new(registry, config, events.clone()), events)
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        cancel_grace: Duration::from_millis(300),
        ..SupervisorConfig::default()
    }
}

fn script(id: &str, dir: &Path, body: &str) -> SpawnRequest {
    SpawnRequest {
        session_id: SessionId::from(id),
        executable: PathBuf::from("/bin/sh"),
        args: vec!["-c".into(), body.into()],
        env: Vec::new(),
        working_dir: dir.to_path_buf(),
    }
}

async fn collect(supervisor: &ProcessSupervisor, id: &SessionId) -> Vec<StreamMessage> {
    let output = supervisor.attach_output(id).expect("attach");
    tokio::time::timeout(Duration::from_secs(10), output.collect::<Vec<_>>())
        .await
        .expect("stream ends")
}

// ── Output ───────────────────────────────────────────────────

#[tokio::test]
async fn output_is_decoded_in_order_and_closed_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    let body = r#"printf '%s\n' '{"type":"system","subtype":"init"}' 'not json' '{"type":"result","is_error":false}'"#;
    let handle = supervisor
        .start(script("out", dir.path(), body))
        .expect("start");
    assert!(handle.pid.is_some());

    let messages = collect(&supervisor, &handle.session_id).await;
    let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
    assert!(matches!(
        &messages[0].body,
        MessageBody::System { subtype: Some(s), .. } if s == "init"
    ));
    assert!(messages[1].is_error(), "malformed line is reported, not fatal");
    assert!(matches!(messages[2].body, MessageBody::Result { is_error: false, .. }));
    assert!(matches!(
        messages[3].body,
        MessageBody::Lifecycle {
            event: LifecycleBody::StreamClosed
        }
    ));

    let outcome = supervisor
        .await_completion(&handle.session_id)
        .await
        .expect("outcome");
    assert_eq!(outcome.state, SessionState::Completed { exit_code: 0 });
    assert_eq!(outcome.exit_code, Some(0));

    let view = supervisor
        .registry()
        .get(&handle.session_id)
        .expect("retained");
    assert_eq!(view.messages, 4);
}

#[tokio::test]
async fn output_can_be_attached_only_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    let handle = supervisor
        .start(script("once", dir.path(), "sleep 5"))
        .expect("start");

    let _first = supervisor.attach_output(&handle.session_id).expect("attach");
    assert!(matches!(
        supervisor.attach_output(&handle.session_id),
        Err(SupervisorError::AlreadyAttached(_))
    ));
    supervisor
        .cancel(&handle.session_id, "test done")
        .await
        .expect("cancel");
}

#[tokio::test]
async fn input_round_trips_through_the_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    let handle = supervisor
        .start(script("echo", dir.path(), "while read -r line; do printf '%s\\n' \"$line\"; done"))
        .expect("start");
    let id = handle.session_id;

    supervisor
        .send_input(&id, r#"{"type":"assistant","text":"hi"}"#)
        .await
        .expect("send");
    supervisor.close_input(&id).await.expect("close");
    assert!(matches!(
        supervisor.send_input(&id, "late").await,
        Err(SupervisorError::InputClosed(_))
    ));

    let messages = collect(&supervisor, &id).await;
    assert_eq!(messages.len(), 2);
    match &messages[0].body {
        MessageBody::PartialOutput { payload } => assert_eq!(payload["text"], "hi"),
        other => panic!("unexpected body: {other:?}"),
    }
    let outcome = supervisor.await_completion(&id).await.expect("outcome");
    assert_eq!(outcome.state.kind(), StateKind::Completed);
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (supervisor, _) = supervisor(fast_config());
    let id = SessionId::from("ghost");

    assert!(matches!(
        supervisor.attach_output(&id),
        Err(SupervisorError::NotFound(_))
    ));
    assert!(matches!(
        supervisor.send_input(&id, "x").await,
        Err(SupervisorError::NotFound(_))
    ));
    assert!(matches!(
        supervisor.cancel(&id, "x").await,
        Err(CancelError::NotFound(_))
    ));
}

// ── Exit classification ──────────────────────────────────────

#[tokio::test]
async fn non_zero_exit_is_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, events) = supervisor(fast_config());
    let mut rx = events.subscribe();
    let handle = supervisor
        .start(script("fail", dir.path(), "exit 3"))
        .expect("start");

    let outcome = supervisor
        .await_completion(&handle.session_id)
        .await
        .expect("outcome");
    assert!(matches!(
        outcome.state,
        SessionState::Failed {
            exit_code: Some(3),
            ..
        }
    ));

    let started = rx.recv().await.expect("started");
    assert!(matches!(started.event, LifecycleEvent::SessionStarted { .. }));
    let finished = rx.recv().await.expect("finished");
    assert!(matches!(
        finished.event,
        LifecycleEvent::SessionFinished {
            exit_code: Some(3),
            ..
        }
    ));
}

#[tokio::test]
async fn missing_executable_fails_to_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    let mut request = script("missing", dir.path(), "");
    request.executable = PathBuf::from("/no/such/agent-binary");

    let err = supervisor.start(request).expect_err("must fail");
    assert!(matches!(err, SpawnError::NotFound(_)));
    let view = supervisor
        .registry()
        .get(&SessionId::from("missing"))
        .expect("failure retained");
    assert_eq!(view.state.kind(), StateKind::Failed);
}

#[tokio::test]
async fn invalid_working_dir_is_rejected_before_registering() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());

    let err = supervisor
        .start(script("nowhere", &dir.path().join("absent"), "true"))
        .expect_err("must fail");
    assert!(matches!(err, SpawnError::InvalidWorkingDir(_)));
    assert!(supervisor.registry().get(&SessionId::from("nowhere")).is_none());
}

#[tokio::test]
async fn duplicate_session_id_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    supervisor
        .start(script("dup", dir.path(), "sleep 5"))
        .expect("first");

    let err = supervisor
        .start(script("dup", dir.path(), "true"))
        .expect_err("must fail");
    assert!(matches!(err, SpawnError::DuplicateSession(_)));
    supervisor.shutdown("test done").await;
}

#[tokio::test]
async fn concurrent_session_limit_is_enforced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(SupervisorConfig {
        max_concurrent_sessions: 1,
        ..fast_config()
    });
    supervisor
        .start(script("first", dir.path(), "sleep 5"))
        .expect("first");

    let err = supervisor
        .start(script("second", dir.path(), "true"))
        .expect_err("limit");
    assert!(matches!(err, SpawnError::ProcessLimitExceeded(_)));

    supervisor.shutdown("test done").await;
    supervisor
        .start(script("third", dir.path(), "true"))
        .expect("slot freed after shutdown");
}

// ── Cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn cancel_terminates_and_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    let handle = supervisor
        .start(script("cancel", dir.path(), "sleep 30"))
        .expect("start");
    let id = handle.session_id;

    let first = supervisor.cancel(&id, "user request").await.expect("cancel");
    assert_eq!(first, CancelOutcome::Cancelled);

    let view = supervisor.registry().get(&id).expect("retained");
    assert_eq!(
        view.state,
        SessionState::Cancelled {
            reason: "user request".into()
        }
    );

    let second = supervisor.cancel(&id, "again").await.expect("second cancel");
    assert!(matches!(
        second,
        CancelOutcome::AlreadyTerminal(SessionState::Cancelled { ref reason }) if reason == "user request"
    ));

    let outcome = supervisor.await_completion(&id).await.expect("outcome");
    assert!(outcome.state.is_cancellation());
}

#[tokio::test]
async fn cancel_after_natural_exit_reports_terminal_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    let handle = supervisor
        .start(script("done", dir.path(), "true"))
        .expect("start");
    supervisor
        .await_completion(&handle.session_id)
        .await
        .expect("outcome");

    let outcome = supervisor
        .cancel(&handle.session_id, "too late")
        .await
        .expect("cancel");
    assert_eq!(
        outcome,
        CancelOutcome::AlreadyTerminal(SessionState::Completed { exit_code: 0 })
    );
}

#[tokio::test]
async fn term_ignoring_process_is_killed_after_grace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    let body = r#"trap '' TERM; printf '%s\n' '{"type":"system","subtype":"ready"}'; sleep 30"#;
    let handle = supervisor
        .start(script("stubborn", dir.path(), body))
        .expect("start");
    let id = handle.session_id;

    let mut output = supervisor.attach_output(&id).expect("attach");
    let ready = tokio::time::timeout(Duration::from_secs(5), output.next())
        .await
        .expect("ready in time")
        .expect("ready message");
    assert!(matches!(ready.body, MessageBody::System { .. }));

    let started = Instant::now();
    let result = supervisor.cancel(&id, "stop").await.expect("cancel");
    assert_eq!(result, CancelOutcome::Cancelled);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(10));

    let outcome = supervisor.await_completion(&id).await.expect("outcome");
    assert_eq!(outcome.signal, Some(9), "SIGKILL after the grace period");
}

#[tokio::test]
async fn cancel_sweeps_descendants_that_ignore_term() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    // The leader exits on TERM; its background child ignores TERM.
    let body = r#"sh -c 'trap "" TERM; sleep 30' & echo $! > grandchild.pid; printf '%s\n' '{"type":"system","subtype":"ready"}'; wait"#;
    let handle = supervisor
        .start(script("family", dir.path(), body))
        .expect("start");
    let id = handle.session_id;

    let mut output = supervisor.attach_output(&id).expect("attach");
    tokio::time::timeout(Duration::from_secs(5), output.next())
        .await
        .expect("ready in time")
        .expect("ready message");
    let grandchild = std::fs::read_to_string(dir.path().join("grandchild.pid"))
        .expect("pid file")
        .trim()
        .to_owned();
    assert!(process_alive(&grandchild), "background child running before cancel");

    let result = supervisor.cancel(&id, "stop").await.expect("cancel");
    assert_eq!(result, CancelOutcome::Cancelled);

    let deadline = Instant::now() + Duration::from_secs(5);
    while process_alive(&grandchild) {
        assert!(Instant::now() < deadline, "background child {grandchild} survived cancel");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let outcome = supervisor.await_completion(&id).await.expect("outcome");
    assert_eq!(outcome.state.kind(), StateKind::Cancelled);
}

/// Running and not a zombie, according to `ps`.
fn process_alive(pid: &str) -> bool {
    let out = std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", pid])
        .output()
        .expect("ps");
    let stat = String::from_utf8_lossy(&out.stdout);
    let stat = stat.trim();
    !stat.is_empty() && !stat.starts_with('Z')
}

#[tokio::test]
async fn session_timeout_terminates_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(SupervisorConfig {
        session_timeout: Some(Duration::from_millis(200)),
        ..fast_config()
    });
    let handle = supervisor
        .start(script("slow", dir.path(), "sleep 30"))
        .expect("start");

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        supervisor.await_completion(&handle.session_id),
    )
    .await
    .expect("deadline enforced")
    .expect("outcome");
    match outcome.state {
        SessionState::TimedOut { timeout_ms, .. } => assert_eq!(timeout_ms, 200),
        other => panic!("unexpected state: {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_cancels_every_live_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (supervisor, _) = supervisor(fast_config());
    let ids: Vec<SessionId> = ["a", "b", "c"]
        .into_iter()
        .map(|id| {
            supervisor
                .start(script(id, dir.path(), "sleep 30"))
                .expect("start")
                .session_id
        })
        .collect();

    supervisor.shutdown("shutting down").await;

    for id in &ids {
        let view = supervisor.registry().get(id).expect("retained");
        assert_eq!(view.state.kind(), StateKind::Cancelled);
    }
    assert_eq!(supervisor.registry().active_count(), 0);
}
