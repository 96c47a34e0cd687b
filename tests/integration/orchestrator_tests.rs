//! End-to-end tests for the orchestrator facade with `/bin/sh` standing in
//! for the host CLI.

#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;

use agent_timeline::config::{CheckpointStrategy, GlobalConfig};
use agent_timeline::events::EventEnvelope;
use agent_timeline::models::checkpoint::Metadata;
use agent_timeline::models::message::{MessageBody, StreamMessage};
use agent_timeline::models::session::{CancelOutcome, SessionId, StateKind};
use agent_timeline::orchestrator::{SessionFilter, SessionRequest};
use agent_timeline::{AppError, Orchestrator};

fn config(store: &Path, script: &str) -> GlobalConfig {
    let raw = format!(
        "store_root = \"{}\"\nhost_cli = \"/bin/sh\"\noutput_format_args = []\n",
        store.display()
    );
    let mut config = GlobalConfig::from_toml_str(&raw).expect("config");
    config.host_cli_args = vec!["-c".into(), script.into()];
    config.timeouts.cancel_grace_ms = 200;
    config
}

fn orchestrator(store: &Path, script: &str) -> Orchestrator {
    Orchestrator::from_config(&config(store, script)).expect("orchestrator")
}

async fn drain(orchestrator: &Orchestrator, id: &SessionId) -> Vec<StreamMessage> {
    let output = orchestrator.attach_output(id).expect("attach");
    tokio::time::timeout(Duration::from_secs(10), output.collect::<Vec<_>>())
        .await
        .expect("stream ends")
}

fn published(rx: &mut tokio::sync::broadcast::Receiver<EventEnvelope>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        names.push(envelope.event.name());
    }
    names
}

// ── Sessions ─────────────────────────────────────────────────

#[tokio::test]
async fn prompt_and_project_path_reach_the_process() {
    let store = tempfile::tempdir().expect("store");
    let project = tempfile::tempdir().expect("project");
    // With `sh -c`, the first trailing argument becomes `$0`.
    let script = r#"printf '{"type":"result","is_error":false,"prompt":"%s","project":"%s"}\n' "$0" "$AGENT_PROJECT_PATH""#;
    let orchestrator = orchestrator(store.path(), script);

    let handle = orchestrator
        .create_session(SessionRequest::new(project.path()).with_prompt("fix the bug"))
        .expect("create");
    let messages = drain(&orchestrator, &handle.session_id).await;
    let expected_project = project.path().to_string_lossy().into_owned();

    match &messages[0].body {
        MessageBody::Result { payload, .. } => {
            assert_eq!(payload["prompt"], "fix the bug");
            assert_eq!(payload["project"], expected_project.as_str());
        }
        other => panic!("unexpected body: {other:?}"),
    }
    let outcome = orchestrator
        .await_session(&handle.session_id)
        .await
        .expect("outcome");
    assert_eq!(outcome.state.kind(), StateKind::Completed);
}

#[tokio::test]
async fn structured_messages_are_written_as_json_lines() {
    let store = tempfile::tempdir().expect("store");
    let project = tempfile::tempdir().expect("project");
    let orchestrator = orchestrator(store.path(), r#"read -r line; printf '%s\n' "$line""#);

    let mut request = SessionRequest::new(project.path());
    request.session_id = Some(SessionId::from("chosen-id"));
    let handle = orchestrator.create_session(request).expect("create");
    assert_eq!(handle.session_id.as_str(), "chosen-id");

    orchestrator
        .send_message(&handle.session_id, &json!({"type": "user", "text": "hello"}))
        .await
        .expect("send");
    let messages = drain(&orchestrator, &handle.session_id).await;

    match &messages[0].body {
        MessageBody::PartialOutput { payload } => assert_eq!(payload["text"], "hello"),
        other => panic!("unexpected body: {other:?}"),
    }
}

#[tokio::test]
async fn cancel_session_through_the_facade() {
    let store = tempfile::tempdir().expect("store");
    let project = tempfile::tempdir().expect("project");
    let orchestrator = orchestrator(store.path(), "sleep 30");

    let handle = orchestrator
        .create_session(SessionRequest::new(project.path()))
        .expect("create");
    assert_eq!(orchestrator.sessions(&SessionFilter::active()).len(), 1);

    let outcome = orchestrator
        .cancel_session(&handle.session_id, "user abort")
        .await
        .expect("cancel");
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let view = orchestrator.session(&handle.session_id).expect("view");
    assert_eq!(view.state.kind(), StateKind::Cancelled);
    assert!(orchestrator.sessions(&SessionFilter::active()).is_empty());
}

#[tokio::test]
async fn unresolvable_host_cli_is_reported() {
    let store = tempfile::tempdir().expect("store");
    let project = tempfile::tempdir().expect("project");
    let mut config = config(store.path(), "true");
    config.host_cli = "definitely-not-an-installed-agent-cli".into();
    let orchestrator = Orchestrator::from_config(&config).expect("orchestrator");

    let err = orchestrator
        .create_session(SessionRequest::new(project.path()))
        .expect_err("must fail");
    assert!(matches!(err, AppError::Resolve(_)));
    assert!(orchestrator.sessions(&SessionFilter::default()).is_empty());
}

// ── Checkpoints ──────────────────────────────────────────────

#[tokio::test]
async fn on_exit_strategy_checkpoints_the_working_dir() {
    let store = tempfile::tempdir().expect("store");
    let project = tempfile::tempdir().expect("project");
    std::fs::write(project.path().join("existing.txt"), "before").expect("write");

    let mut config = config(store.path(), "printf 'generated' > made.txt");
    config.checkpoint.strategy = CheckpointStrategy::OnExit;
    let orchestrator = Orchestrator::from_config(&config).expect("orchestrator");
    let mut rx = orchestrator.events().subscribe();

    let handle = orchestrator
        .create_session(SessionRequest::new(project.path()))
        .expect("create");
    orchestrator
        .await_session(&handle.session_id)
        .await
        .expect("outcome");
    orchestrator.shutdown("test done").await;

    let summaries = orchestrator
        .list_checkpoints(project.path(), None)
        .await
        .expect("list");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].label, "session exit");
    assert_eq!(summaries[0].file_count, 2);

    let checkpoint = orchestrator
        .checkpoints()
        .get(project.path(), &summaries[0].id)
        .await
        .expect("get");
    assert_eq!(checkpoint.metadata["trigger"], "session_exit");
    assert_eq!(checkpoint.metadata["state"], "completed");
    assert_eq!(checkpoint.metadata["session_id"], handle.session_id.as_str());

    assert_eq!(
        published(&mut rx),
        vec!["session_started", "session_finished", "checkpoint_created"]
    );
}

#[tokio::test]
async fn manual_strategy_takes_no_exit_checkpoint() {
    let store = tempfile::tempdir().expect("store");
    let project = tempfile::tempdir().expect("project");
    let orchestrator = orchestrator(store.path(), "true");

    let handle = orchestrator
        .create_session(SessionRequest::new(project.path()))
        .expect("create");
    orchestrator
        .await_session(&handle.session_id)
        .await
        .expect("outcome");
    orchestrator.shutdown("test done").await;

    assert!(orchestrator
        .list_checkpoints(project.path(), None)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn checkpoint_operations_publish_events() {
    let store = tempfile::tempdir().expect("store");
    let project = tempfile::tempdir().expect("project");
    let file = project.path().join("notes.md");
    std::fs::write(&file, "draft one").expect("write");

    let orchestrator = orchestrator(store.path(), "true");
    let mut rx = orchestrator.events().subscribe();

    let first = orchestrator
        .create_checkpoint(project.path(), "draft one", Metadata::new())
        .await
        .expect("first");
    std::fs::write(&file, "draft two").expect("write");
    let second = orchestrator
        .create_checkpoint(project.path(), "draft two", Metadata::new())
        .await
        .expect("second");
    assert_eq!(second.parent_id.as_ref(), Some(&first.id));

    let diff = orchestrator
        .diff_checkpoints(project.path(), &first.id, &second.id)
        .await
        .expect("diff");
    assert_eq!(diff.len(), 1);

    let report = orchestrator
        .restore_checkpoint(&first.id, project.path(), true)
        .await
        .expect("restore");
    assert_eq!(report.files_unchanged, 0);
    assert_eq!(report.files_written, 1);
    assert_eq!(std::fs::read_to_string(&file).expect("read"), "draft one");

    let branch = orchestrator
        .branch_checkpoint(project.path(), &second.id, "alternative")
        .await
        .expect("branch");
    assert_eq!(branch.parent_id.as_ref(), Some(&second.id));

    assert!(orchestrator
        .divergence(project.path(), &first.id)
        .await
        .expect("divergence")
        .is_empty());

    let gc = orchestrator.collect_garbage().await.expect("gc");
    assert_eq!(gc.removed_objects, 0);

    assert_eq!(
        published(&mut rx),
        vec![
            "checkpoint_created",
            "checkpoint_created",
            "checkpoint_restored",
            "checkpoint_branched",
        ]
    );
}

#[tokio::test]
async fn explicit_parent_must_exist() {
    let store = tempfile::tempdir().expect("store");
    let project = tempfile::tempdir().expect("project");
    let orchestrator = orchestrator(store.path(), "true");

    let missing = agent_timeline::models::checkpoint::CheckpointId::from("missing");
    let err = orchestrator
        .create_checkpoint_from(project.path(), "x", Some(&missing), Metadata::new())
        .await
        .expect_err("must fail");
    assert!(matches!(err, AppError::Checkpoint(_)));
}
