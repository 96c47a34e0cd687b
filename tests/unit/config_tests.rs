use std::time::Duration;

use serial_test::serial;

use agent_timeline::config::{CheckpointStrategy, GlobalConfig, STORE_ROOT_ENV};
use agent_timeline::AppError;

fn sample_toml(store_root: &str) -> String {
    format!(
        r#"
store_root = '{store_root}'
host_cli = "claude"
host_cli_args = ["--dangerously-skip-permissions"]
project_path_env = "PROJECT_DIR"

[limits]
max_concurrent_sessions = 2
max_record_bytes = 65536

[timeouts]
cancel_grace_ms = 1500
session_timeout_seconds = 600
retention_seconds = 60

[checkpoint]
ignore = [".git", "dist"]
compression_level = 9
strategy = "on_exit"
"#
    )
}

#[test]
fn parses_valid_config() {
    let config = GlobalConfig::from_toml_str(&sample_toml("/var/lib/agent-timeline"))
        .expect("config parses");

    assert_eq!(config.store_root.to_str(), Some("/var/lib/agent-timeline"));
    assert_eq!(config.host_cli_args, vec!["--dangerously-skip-permissions"]);
    assert_eq!(config.project_path_env, "PROJECT_DIR");
    assert_eq!(config.limits.max_concurrent_sessions, 2);
    assert_eq!(config.checkpoint.compression_level, 9);
    assert_eq!(config.checkpoint.strategy, CheckpointStrategy::OnExit);
    assert!(config.ignore_list().is_ignored("dist/app.js"));
}

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("store_root = '/tmp/store'").expect("config parses");

    assert_eq!(config.host_cli, "claude");
    assert_eq!(
        config.output_format_args,
        vec!["--output-format", "stream-json", "--verbose"]
    );
    assert_eq!(config.project_path_env, "AGENT_PROJECT_PATH");
    assert_eq!(config.limits.max_concurrent_sessions, 8);
    assert_eq!(config.limits.max_record_bytes, 1_048_576);
    assert_eq!(config.timeouts.cancel_grace_ms, 5000);
    assert_eq!(config.timeouts.retention_seconds, 300);
    assert_eq!(config.checkpoint.compression_level, 3);
    assert_eq!(config.checkpoint.strategy, CheckpointStrategy::Manual);
    assert!(config.events_log_dir.is_none());

    let ignore = config.ignore_list();
    assert!(ignore.is_ignored(".git/HEAD"));
    assert!(ignore.is_ignored("crates/core/target/debug/app"));
    assert!(ignore.is_ignored("web/node_modules/x/index.js"));
    assert!(!ignore.is_ignored("src/main.rs"));
}

#[test]
fn supervisor_config_maps_timeouts() {
    let config = GlobalConfig::from_toml_str(&sample_toml("/tmp/store")).expect("config parses");
    let supervisor = config.supervisor_config();

    assert_eq!(supervisor.cancel_grace, Duration::from_millis(1500));
    assert_eq!(supervisor.session_timeout, Some(Duration::from_secs(600)));
    assert_eq!(supervisor.max_concurrent_sessions, 2);
    assert_eq!(supervisor.max_record_bytes, 65536);
}

#[test]
fn zero_session_timeout_means_no_deadline() {
    let config = GlobalConfig::from_toml_str("store_root = '/tmp/store'").expect("config parses");
    assert_eq!(config.supervisor_config().session_timeout, None);
}

#[test]
fn rejects_zero_concurrency() {
    let toml = "store_root = '/tmp/store'\n[limits]\nmax_concurrent_sessions = 0\n";
    let err = GlobalConfig::from_toml_str(toml).expect_err("validation must fail");
    assert!(matches!(err, AppError::Config(msg) if msg.contains("max_concurrent_sessions")));
}

#[test]
fn rejects_out_of_range_compression_level() {
    for level in [0, 23] {
        let toml = format!("store_root = '/tmp/store'\n[checkpoint]\ncompression_level = {level}\n");
        let err = GlobalConfig::from_toml_str(&toml).expect_err("validation must fail");
        assert!(matches!(err, AppError::Config(msg) if msg.contains("compression_level")));
    }
}

#[test]
fn rejects_unknown_strategy() {
    let toml = "store_root = '/tmp/store'\n[checkpoint]\nstrategy = \"hourly\"\n";
    assert!(matches!(
        GlobalConfig::from_toml_str(toml),
        Err(AppError::Config(_))
    ));
}

#[test]
fn missing_store_root_is_an_error() {
    assert!(matches!(
        GlobalConfig::from_toml_str("host_cli = 'claude'"),
        Err(AppError::Config(_))
    ));
}

#[test]
#[serial]
fn env_override_replaces_store_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(&path, sample_toml("/from/file")).expect("write config");

    std::env::set_var(STORE_ROOT_ENV, "/from/env");
    let loaded = GlobalConfig::load_from_path(&path);
    std::env::remove_var(STORE_ROOT_ENV);

    let config = loaded.expect("config loads");
    assert_eq!(config.store_root.to_str(), Some("/from/env"));
}

#[test]
#[serial]
fn load_from_path_without_override_keeps_file_value() {
    std::env::remove_var(STORE_ROOT_ENV);
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    std::fs::write(&path, sample_toml("/from/file")).expect("write config");

    let config = GlobalConfig::load_from_path(&path).expect("config loads");
    assert_eq!(config.store_root.to_str(), Some("/from/file"));
}

#[test]
fn load_from_missing_path_is_config_error() {
    let err = GlobalConfig::load_from_path("/definitely/not/here.toml").expect_err("must fail");
    assert!(matches!(err, AppError::Config(msg) if msg.contains("failed to read config")));
}
