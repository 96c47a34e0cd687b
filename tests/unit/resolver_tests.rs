use agent_timeline::orchestrator::{BinaryResolver, StaticBinaryResolver};
use agent_timeline::AppError;

#[test]
fn explicit_existing_path_resolves() {
    let temp = tempfile::tempdir().expect("tempdir");
    let binary = temp.path().join("agent");
    std::fs::write(&binary, "#!/bin/sh\n").expect("write");

    let resolved = StaticBinaryResolver::new(&binary)
        .with_version("1.2.3")
        .resolve()
        .expect("resolves");
    assert_eq!(resolved.path, binary);
    assert_eq!(resolved.version.as_deref(), Some("1.2.3"));
}

#[test]
fn explicit_missing_path_is_resolve_error() {
    let err = StaticBinaryResolver::new("/no/such/agent")
        .resolve()
        .expect_err("must fail");
    assert!(matches!(err, AppError::Resolve(msg) if msg.contains("/no/such/agent")));
}

#[cfg(unix)]
#[test]
fn bare_name_is_searched_on_path() {
    let resolved = StaticBinaryResolver::new("sh").resolve().expect("sh on PATH");
    assert!(resolved.path.is_absolute());
    assert!(resolved.path.ends_with("sh"));
}

#[test]
fn unknown_bare_name_is_resolve_error() {
    assert!(matches!(
        StaticBinaryResolver::new("definitely-not-an-installed-agent-cli").resolve(),
        Err(AppError::Resolve(_))
    ));
}
