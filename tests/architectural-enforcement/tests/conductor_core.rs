//! Architectural checks over the conductor crates

use std::fs;

use architectural_enforcement::{dependency_names, find_violations, workspace_root, Violation};

fn report(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn no_blocking_sleep_in_async_code() {
    let root = workspace_root().join("conductor");
    let violations = find_violations(&root, &["std::thread::sleep", "thread::sleep("], &[]);
    assert!(
        violations.is_empty(),
        "blocking sleep in async code:\n{}",
        report(&violations)
    );
}

#[test]
fn core_propagates_errors() {
    let src = workspace_root().join("conductor").join("core").join("src");
    // testing.rs is compiled only for tests
    let violations = find_violations(&src, &[".unwrap()", ".expect("], &["testing.rs"]);
    assert!(
        violations.is_empty(),
        "unwrap/expect outside tests:\n{}",
        report(&violations)
    );
}

#[test]
fn core_has_no_process_level_dependencies() {
    let manifest =
        fs::read_to_string(workspace_root().join("conductor").join("core").join("Cargo.toml"))
            .unwrap();
    let names = dependency_names(&manifest);
    assert!(names.iter().any(|n| n == "tokio"), "manifest not parsed: {names:?}");
    for forbidden in ["clap", "tracing-subscriber", "anyhow"] {
        assert!(
            !names.iter().any(|n| n == forbidden),
            "conductor-core must not depend on {forbidden}"
        );
    }
}

#[test]
fn core_has_no_binaries() {
    let bin = workspace_root()
        .join("conductor")
        .join("core")
        .join("src")
        .join("bin");
    assert!(!bin.exists(), "binaries belong in conductor-daemon");
}
