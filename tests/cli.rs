//! Smoke tests for the `dpw` binary.
//!
//! These invoke the compiled binary end-to-end, checking argument
//! handling and exit behaviour that unit tests cannot see.

use std::path::PathBuf;
use std::process::Command;

fn dpw_bin() -> PathBuf {
    // set by cargo for integration tests of [[bin]] targets
    PathBuf::from(env!("CARGO_BIN_EXE_dpw"))
}

#[test]
fn version_flag_names_the_tool() {
    let output = Command::new(dpw_bin())
        .arg("--version")
        .output()
        .expect("failed to execute dpw");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("dpw"), "version output should contain 'dpw': {stdout}");
}

#[test]
fn analyse_requires_a_build_output_path() {
    let repo = tempfile::tempdir().unwrap();
    let output = Command::new(dpw_bin())
        .args(["analyse", "--maven-repo"])
        .arg(repo.path())
        .output()
        .expect("failed to execute dpw");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("build output path"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn analyse_fails_fast_when_the_tracker_command_is_missing() {
    let repo = tempfile::tempdir().unwrap();
    let build = tempfile::tempdir().unwrap();
    let output = Command::new(dpw_bin())
        .arg("analyse")
        .arg(build.path())
        .arg("--maven-repo")
        .arg(repo.path())
        .args(["--tracker-cmd", "dpw-no-such-extractor"])
        .output()
        .expect("failed to execute dpw");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("dpw-no-such-extractor"),
        "unexpected stderr: {stderr}"
    );
}

#[test]
fn analyze_spelling_is_accepted() {
    // alias must parse; it still fails later on the missing tracker
    let repo = tempfile::tempdir().unwrap();
    let build = tempfile::tempdir().unwrap();
    let output = Command::new(dpw_bin())
        .arg("analyze")
        .arg(build.path())
        .arg("--maven-repo")
        .arg(repo.path())
        .args(["--tracker-cmd", "dpw-no-such-extractor"])
        .output()
        .expect("failed to execute dpw");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !stderr.contains("unrecognized subcommand"),
        "alias rejected: {stderr}"
    );
}
