//! Drives the controller against real processes using shell-script stand-ins
//! for the engine binary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use s5_runner::{
    probe_version, CancelOutcome, OsSpawner, TransferArgs, TransferController, TransferError,
};
use tempfile::TempDir;

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn args(dir: &Path) -> TransferArgs {
    TransferArgs::new("bucket", "models/file.bin", dir.join("out"))
}

#[tokio::test]
async fn progress_lines_reach_the_watch_channel() {
    let dir = TempDir::new().unwrap();
    let program = script(
        dir.path(),
        "fake-s5cmd",
        r#"for p in 10.00 55.50 100.00; do printf '%s%% 1 MiB / 2 MiB\r' "$p" >&2; sleep 0.05; done
exit 0"#,
    );

    let (_controller, events) =
        TransferController::start(&OsSpawner, program.to_str().unwrap(), &args(dir.path()))
            .await
            .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), events.completion)
        .await
        .unwrap()
        .unwrap();

    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(outcome.progress, 100.0);
    assert_eq!(*events.progress.borrow(), 100.0);
}

#[tokio::test]
async fn non_zero_exit_reports_stderr_tail() {
    let dir = TempDir::new().unwrap();
    let program = script(
        dir.path(),
        "fake-s5cmd",
        r#"echo "ERROR access denied" >&2
exit 3"#,
    );

    let (_controller, events) =
        TransferController::start(&OsSpawner, program.to_str().unwrap(), &args(dir.path()))
            .await
            .unwrap();
    let outcome = events.completion.await.unwrap();

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(outcome.error_detail.as_deref(), Some("ERROR access denied"));
}

#[tokio::test]
async fn pause_resume_then_cancel_terminates_group() {
    let dir = TempDir::new().unwrap();
    let program = script(dir.path(), "fake-s5cmd", "while true; do sleep 0.1; done");

    let (controller, events) =
        TransferController::start(&OsSpawner, program.to_str().unwrap(), &args(dir.path()))
            .await
            .unwrap();
    assert!(controller.is_alive());

    controller.pause().unwrap();
    controller.resume().unwrap();
    let outcome = controller.cancel(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Terminated);

    let done = events.completion.await.unwrap();
    assert!(done.cancelled);
    assert!(!controller.is_alive());
}

#[tokio::test]
async fn cancel_kills_process_that_traps_term() {
    let dir = TempDir::new().unwrap();
    let program = script(
        dir.path(),
        "stubborn-s5cmd",
        "trap '' TERM\nwhile true; do sleep 0.1; done",
    );

    let (controller, events) =
        TransferController::start(&OsSpawner, program.to_str().unwrap(), &args(dir.path()))
            .await
            .unwrap();
    // Let the shell install its trap
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = controller.cancel(Duration::from_millis(300)).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Killed);
    let done = events.completion.await.unwrap();
    assert!(done.cancelled);
}

#[tokio::test]
async fn missing_binary_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("no-such-s5cmd");
    let err = TransferController::start(&OsSpawner, missing.to_str().unwrap(), &args(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Launch { .. }));
}

#[tokio::test]
async fn version_probe_reads_first_stdout_line() {
    let dir = TempDir::new().unwrap();
    let program = script(dir.path(), "fake-s5cmd", "echo v2.2.2-48f7e59");
    let version = probe_version(&OsSpawner, program.to_str().unwrap()).await.unwrap();
    assert_eq!(version, "v2.2.2-48f7e59");
}
