//! TokioSpawner tests against real short-lived shell processes.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use qless::config::SpawnConfig;
use qless::error::QlessError;
use qless::worker::{JobInfo, ProcessSpawner, TokioSpawner};
use tokio::time::timeout;

fn shell(script: &str) -> SpawnConfig {
    SpawnConfig {
        program: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

/// Test that stdout lines parse as job reports while non-report output
/// is skipped, and that the exit notification resolves.
#[tokio::test]
async fn test_stdout_reports_and_exit() {
    let script = concat!(
        r#"echo '{"jid":"jid-1","expires":1700000060.5}'; "#,
        "echo 'plain log line'; ",
        r#"echo '{"jid":null}'"#
    );
    let mut child = TokioSpawner.spawn(&shell(script), &[]).await.unwrap();
    assert!(child.pid > 0);

    let first = timeout(Duration::from_secs(5), child.messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, JobInfo::started("jid-1", 1700000060.5));

    let second = timeout(Duration::from_secs(5), child.messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, JobInfo::ended());

    let closed = timeout(Duration::from_secs(5), child.messages.recv())
        .await
        .unwrap();
    assert!(closed.is_none(), "report stream ends with the child");

    let status = timeout(Duration::from_secs(5), child.exit)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(status.success());
}

/// Test that trailing args land on the child's command line after the
/// configured marker args.
#[tokio::test]
async fn test_trailing_args_reach_the_child() {
    let config = shell(r#"printf '{"jid":"%s","expires":1}\n' "$1""#);
    let trailing = vec!["marker".to_string(), "jid-from-arg".to_string()];
    let mut child = TokioSpawner.spawn(&config, &trailing).await.unwrap();

    let report = timeout(Duration::from_secs(5), child.messages.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.jid.as_deref(), Some("jid-from-arg"));
}

/// Test that a nonzero exit code comes back in the exit status.
#[tokio::test]
async fn test_nonzero_exit_code() {
    let child = TokioSpawner.spawn(&shell("exit 3"), &[]).await.unwrap();

    let status = timeout(Duration::from_secs(5), child.exit)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!status.success());
    assert_eq!(status.code(), Some(3));
}

/// Test that the control handle signals the real process.
#[tokio::test]
async fn test_control_handle_kills_the_child() {
    let child = TokioSpawner.spawn(&shell("sleep 30"), &[]).await.unwrap();
    assert_eq!(child.control.pid(), child.pid);

    child.control.signal(Signal::SIGKILL).unwrap();

    let status = timeout(Duration::from_secs(5), child.exit)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!status.success());
    assert_eq!(status.signal(), Some(9));
}

/// Test that signalling an already-dead pid is not an error.
#[tokio::test]
async fn test_signal_after_exit_is_quiet() {
    let child = TokioSpawner.spawn(&shell("exit 0"), &[]).await.unwrap();
    let status = timeout(Duration::from_secs(5), child.exit)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(status.success());

    // The process is gone; ESRCH folds into Ok
    child.control.signal(Signal::SIGTERM).unwrap();
}

/// Test that a missing program surfaces as a process error.
#[tokio::test]
async fn test_missing_program_fails_to_spawn() {
    let config = SpawnConfig {
        program: PathBuf::from("/nonexistent/worker-binary"),
        args: Vec::new(),
    };

    match TokioSpawner.spawn(&config, &[]).await {
        Err(QlessError::Process(message)) => assert!(message.contains("failed to spawn")),
        other => panic!("expected a process error, got {:?}", other.map(|_| ())),
    }
}
