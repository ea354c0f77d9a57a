use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::config::SpawnConfig;
use crate::error::{QlessError, Result};
use crate::worker::ipc::JobInfo;

/// Signal delivery to one supervised process.
pub trait ChildControl: Send + Sync {
    fn pid(&self) -> u32;
    fn signal(&self, signal: Signal) -> Result<()>;
}

/// A spawned worker process as the supervisor sees it: its identity, the
/// stream of its job reports, an exit notification, and a signal handle.
pub struct SpawnedChild {
    pub pid: u32,
    pub messages: mpsc::Receiver<JobInfo>,
    pub exit: oneshot::Receiver<std::io::Result<ExitStatus>>,
    pub control: Box<dyn ChildControl>,
}

/// Launches worker processes. The production implementation executes the
/// configured program; tests substitute scripted children.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Start one worker process. `trailing_args` carries the serialized
    /// entry contract and goes after the configured marker args.
    async fn spawn(&self, config: &SpawnConfig, trailing_args: &[String]) -> Result<SpawnedChild>;
}

/// Real OS processes via the async runtime. The child's stdout is parsed
/// as job-report lines; stderr passes straight through so child logs land
/// with the supervisor's.
pub struct TokioSpawner;

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, config: &SpawnConfig, trailing_args: &[String]) -> Result<SpawnedChild> {
        let mut child = tokio::process::Command::new(&config.program)
            .args(&config.args)
            .args(trailing_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                QlessError::Process(format!(
                    "failed to spawn {}: {}",
                    config.program.display(),
                    err
                ))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| QlessError::Process("spawned child has no pid".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| QlessError::Process("child stdout was not captured".to_string()))?;

        let (msg_tx, messages) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<JobInfo>(&line) {
                        Ok(info) => {
                            if msg_tx.send(info).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            tracing::debug!(pid, line = %line, "ignoring non-report child output");
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(pid, error = %err, "child stdout read failed");
                        break;
                    }
                }
            }
        });

        let (exit_tx, exit) = oneshot::channel();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(status);
        });

        Ok(SpawnedChild {
            pid,
            messages,
            exit,
            control: Box::new(UnixControl { pid }),
        })
    }
}

struct UnixControl {
    pid: u32,
}

impl ChildControl for UnixControl {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        match nix::sys::signal::kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => Ok(()),
            // Already gone, which is what a kill wants anyway
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(err) => Err(QlessError::Process(format!(
                "signalling pid {} failed: {}",
                self.pid, err
            ))),
        }
    }
}
