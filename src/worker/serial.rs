use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::Client;
use crate::config::WorkerOptions;
use crate::error::Result;
use crate::handler::{HandlerError, HandlerResolver};
use crate::job::Job;
use crate::queue::{Queue, DEFAULT_QUEUE};
use crate::shutdown::ShutdownCoordinator;
use crate::worker::ipc::{JobInfo, JobInfoSink};

/// Runs once before a worker's loop starts: connection warmup, handler
/// state, whatever the embedding application needs. Always an explicit
/// code reference, never anything resolved from configuration text.
#[async_trait]
pub trait PreRunHook: Send + Sync {
    async fn before_run(&self, client: &Client) -> Result<()>;
}

/// Single-process worker: reserve, execute, finalize, repeat.
///
/// One job at a time; the only suspension points are the idle backoff and
/// a yield between jobs. Shutdown is honored between reservations only,
/// so an in-flight job always runs to completion first.
pub struct SerialWorker {
    client: Client,
    queues: Vec<Queue>,
    resolver: Arc<dyn HandlerResolver>,
    interval: Duration,
    shutdown: ShutdownCoordinator,
    sink: Option<Box<dyn JobInfoSink>>,
    pre_run: Option<Arc<dyn PreRunHook>>,
}

impl SerialWorker {
    pub fn new(
        client: Client,
        queue_names: &[String],
        resolver: Arc<dyn HandlerResolver>,
        options: &WorkerOptions,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        let queues = if queue_names.is_empty() {
            vec![client.queue(DEFAULT_QUEUE)]
        } else {
            client.queues(queue_names)
        };
        Self {
            client,
            queues,
            resolver,
            interval: Duration::from_millis(options.interval_ms),
            shutdown,
            sink: None,
            pre_run: None,
        }
    }

    /// Report job starts and ends here; the pooled entry point wires this
    /// to stdout for the supervisor.
    pub fn with_sink(mut self, sink: Box<dyn JobInfoSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_pre_run(mut self, hook: Arc<dyn PreRunHook>) -> Self {
        self.pre_run = Some(hook);
        self
    }

    /// Try each queue in listed order; first job found wins. None only
    /// when every queue came up empty.
    pub async fn reserve(&self) -> Result<Option<Job>> {
        for queue in &self.queues {
            if let Some(job) = queue.pop().await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Work the loop until shutdown. Returns Err only when the store stops
    /// answering; per-job failures are reported and the loop moves on.
    pub async fn run(mut self) -> Result<()> {
        if let Some(hook) = self.pre_run.clone() {
            hook.before_run(&self.client).await?;
        }

        tracing::info!(
            worker = %self.client.worker_name(),
            queues = %self.queue_names().join(","),
            "worker loop starting"
        );

        loop {
            if self.shutdown.is_shutdown() {
                tracing::info!(worker = %self.client.worker_name(), "shutdown flag set, stopping");
                self.client.quit().await?;
                return Ok(());
            }

            match self.reserve().await? {
                None => {
                    tracing::debug!(
                        worker = %self.client.worker_name(),
                        "nothing to do, waiting {}ms",
                        self.interval.as_millis()
                    );
                    tokio::time::sleep(self.interval).await;
                }
                Some(mut job) => {
                    self.report(JobInfo::started(job.jid(), job.expires_at()))
                        .await?;
                    self.execute(&mut job).await?;
                    self.report(JobInfo::ended()).await?;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Perform then complete-or-fail.
    pub async fn execute(&self, job: &mut Job) -> Result<()> {
        match job.perform(self.resolver.as_ref()).await {
            Ok(()) => self.try_complete(job).await,
            Err(err) => self.fail_job(job, err).await,
        }
    }

    /// Complete the job unless its handler already finalized it. A store
    /// refusal is logged and swallowed: by the time complete is rejected
    /// the job was failed, cancelled, or handed to another worker, and
    /// there is nothing useful left to do with it here.
    pub async fn try_complete(&self, job: &mut Job) -> Result<()> {
        if job.finalized() {
            return Ok(());
        }
        match job.complete().await {
            Ok(state) => {
                tracing::debug!(job_id = %job.jid(), state = %state, "job completed");
                Ok(())
            }
            Err(err) if err.is_rejection() => {
                tracing::warn!(job_id = %job.jid(), error = %err, "could not complete {}", job);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Report a handler failure to the store. Refusals are non-fatal here
    /// too: another worker may own or have cancelled the job by now.
    pub async fn fail_job(&self, job: &mut Job, err: HandlerError) -> Result<()> {
        tracing::error!(
            job_id = %job.jid(),
            group = %err.group,
            "job handler failed: {}",
            err.message
        );
        if job.finalized() {
            tracing::debug!(job_id = %job.jid(), "job already finalized, not failing it");
            return Ok(());
        }
        match job.fail(&err.group, &err.message).await {
            Ok(()) => Ok(()),
            Err(fail_err) if fail_err.is_rejection() => {
                tracing::warn!(job_id = %job.jid(), error = %fail_err, "could not fail {}", job);
                Ok(())
            }
            Err(fail_err) => Err(fail_err),
        }
    }

    async fn report(&mut self, info: JobInfo) -> Result<()> {
        if let Some(sink) = &mut self.sink {
            sink.send(info).await?;
        }
        Ok(())
    }

    fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name().to_string()).collect()
    }
}
