use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::client::Client;
use crate::config::{ConnectConfig, WorkerOptions};
use crate::error::{QlessError, Result};
use crate::handler::HandlerResolver;
use crate::shutdown::install_shutdown_handler;
use crate::worker::ipc::StdoutSink;
use crate::worker::serial::{PreRunHook, SerialWorker};

/// Logging for a pool-spawned process. Stdout carries the job reports
/// the parent reads, so all diagnostics go to stderr, which the parent
/// leaves attached to its own.
pub fn init_worker_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Configuration a pool-spawned process recovers from its command line.
///
/// The supervisor appends three JSON blobs to whatever argv the spawn
/// configuration carries: the queue list, the connection settings, and
/// the worker options, in that order.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub queues: Vec<String>,
    pub connect: ConnectConfig,
    pub options: WorkerOptions,
}

impl ChildEntry {
    /// Decode the three trailing arguments a supervisor passes.
    pub fn from_trailing_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(QlessError::Process(format!(
                "expected 3 trailing arguments from the supervisor, got {}",
                args.len()
            )));
        }
        let tail = &args[args.len() - 3..];
        Ok(Self {
            queues: serde_json::from_str(&tail[0])?,
            connect: serde_json::from_str(&tail[1])?,
            options: serde_json::from_str(&tail[2])?,
        })
    }

    pub fn from_env() -> Result<Self> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::from_trailing_args(&args)
    }

    /// Run a serial worker in this process until the supervisor signals
    /// a stop. Job reports go to stdout for the parent to consume. An
    /// Err return should exit the process non-zero so the supervisor
    /// sees a crash and respawns.
    pub async fn run(
        self,
        resolver: Arc<dyn HandlerResolver>,
        pre_run: Option<Arc<dyn PreRunHook>>,
    ) -> Result<()> {
        let shutdown = install_shutdown_handler()?;
        let client = Client::connect(&self.connect).await?;

        let mut worker = SerialWorker::new(client, &self.queues, resolver, &self.options, shutdown)
            .with_sink(Box::new(StdoutSink::new()));
        if let Some(hook) = pre_run {
            worker = worker.with_pre_run(hook);
        }
        worker.run().await
    }
}
