use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::Arc;

use nix::sys::signal::Signal;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};

use crate::client::{worker_name, Client};
use crate::config::{ConnectConfig, PoolConfig, SpawnConfig, WorkerOptions};
use crate::error::Result;
use crate::events::{worker_channel, LivenessEvent};
use crate::shutdown::ShutdownCoordinator;
use crate::store::ChannelMessage;
use crate::worker::ipc::JobInfo;
use crate::worker::spawn::{ChildControl, ProcessSpawner, SpawnedChild};

/// Extra delay on top of a lock's remaining lifetime, sampled uniformly
/// from [min_ms, max_ms) so simultaneous expirations do not kill every
/// worker in the same instant.
fn grace_ms(min_ms: u64, max_ms: u64) -> u64 {
    rand::thread_rng().gen_range(min_ms..max_ms)
}

enum PoolEvent {
    /// Child reported a job start or end over the inter-process channel.
    Report {
        worker: String,
        info: JobInfo,
    },
    Exited {
        worker: String,
        status: std::io::Result<ExitStatus>,
    },
    Liveness(ChannelMessage),
    WatchdogFired {
        worker: String,
        jid: String,
    },
}

struct WorkerProcess {
    control: Box<dyn ChildControl>,
}

/// Multi-process worker supervisor.
///
/// Spawns one reservation-loop process per pool slot, watches each over
/// the store's per-worker liveness channel and the inter-process report
/// stream, kills workers whose locks have expired or been revoked, and
/// respawns on crashes until shutdown.
pub struct Pool {
    client: Client,
    connect: ConnectConfig,
    queues: Vec<String>,
    options: WorkerOptions,
    config: PoolConfig,
    spawner: Arc<dyn ProcessSpawner>,
    shutdown: ShutdownCoordinator,
    stop_signal: Signal,
}

impl Pool {
    pub fn new(
        client: Client,
        connect: ConnectConfig,
        queues: Vec<String>,
        options: WorkerOptions,
        config: PoolConfig,
        spawner: Arc<dyn ProcessSpawner>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            client,
            connect,
            queues,
            options,
            config,
            spawner,
            shutdown,
            stop_signal: Signal::SIGTERM,
        }
    }

    /// Signal sent to children on graceful stop. The default lets each
    /// child finish its in-flight job.
    pub fn with_stop_signal(mut self, signal: Signal) -> Self {
        self.stop_signal = signal;
        self
    }

    /// Supervise until shutdown: returns once every child has exited.
    pub async fn run(self) -> Result<()> {
        let count = self.options.resolved_count();
        let trailing = vec![
            serde_json::to_string(&self.queues)?,
            serde_json::to_string(&self.connect)?,
            serde_json::to_string(&self.options)?,
        ];

        let (event_tx, mut event_rx) = mpsc::channel(256);

        // Liveness messages join the same event stream as child reports
        // and exits, so every handler below runs on one dispatch context.
        let (liveness_tx, mut liveness_rx) = mpsc::channel::<ChannelMessage>(256);
        {
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = liveness_rx.recv().await {
                    if event_tx.send(PoolEvent::Liveness(msg)).await.is_err() {
                        break;
                    }
                }
            });
        }

        let mut runner = PoolRunner {
            client: self.client,
            external_host: self.connect.resolve_external_host(),
            spawner: self.spawner,
            spawn_config: self.config.spawn.clone(),
            trailing,
            event_tx,
            liveness_tx,
            procs: HashMap::new(),
            ledger: HashMap::new(),
            watchdogs: HashMap::new(),
            grace_min_ms: self.config.grace_min_ms,
            grace_max_ms: self.config.grace_max_ms,
            stop_signal: self.stop_signal,
            shutting_down: false,
        };

        tracing::info!(count, queues = %self.queues.join(","), "starting worker pool");
        for _ in 0..count {
            runner.spawn_worker().await?;
        }

        let token = self.shutdown.token();
        let mut drain_tick = interval(Duration::from_millis(self.config.drain_poll_ms));

        loop {
            tokio::select! {
                _ = token.cancelled(), if !runner.shutting_down => {
                    runner.begin_shutdown();
                }
                _ = drain_tick.tick(), if runner.shutting_down => {
                    tracing::info!(remaining = runner.procs.len(), "waiting for workers to exit");
                }
                event = event_rx.recv() => match event {
                    Some(event) => runner.handle(event).await?,
                    None => break,
                },
            }

            if runner.shutting_down && runner.procs.is_empty() {
                tracing::info!("all workers exited, supervisor done");
                return Ok(());
            }
        }
        Ok(())
    }
}

struct PoolRunner {
    client: Client,
    external_host: Option<String>,
    spawner: Arc<dyn ProcessSpawner>,
    spawn_config: SpawnConfig,
    trailing: Vec<String>,
    event_tx: mpsc::Sender<PoolEvent>,
    liveness_tx: mpsc::Sender<ChannelMessage>,
    procs: HashMap<String, WorkerProcess>,
    /// Last job id each worker reported starting.
    ledger: HashMap<String, String>,
    watchdogs: HashMap<String, JoinHandle<()>>,
    grace_min_ms: u64,
    grace_max_ms: u64,
    stop_signal: Signal,
    shutting_down: bool,
}

impl PoolRunner {
    async fn spawn_worker(&mut self) -> Result<()> {
        let child = self
            .spawner
            .spawn(&self.spawn_config, &self.trailing)
            .await?;
        let name = worker_name(self.external_host.as_deref(), child.pid);
        tracing::info!(worker = %name, pid = child.pid, "spawned worker process");

        self.client
            .store()
            .subscribe(&worker_channel(&name), self.liveness_tx.clone())
            .await?;

        let SpawnedChild {
            pid: _,
            mut messages,
            exit,
            control,
        } = child;

        let event_tx = self.event_tx.clone();
        let worker = name.clone();
        tokio::spawn(async move {
            while let Some(info) = messages.recv().await {
                let report = PoolEvent::Report {
                    worker: worker.clone(),
                    info,
                };
                if event_tx.send(report).await.is_err() {
                    break;
                }
            }
        });

        let event_tx = self.event_tx.clone();
        let worker = name.clone();
        tokio::spawn(async move {
            let status = match exit.await {
                Ok(status) => status,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "exit notification dropped",
                )),
            };
            let _ = event_tx.send(PoolEvent::Exited { worker, status }).await;
        });

        self.procs.insert(name, WorkerProcess { control });
        Ok(())
    }

    async fn handle(&mut self, event: PoolEvent) -> Result<()> {
        match event {
            PoolEvent::Report { worker, info } => {
                self.handle_report(worker, info);
                Ok(())
            }
            PoolEvent::Liveness(msg) => {
                self.handle_liveness(msg);
                Ok(())
            }
            PoolEvent::WatchdogFired { worker, jid } => {
                self.handle_watchdog_fired(&worker, &jid);
                Ok(())
            }
            PoolEvent::Exited { worker, status } => self.handle_exit(worker, status).await,
        }
    }

    /// Child report: the fast local path for ledger and watchdog upkeep,
    /// independent of whatever the liveness channel delivers.
    fn handle_report(&mut self, worker: String, info: JobInfo) {
        match info.jid {
            Some(jid) => {
                tracing::debug!(worker = %worker, job_id = %jid, "job started");
                self.ledger.insert(worker.clone(), jid.clone());
                match info.expires {
                    Some(expires) => self.arm_watchdog(worker, jid, expires),
                    None => {
                        tracing::warn!(
                            worker = %worker,
                            job_id = %jid,
                            "job report carried no expiry, watchdog not armed"
                        );
                    }
                }
            }
            None => {
                tracing::debug!(worker = %worker, "job ended");
                self.ledger.remove(&worker);
                self.disarm_watchdog(&worker);
            }
        }
    }

    fn handle_liveness(&mut self, msg: ChannelMessage) {
        let event = match LivenessEvent::parse(&msg.payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(channel = %msg.channel, error = %err, "undecodable liveness message");
                return;
            }
        };

        match event {
            LivenessEvent::Heartbeat {
                worker,
                jid,
                expires,
            } => {
                tracing::debug!(worker = %worker, job_id = %jid, "heartbeat observed");
                self.arm_watchdog(worker, jid, expires);
            }
            LivenessEvent::LockLost { worker, jid } => {
                tracing::warn!(worker = %worker, job_id = %jid, "lock lost, killing worker");
                self.force_kill(&worker);
            }
            LivenessEvent::Canceled { worker, jid } => {
                tracing::warn!(worker = %worker, job_id = %jid, "job canceled, killing worker");
                self.force_kill(&worker);
            }
            LivenessEvent::Unknown => {
                tracing::trace!(channel = %msg.channel, "ignoring unrecognized liveness event");
            }
        }
    }

    /// A watchdog fired: only act if the worker is still on the job the
    /// timer was armed for; otherwise the timer is stale.
    fn handle_watchdog_fired(&mut self, worker: &str, jid: &str) {
        if self.ledger.get(worker).map(String::as_str) == Some(jid) {
            tracing::warn!(
                worker = %worker,
                job_id = %jid,
                "lock expired with the job still running, killing worker"
            );
            self.force_kill(worker);
        } else {
            tracing::debug!(worker = %worker, job_id = %jid, "stale watchdog, ignoring");
        }
    }

    async fn handle_exit(
        &mut self,
        worker: String,
        status: std::io::Result<ExitStatus>,
    ) -> Result<()> {
        if self.procs.remove(&worker).is_none() {
            return Ok(());
        }

        match &status {
            Ok(status) if status.success() => {
                tracing::info!(worker = %worker, "worker exited cleanly");
            }
            Ok(status) => {
                tracing::warn!(worker = %worker, status = %status, "worker exited abnormally");
            }
            Err(err) => {
                tracing::warn!(worker = %worker, error = %err, "worker exit status unavailable");
            }
        }

        self.ledger.remove(&worker);
        self.disarm_watchdog(&worker);
        if let Err(err) = self
            .client
            .store()
            .unsubscribe(&worker_channel(&worker))
            .await
        {
            tracing::debug!(worker = %worker, error = %err, "liveness unsubscribe failed");
        }

        if !self.shutting_down {
            tracing::info!(worker = %worker, "replacing exited worker");
            self.spawn_worker().await?;
        }
        Ok(())
    }

    /// (Re)arm the watchdog for a worker. Any previous timer for the same
    /// worker is cancelled first so timers never accumulate.
    fn arm_watchdog(&mut self, worker: String, jid: String, expires: f64) {
        self.disarm_watchdog(&worker);

        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let ttl_ms = ((expires - now) * 1000.0).max(0.0) as u64;
        let delay = Duration::from_millis(ttl_ms + grace_ms(self.grace_min_ms, self.grace_max_ms));

        let event_tx = self.event_tx.clone();
        let timer_worker = worker.clone();
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            let fired = PoolEvent::WatchdogFired {
                worker: timer_worker,
                jid,
            };
            let _ = event_tx.send(fired).await;
        });
        self.watchdogs.insert(worker, timer);
    }

    fn disarm_watchdog(&mut self, worker: &str) {
        if let Some(timer) = self.watchdogs.remove(worker) {
            timer.abort();
        }
    }

    fn force_kill(&mut self, worker: &str) {
        match self.procs.get(worker) {
            Some(process) => {
                if let Err(err) = process.control.signal(Signal::SIGKILL) {
                    tracing::warn!(worker = %worker, error = %err, "force kill failed");
                }
            }
            None => {
                tracing::debug!(worker = %worker, "no live process to kill");
            }
        }
    }

    fn begin_shutdown(&mut self) {
        self.shutting_down = true;
        tracing::info!(
            signal = %self.stop_signal,
            count = self.procs.len(),
            "stopping workers"
        );
        for (worker, process) in &self.procs {
            if let Err(err) = process.control.signal(self.stop_signal) {
                tracing::warn!(worker = %worker, error = %err, "stop signal failed");
            }
        }
    }
}
