use std::sync::Arc;

use crate::config::ConnectConfig;
use crate::error::Result;
use crate::job::{Job, JobLookup, RecurringJob};
use crate::queue::Queue;
use crate::resource::Resource;
use crate::store::{RedisStore, Store};

/// Worker identity: `host[-externalhost]-pid`.
///
/// The supervisor derives a child's name from the child's pid and the
/// child derives its own from `std::process::id()`, so both sides agree
/// on ledger keys and liveness channel names.
pub fn worker_name(external_host: Option<&str>, pid: u32) -> String {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    match external_host {
        Some(external) => format!("{}-{}-{}", hostname, external, pid),
        None => format!("{}-{}", hostname, pid),
    }
}

/// Handle to the queue store: owns the connection, the caller's worker
/// identity, and hands out queue/job/resource proxies.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Store>,
    worker_name: String,
}

impl Client {
    pub async fn connect(config: &ConnectConfig) -> Result<Self> {
        let store = RedisStore::connect(config).await?;
        let name = worker_name(config.resolve_external_host().as_deref(), std::process::id());
        Ok(Self::with_store(Arc::new(store), name))
    }

    /// Build a client over any store implementation. The seam the worker
    /// tests use to script store behavior.
    pub fn with_store(store: Arc<dyn Store>, worker_name: impl Into<String>) -> Self {
        Self {
            store,
            worker_name: worker_name.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn set_worker_name(&mut self, name: impl Into<String>) {
        self.worker_name = name.into();
    }

    pub fn queue(&self, name: impl Into<String>) -> Queue {
        Queue::new(self.clone(), name)
    }

    pub fn queues(&self, names: &[String]) -> Vec<Queue> {
        names.iter().map(|name| self.queue(name.clone())).collect()
    }

    pub fn resources(&self) -> Resource {
        Resource::new(self.clone())
    }

    /// Look a job up by id, checking concrete jobs first and recurring
    /// templates second.
    pub async fn job(&self, jid: &str) -> Result<Option<JobLookup>> {
        let reply = self.store.call("get", vec![jid.to_string()]).await?;
        if let Some(raw) = reply.as_str() {
            return Ok(Some(JobLookup::Job(Job::from_payload(self.clone(), raw)?)));
        }

        let reply = self.store.call("recur.get", vec![jid.to_string()]).await?;
        match reply.as_str() {
            Some(raw) => Ok(Some(JobLookup::Recurring(RecurringJob::from_payload(
                self.clone(),
                raw,
            )?))),
            None => Ok(None),
        }
    }

    /// Close the store connection.
    pub async fn quit(&self) -> Result<()> {
        self.store.quit().await
    }
}
