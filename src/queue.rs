use serde_json::Value;
use uuid::Uuid;

use crate::client::Client;
use crate::error::{QlessError, Result};
use crate::job::Job;

/// Queue the reservation loop drains when no queue names are given.
pub const DEFAULT_QUEUE: &str = "default";

/// Options for placing a job. Unset fields are left to the store's
/// defaults and not sent at all.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Explicit job id; generated when absent.
    pub jid: Option<String>,
    /// Seconds before the job becomes available.
    pub delay: u64,
    pub priority: Option<i64>,
    pub tags: Vec<String>,
    pub retries: Option<i64>,
    /// Jids this job must wait on.
    pub depends: Vec<String>,
    /// Resource ids the job must hold while running.
    pub resources: Vec<String>,
}

/// Options for registering a recurring job.
#[derive(Debug, Clone, Default)]
pub struct RecurOptions {
    pub jid: Option<String>,
    /// Seconds before the first spawn.
    pub offset: u64,
    pub priority: Option<i64>,
    pub tags: Vec<String>,
    pub retries: Option<i64>,
    /// How many spawned jobs may pile up unworked before the store stops
    /// spawning more.
    pub backlog: Option<i64>,
}

fn generated_jid() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Proxy for one named queue.
#[derive(Clone)]
pub struct Queue {
    client: Client,
    name: String,
}

impl Queue {
    pub(crate) fn new(client: Client, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Place a job on this queue. Returns the jid.
    pub async fn put(&self, klass: &str, data: &Value, options: PutOptions) -> Result<String> {
        let jid = options.jid.unwrap_or_else(generated_jid);
        let mut args = vec![
            self.client.worker_name().to_string(),
            self.name.clone(),
            jid,
            klass.to_string(),
            serde_json::to_string(data)?,
            options.delay.to_string(),
        ];
        if let Some(priority) = options.priority {
            args.push("priority".to_string());
            args.push(priority.to_string());
        }
        if !options.tags.is_empty() {
            args.push("tags".to_string());
            args.push(serde_json::to_string(&options.tags)?);
        }
        if let Some(retries) = options.retries {
            args.push("retries".to_string());
            args.push(retries.to_string());
        }
        if !options.depends.is_empty() {
            args.push("depends".to_string());
            args.push(serde_json::to_string(&options.depends)?);
        }
        if !options.resources.is_empty() {
            args.push("resources".to_string());
            args.push(serde_json::to_string(&options.resources)?);
        }

        let reply = self.client.store().call("put", args).await?;
        reply.into_text().ok_or_else(|| QlessError::MalformedReply {
            command: "put".to_string(),
            detail: "expected the jid".to_string(),
        })
    }

    /// Register a recurring job spawning every `interval` seconds. Returns
    /// the template's jid.
    pub async fn recur(
        &self,
        klass: &str,
        data: &Value,
        interval: u64,
        options: RecurOptions,
    ) -> Result<String> {
        let jid = options.jid.unwrap_or_else(generated_jid);
        let mut args = vec![
            self.name.clone(),
            jid,
            klass.to_string(),
            serde_json::to_string(data)?,
            "interval".to_string(),
            interval.to_string(),
            options.offset.to_string(),
        ];
        if let Some(priority) = options.priority {
            args.push("priority".to_string());
            args.push(priority.to_string());
        }
        if !options.tags.is_empty() {
            args.push("tags".to_string());
            args.push(serde_json::to_string(&options.tags)?);
        }
        if let Some(retries) = options.retries {
            args.push("retries".to_string());
            args.push(retries.to_string());
        }
        if let Some(backlog) = options.backlog {
            args.push("backlog".to_string());
            args.push(backlog.to_string());
        }

        let reply = self.client.store().call("recur", args).await?;
        reply.into_text().ok_or_else(|| QlessError::MalformedReply {
            command: "recur".to_string(),
            detail: "expected the jid".to_string(),
        })
    }

    /// Reserve one job, or None when the queue is empty.
    pub async fn pop(&self) -> Result<Option<Job>> {
        Ok(self.multipop(1).await?.into_iter().next())
    }

    /// Reserve up to `count` jobs at once.
    pub async fn multipop(&self, count: usize) -> Result<Vec<Job>> {
        let reply = self
            .client
            .store()
            .call(
                "pop",
                vec![
                    self.name.clone(),
                    self.client.worker_name().to_string(),
                    count.to_string(),
                ],
            )
            .await?;
        let raw = reply.as_str().ok_or_else(|| QlessError::MalformedReply {
            command: "pop".to_string(),
            detail: "expected a job list".to_string(),
        })?;
        self.parse_jobs(raw)
    }

    fn parse_jobs(&self, raw: &str) -> Result<Vec<Job>> {
        match serde_json::from_str::<Value>(raw)? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| Job::from_value(self.client.clone(), item))
                .collect(),
            // Lua encodes the empty job list as an empty object
            Value::Object(map) if map.is_empty() => Ok(Vec::new()),
            other => Err(QlessError::MalformedReply {
                command: "pop".to_string(),
                detail: format!("expected a job list, got {}", other),
            }),
        }
    }

    pub async fn pause(&self) -> Result<()> {
        self.client
            .store()
            .call("pause", vec![self.name.clone()])
            .await?;
        Ok(())
    }

    pub async fn unpause(&self) -> Result<()> {
        self.client
            .store()
            .call("unpause", vec![self.name.clone()])
            .await?;
        Ok(())
    }
}
