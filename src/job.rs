use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::client::Client;
use crate::error::{QlessError, Result};
use crate::handler::{HandlerError, HandlerResolver};
use crate::store::Reply;

/// Decode a field the store double-encodes: the job payload travels as a
/// JSON string inside the job's own JSON.
fn nested_json<'de, D>(de: D) -> std::result::Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    serde_json::from_str(&raw).map_err(serde::de::Error::custom)
}

/// Decode a list field that the store's Lua layer renders as `{}` when
/// empty.
fn lua_list<'de, D, T>(de: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(de)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(serde::de::Error::custom))
            .collect(),
        Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected a list, got {}",
            other
        ))),
    }
}

/// The store sends `false` for "never failed" and "not spawned from a
/// recurring job"; fold that into None.
fn false_as_none<'de, D, T>(de: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(de)? {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Why a job last failed, as recorded by the store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JobFailure {
    pub group: String,
    pub message: String,
    pub when: Option<f64>,
    pub worker: Option<String>,
}

/// One reserved job as the store describes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub jid: String,
    pub klass: String,
    #[serde(deserialize_with = "nested_json")]
    pub data: Value,
    pub queue: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub retries: i64,
    #[serde(default)]
    pub remaining: i64,
    /// Lock expiry, epoch seconds.
    #[serde(default)]
    pub expires: f64,
    #[serde(default)]
    pub worker: String,
    #[serde(default, deserialize_with = "lua_list")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub tracked: bool,
    #[serde(default, deserialize_with = "false_as_none")]
    pub failure: Option<JobFailure>,
    #[serde(default, deserialize_with = "lua_list")]
    pub dependencies: Vec<String>,
    #[serde(default, deserialize_with = "lua_list")]
    pub dependents: Vec<String>,
    #[serde(default, deserialize_with = "false_as_none")]
    pub spawned_from_jid: Option<String>,
    #[serde(default, deserialize_with = "lua_list")]
    pub history: Vec<Value>,
}

/// A recurring-job template as the store describes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurData {
    pub jid: String,
    pub klass: String,
    #[serde(deserialize_with = "nested_json")]
    pub data: Value,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, deserialize_with = "lua_list")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub retries: i64,
    pub interval: i64,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub backlog: i64,
}

/// Either kind of job a lookup can return.
pub enum JobLookup {
    Job(Job),
    Recurring(RecurringJob),
}

/// Local proxy for one reserved job.
///
/// Every mutator issues exactly one store call. The four finalizers
/// (complete, fail, cancel, retry) flip the one-way `finalized` flag;
/// everything else refreshes local mirrors only. A second finalize on the
/// same handle is a caller bug: it trips a debug assertion, and in release
/// builds is refused locally without touching the store.
pub struct Job {
    client: Client,
    finalized: bool,
    data: JobData,
}

impl Job {
    pub(crate) fn from_value(client: Client, value: Value) -> Result<Self> {
        let data: JobData = serde_json::from_value(value)?;
        Ok(Self {
            client,
            finalized: false,
            data,
        })
    }

    pub(crate) fn from_payload(client: Client, raw: &str) -> Result<Self> {
        Self::from_value(client, serde_json::from_str(raw)?)
    }

    pub fn data(&self) -> &JobData {
        &self.data
    }

    pub fn jid(&self) -> &str {
        &self.data.jid
    }

    pub fn klass(&self) -> &str {
        &self.data.klass
    }

    pub fn queue(&self) -> &str {
        &self.data.queue
    }

    /// The user payload. Handlers may edit it; complete/fail/move send the
    /// edited payload back.
    pub fn payload(&self) -> &Value {
        &self.data.data
    }

    pub fn payload_mut(&mut self) -> &mut Value {
        &mut self.data.data
    }

    pub fn expires_at(&self) -> f64 {
        self.data.expires
    }

    /// Seconds until the lock expires; negative once it has.
    pub fn ttl(&self) -> f64 {
        self.data.expires - chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    /// Resolve this job's class and run the handler. Resolution misses and
    /// capability misses surface as distinct failure groups.
    pub async fn perform(
        &mut self,
        resolver: &dyn HandlerResolver,
    ) -> std::result::Result<(), HandlerError> {
        let klass = self.data.klass.clone();
        let handler = resolver
            .resolve(&klass)
            .ok_or_else(|| QlessError::HandlerNotFound(klass.clone()))?;
        let performable = handler
            .as_performable()
            .ok_or(QlessError::HandlerLacksPerform(klass))?;
        performable.perform(self).await
    }

    fn finalize_guard(&self, command: &str) -> Result<()> {
        debug_assert!(
            !self.finalized,
            "second finalize ({}) on job {}",
            command,
            self.data.jid
        );
        if self.finalized {
            return Err(QlessError::Rejected {
                command: command.to_string(),
                message: format!("job {} already finalized by this handle", self.data.jid),
            });
        }
        Ok(())
    }

    async fn call(&self, command: &str, args: Vec<String>) -> Result<Reply> {
        self.client.store().call(command, args).await
    }

    /// Report the job done. Returns the job's resulting state.
    pub async fn complete(&mut self) -> Result<String> {
        self.finalize_guard("complete")?;
        let payload = serde_json::to_string(&self.data.data)?;
        let reply = self
            .call(
                "complete",
                vec![
                    self.data.jid.clone(),
                    self.client.worker_name().to_string(),
                    self.data.queue.clone(),
                    payload,
                ],
            )
            .await?;
        self.finalized = true;
        reply.into_text().ok_or_else(|| QlessError::MalformedReply {
            command: "complete".to_string(),
            detail: "expected the resulting state".to_string(),
        })
    }

    pub async fn fail(&mut self, group: &str, message: &str) -> Result<()> {
        self.finalize_guard("fail")?;
        let payload = serde_json::to_string(&self.data.data)?;
        self.call(
            "fail",
            vec![
                self.data.jid.clone(),
                self.client.worker_name().to_string(),
                group.to_string(),
                message.to_string(),
                payload,
            ],
        )
        .await?;
        self.finalized = true;
        Ok(())
    }

    pub async fn cancel(&mut self) -> Result<()> {
        self.finalize_guard("cancel")?;
        self.call("cancel", vec![self.data.jid.clone()]).await?;
        self.finalized = true;
        Ok(())
    }

    /// Put the job back for another attempt after `delay` seconds. Returns
    /// the retries remaining.
    pub async fn retry(
        &mut self,
        delay: u64,
        group: Option<&str>,
        message: Option<&str>,
    ) -> Result<i64> {
        self.finalize_guard("retry")?;
        let mut args = vec![
            self.data.jid.clone(),
            self.data.queue.clone(),
            self.client.worker_name().to_string(),
            delay.to_string(),
        ];
        if let Some(group) = group {
            args.push(group.to_string());
            if let Some(message) = message {
                args.push(message.to_string());
            }
        }
        let reply = self.call("retry", args).await?;
        self.finalized = true;
        match reply {
            Reply::Int(remaining) => Ok(remaining),
            other => Err(QlessError::MalformedReply {
                command: "retry".to_string(),
                detail: format!("expected retries remaining, got {:?}", other),
            }),
        }
    }

    /// Renew the lock. Returns and locally records the new expiry.
    pub async fn heartbeat(&mut self) -> Result<f64> {
        let reply = self
            .call(
                "heartbeat",
                vec![
                    self.data.jid.clone(),
                    self.client.worker_name().to_string(),
                ],
            )
            .await?;
        let expires = reply.as_f64().ok_or_else(|| QlessError::MalformedReply {
            command: "heartbeat".to_string(),
            detail: "expected the new expiry".to_string(),
        })?;
        self.data.expires = expires;
        Ok(expires)
    }

    /// Give the lock up immediately so another worker can take the job.
    pub async fn timeout(&mut self) -> Result<()> {
        self.call("timeout", vec![self.data.jid.clone()]).await?;
        Ok(())
    }

    pub async fn track(&mut self) -> Result<()> {
        self.call("track", vec!["track".to_string(), self.data.jid.clone()])
            .await?;
        self.data.tracked = true;
        Ok(())
    }

    pub async fn untrack(&mut self) -> Result<()> {
        self.call("track", vec!["untrack".to_string(), self.data.jid.clone()])
            .await?;
        self.data.tracked = false;
        Ok(())
    }

    pub async fn tag(&mut self, tag: &str) -> Result<()> {
        self.call(
            "tag",
            vec!["add".to_string(), self.data.jid.clone(), tag.to_string()],
        )
        .await?;
        if !self.data.tags.iter().any(|t| t == tag) {
            self.data.tags.push(tag.to_string());
        }
        Ok(())
    }

    pub async fn untag(&mut self, tag: &str) -> Result<()> {
        self.call(
            "tag",
            vec![
                "remove".to_string(),
                self.data.jid.clone(),
                tag.to_string(),
            ],
        )
        .await?;
        self.data.tags.retain(|t| t != tag);
        Ok(())
    }

    pub async fn set_priority(&mut self, priority: i64) -> Result<()> {
        self.call(
            "priority",
            vec![self.data.jid.clone(), priority.to_string()],
        )
        .await?;
        self.data.priority = priority;
        Ok(())
    }

    /// Re-queue the job elsewhere. The store takes the job away from this
    /// worker; a later complete on this handle will be rejected remotely.
    pub async fn move_to(&mut self, queue: &str, delay: u64) -> Result<String> {
        let payload = serde_json::to_string(&self.data.data)?;
        let reply = self
            .call(
                "put",
                vec![
                    self.client.worker_name().to_string(),
                    queue.to_string(),
                    self.data.jid.clone(),
                    self.data.klass.clone(),
                    payload,
                    delay.to_string(),
                ],
            )
            .await?;
        reply.into_text().ok_or_else(|| QlessError::MalformedReply {
            command: "put".to_string(),
            detail: "expected the jid".to_string(),
        })
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<qless.Job {} ({} / {} / {})>",
            self.data.klass, self.data.jid, self.data.queue, self.data.state
        )
    }
}

/// Proxy for a recurring-job template. Mutations are repeatable; there is
/// no finalized state to guard.
pub struct RecurringJob {
    client: Client,
    data: RecurData,
}

impl RecurringJob {
    pub(crate) fn from_payload(client: Client, raw: &str) -> Result<Self> {
        let data: RecurData = serde_json::from_str(raw)?;
        Ok(Self { client, data })
    }

    pub fn data(&self) -> &RecurData {
        &self.data
    }

    pub fn jid(&self) -> &str {
        &self.data.jid
    }

    async fn update_field(&self, key: &str, value: String) -> Result<()> {
        self.client
            .store()
            .call(
                "recur.update",
                vec![self.data.jid.clone(), key.to_string(), value],
            )
            .await?;
        Ok(())
    }

    pub async fn set_priority(&mut self, priority: i64) -> Result<()> {
        self.update_field("priority", priority.to_string()).await?;
        self.data.priority = priority;
        Ok(())
    }

    pub async fn set_retries(&mut self, retries: i64) -> Result<()> {
        self.update_field("retries", retries.to_string()).await?;
        self.data.retries = retries;
        Ok(())
    }

    pub async fn set_interval(&mut self, interval: i64) -> Result<()> {
        self.update_field("interval", interval.to_string()).await?;
        self.data.interval = interval;
        Ok(())
    }

    pub async fn set_data(&mut self, data: Value) -> Result<()> {
        self.update_field("data", serde_json::to_string(&data)?)
            .await?;
        self.data.data = data;
        Ok(())
    }

    pub async fn set_klass(&mut self, klass: &str) -> Result<()> {
        self.update_field("klass", klass.to_string()).await?;
        self.data.klass = klass.to_string();
        Ok(())
    }

    pub async fn move_to(&mut self, queue: &str) -> Result<()> {
        self.update_field("queue", queue.to_string()).await
    }

    /// Push every locally held field back to the template in one call.
    pub async fn update(&self) -> Result<()> {
        self.client
            .store()
            .call(
                "recur.update",
                vec![
                    self.data.jid.clone(),
                    "klass".to_string(),
                    self.data.klass.clone(),
                    "queue".to_string(),
                    self.data.queue.clone(),
                    "data".to_string(),
                    serde_json::to_string(&self.data.data)?,
                    "priority".to_string(),
                    self.data.priority.to_string(),
                    "interval".to_string(),
                    self.data.interval.to_string(),
                    "retries".to_string(),
                    self.data.retries.to_string(),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn cancel(&self) -> Result<()> {
        self.client
            .store()
            .call("unrecur", vec![self.data.jid.clone()])
            .await?;
        Ok(())
    }

    pub async fn tag(&mut self, tag: &str) -> Result<()> {
        self.client
            .store()
            .call(
                "recur.tag",
                vec![self.data.jid.clone(), tag.to_string()],
            )
            .await?;
        if !self.data.tags.iter().any(|t| t == tag) {
            self.data.tags.push(tag.to_string());
        }
        Ok(())
    }

    pub async fn untag(&mut self, tag: &str) -> Result<()> {
        self.client
            .store()
            .call(
                "recur.untag",
                vec![self.data.jid.clone(), tag.to_string()],
            )
            .await?;
        self.data.tags.retain(|t| t != tag);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> String {
        serde_json::json!({
            "jid": "jid1",
            "klass": "EchoJob",
            "data": "{\"x\":1}",
            "queue": "default",
            "priority": 0,
            "retries": 5,
            "remaining": 5,
            "expires": 1700000060.0,
            "worker": "host-1",
            "tags": {},
            "state": "running",
            "tracked": false,
            "failure": {},
            "dependencies": {},
            "dependents": {},
            "spawned_from_jid": false,
            "history": [{"q": "default", "put": 1700000000}]
        })
        .to_string()
    }

    #[test]
    fn decodes_double_encoded_payload() {
        let data: JobData = serde_json::from_str(&sample_payload()).unwrap();
        assert_eq!(data.jid, "jid1");
        assert_eq!(data.data["x"], 1);
        assert_eq!(data.expires, 1700000060.0);
    }

    #[test]
    fn normalizes_lua_empty_collections() {
        let data: JobData = serde_json::from_str(&sample_payload()).unwrap();
        assert!(data.tags.is_empty());
        assert!(data.dependencies.is_empty());
        assert!(data.dependents.is_empty());
        assert!(data.failure.is_none());
        assert!(data.spawned_from_jid.is_none());
        assert_eq!(data.history.len(), 1);
    }

    #[test]
    fn keeps_real_collections_and_failures() {
        let raw = serde_json::json!({
            "jid": "jid2",
            "klass": "EchoJob",
            "data": "{}",
            "queue": "default",
            "expires": 0.0,
            "tags": ["nightly", "audit"],
            "failure": {"group": "BoomError", "message": "kaboom", "when": 1700000010.0},
            "spawned_from_jid": "recur-1"
        })
        .to_string();

        let data: JobData = serde_json::from_str(&raw).unwrap();
        assert_eq!(data.tags, vec!["nightly", "audit"]);
        let failure = data.failure.unwrap();
        assert_eq!(failure.group, "BoomError");
        assert_eq!(failure.message, "kaboom");
        assert_eq!(data.spawned_from_jid.as_deref(), Some("recur-1"));
    }

    #[test]
    fn decodes_recurring_template() {
        let raw = serde_json::json!({
            "jid": "recur-1",
            "klass": "SweepJob",
            "data": "{\"scope\":\"all\"}",
            "queue": "maintenance",
            "priority": 0,
            "tags": {},
            "retries": 3,
            "interval": 60,
            "count": 12,
            "backlog": 0
        })
        .to_string();

        let data: RecurData = serde_json::from_str(&raw).unwrap();
        assert_eq!(data.interval, 60);
        assert_eq!(data.count, 12);
        assert_eq!(data.data["scope"], "all");
    }
}
