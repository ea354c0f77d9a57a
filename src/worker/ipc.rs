use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Child-to-parent report of what the worker process is doing, one JSON
/// object per stdout line. `jid` present means a job started and holds its
/// lock until `expires`; `jid` null means the job ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub jid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
}

impl JobInfo {
    pub fn started(jid: impl Into<String>, expires: f64) -> Self {
        Self {
            jid: Some(jid.into()),
            expires: Some(expires),
        }
    }

    pub fn ended() -> Self {
        Self {
            jid: None,
            expires: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.jid.is_some()
    }
}

/// Where a reservation loop reports job starts and ends.
#[async_trait]
pub trait JobInfoSink: Send + Sync {
    async fn send(&mut self, info: JobInfo) -> std::io::Result<()>;
}

/// The child side of the inter-process channel: JSON lines on stdout.
/// Everything else the child prints (logs included) belongs on stderr.
pub struct StdoutSink {
    out: tokio::io::Stdout,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: tokio::io::stdout(),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobInfoSink for StdoutSink {
    async fn send(&mut self, info: JobInfo) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(&info)?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        self.out.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_line_shape() {
        let info = JobInfo::started("jid1", 1700000060.0);
        let line = serde_json::to_string(&info).unwrap();
        assert_eq!(line, r#"{"jid":"jid1","expires":1700000060.0}"#);
    }

    #[test]
    fn ended_line_shape() {
        let line = serde_json::to_string(&JobInfo::ended()).unwrap();
        assert_eq!(line, r#"{"jid":null}"#);
    }

    #[test]
    fn parses_both_shapes() {
        let started: JobInfo = serde_json::from_str(r#"{"jid":"a","expires":12.5}"#).unwrap();
        assert!(started.is_started());
        assert_eq!(started.expires, Some(12.5));

        let ended: JobInfo = serde_json::from_str(r#"{"jid":null}"#).unwrap();
        assert!(!ended.is_started());
        assert_eq!(ended, JobInfo::ended());
    }
}
