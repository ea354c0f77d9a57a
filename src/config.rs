use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Connection parameters for the queue store.
///
/// Serializable because the supervisor hands a copy to every child process
/// on its command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    /// Redis database index.
    pub db: i64,
    pub password: Option<String>,
    /// Path to the store's atomic script, loaded once per connection.
    pub script_path: PathBuf,
    /// Extra host identifier mixed into worker names, for hosts whose
    /// hostname is not unique (e.g. containers sharing an image name).
    /// Falls back to the HOST environment variable when unset.
    pub external_host: Option<String>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            script_path: PathBuf::from("qless.lua"),
            external_host: None,
        }
    }
}

impl ConnectConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pass) => format!("redis://:{}@{}:{}/{}", pass, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// The configured external host, or the HOST environment variable.
    pub fn resolve_external_host(&self) -> Option<String> {
        self.external_host
            .clone()
            .or_else(|| std::env::var("HOST").ok())
    }
}

/// Run options shared by serial workers and pool children.
///
/// Also rides the child command line, so unset fields must deserialize
/// from an empty JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Idle backoff between reservations when every queue is empty.
    pub interval_ms: u64,
    /// Pool size. None means one process per available CPU.
    pub count: Option<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            count: None,
        }
    }
}

impl WorkerOptions {
    pub fn resolved_count(&self) -> usize {
        self.count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// How the supervisor launches a worker process.
///
/// The marker args let an embedding binary route the invocation to its
/// worker entry point; the supervisor appends the serialized queue list,
/// connection config, and run options after them.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("qless")),
            args: Vec::new(),
        }
    }
}

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub spawn: SpawnConfig,
    /// Watchdog grace window, sampled uniformly from [min, max).
    pub grace_min_ms: u64,
    pub grace_max_ms: u64,
    /// How often the draining supervisor reports workers still live.
    pub drain_poll_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            spawn: SpawnConfig::default(),
            grace_min_ms: 1000,
            grace_max_ms: 3000,
            drain_poll_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_config_default() {
        let cfg = ConnectConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 6379);
        assert_eq!(cfg.db, 0);
        assert!(cfg.password.is_none());
        assert_eq!(cfg.script_path, PathBuf::from("qless.lua"));
    }

    #[test]
    fn connect_config_url() {
        let cfg = ConnectConfig::new("queue.internal", 6380);
        assert_eq!(cfg.url(), "redis://queue.internal:6380/0");

        let mut cfg = ConnectConfig::default();
        cfg.password = Some("hunter2".to_string());
        cfg.db = 3;
        assert_eq!(cfg.url(), "redis://:hunter2@127.0.0.1:6379/3");
    }

    #[test]
    fn connect_config_from_empty_json() {
        let cfg: ConnectConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 6379);
    }

    #[test]
    fn worker_options_default() {
        let opts = WorkerOptions::default();
        assert_eq!(opts.interval_ms, 5000);
        assert!(opts.count.is_none());
        assert!(opts.resolved_count() >= 1);
    }

    #[test]
    fn worker_options_from_partial_json() {
        let opts: WorkerOptions = serde_json::from_str(r#"{"interval_ms": 250}"#).unwrap();
        assert_eq!(opts.interval_ms, 250);
        assert!(opts.count.is_none());

        let opts: WorkerOptions = serde_json::from_str(r#"{"count": 4}"#).unwrap();
        assert_eq!(opts.interval_ms, 5000);
        assert_eq!(opts.resolved_count(), 4);
    }

    #[test]
    fn pool_config_default_grace_window() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.grace_min_ms, 1000);
        assert_eq!(cfg.grace_max_ms, 3000);
        assert!(cfg.grace_min_ms < cfg.grace_max_ms);
    }
}
