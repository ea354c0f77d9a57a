use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::FromRedisValue;
use tokio::sync::{mpsc, RwLock};

use crate::config::ConnectConfig;
use crate::error::{QlessError, Result};

/// One value out of the store's script layer.
///
/// The script replies with nil, integers, or strings (most of which are
/// JSON documents the proxies decode); multi-value replies only show up
/// for introspection commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Text(String),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Reply::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view: integers directly, or numeric text. The script layer
    /// returns lock expiries both ways depending on version.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reply::Int(i) => Some(*i as f64),
            Reply::Text(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl FromRedisValue for Reply {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        Ok(match v {
            redis::Value::Nil => Reply::Nil,
            redis::Value::Int(i) => Reply::Int(*i),
            redis::Value::BulkString(bytes) => {
                Reply::Text(String::from_utf8_lossy(bytes).into_owned())
            }
            redis::Value::SimpleString(s) => Reply::Text(s.clone()),
            redis::Value::Okay => Reply::Text("OK".to_string()),
            redis::Value::Array(items) => Reply::Array(
                items
                    .iter()
                    .map(Reply::from_redis_value)
                    .collect::<redis::RedisResult<Vec<_>>>()?,
            ),
            // RESP3-only kinds; this client connects over RESP2
            other => {
                return Err(redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "unexpected reply type",
                    format!("{:?}", other),
                )))
            }
        })
    }
}

/// A message delivered from one of the store's pub/sub channels.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// The store's command surface.
///
/// Every queue operation is one atomic script invocation; the implicit
/// current-time argument is supplied below this trait, so `args` is
/// exactly what the command's documented signature lists. Channel
/// subscriptions deliver raw payloads to the given sender, routed by
/// channel identity.
#[async_trait]
pub trait Store: Send + Sync {
    async fn call(&self, command: &str, args: Vec<String>) -> Result<Reply>;

    async fn subscribe(&self, channel: &str, tx: mpsc::Sender<ChannelMessage>) -> Result<()>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Release the connection. Calls after this fail with a transport error.
    async fn quit(&self) -> Result<()>;
}

/// Sort a redis failure into the crate taxonomy: errors raised by the
/// script itself are rejections, everything else is transport.
fn classify(command: &str, err: redis::RedisError) -> QlessError {
    if err.kind() == redis::ErrorKind::ResponseError {
        let message = err
            .detail()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        QlessError::Rejected {
            command: command.to_string(),
            message,
        }
    } else {
        QlessError::Transport(err)
    }
}

fn dispatcher_gone() -> QlessError {
    QlessError::Transport(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "pub/sub dispatcher is not running",
    )))
}

enum PubSubCmd {
    Subscribe {
        channel: String,
        tx: mpsc::Sender<ChannelMessage>,
    },
    Unsubscribe {
        channel: String,
    },
    Quit,
}

/// Redis-backed store speaking the atomic script protocol.
///
/// The script is loaded once at connect time and invoked by sha; a
/// NOSCRIPT reply (server restarted, script cache flushed) triggers one
/// reload and retry. All pub/sub traffic shares a single connection whose
/// routing task forwards messages per channel without blocking on any
/// single consumer.
pub struct RedisStore {
    conn: ConnectionManager,
    script_source: String,
    sha: RwLock<String>,
    pubsub_cmd: mpsc::Sender<PubSubCmd>,
}

impl RedisStore {
    pub async fn connect(config: &ConnectConfig) -> Result<Self> {
        let script_source = tokio::fs::read_to_string(&config.script_path).await?;

        let client = redis::Client::open(config.url())
            .map_err(|err| classify("connect", err))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(QlessError::Transport)?;

        let sha = Self::load_script(&mut conn, &script_source).await?;

        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(QlessError::Transport)?;
        let (sink, stream) = pubsub.split();
        let (pubsub_cmd, cmd_rx) = mpsc::channel(64);
        tokio::spawn(run_pubsub_dispatcher(sink, stream, cmd_rx));

        Ok(Self {
            conn,
            script_source,
            sha: RwLock::new(sha),
            pubsub_cmd,
        })
    }

    async fn load_script(conn: &mut ConnectionManager, source: &str) -> Result<String> {
        redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(conn)
            .await
            .map_err(QlessError::Transport)
    }

    fn build_command(sha: &str, command: &str, now: f64, args: &[String]) -> redis::Cmd {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(0).arg(command).arg(now);
        for arg in args {
            cmd.arg(arg);
        }
        cmd
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn call(&self, command: &str, args: Vec<String>) -> Result<Reply> {
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut conn = self.conn.clone();
        let sha = self.sha.read().await.clone();

        match Self::build_command(&sha, command, now, &args)
            .query_async::<Reply>(&mut conn)
            .await
        {
            Ok(reply) => Ok(reply),
            Err(err) if err.code() == Some("NOSCRIPT") => {
                tracing::warn!("script missing from store, reloading");
                let sha = Self::load_script(&mut conn, &self.script_source).await?;
                *self.sha.write().await = sha.clone();
                Self::build_command(&sha, command, now, &args)
                    .query_async::<Reply>(&mut conn)
                    .await
                    .map_err(|err| classify(command, err))
            }
            Err(err) => Err(classify(command, err)),
        }
    }

    async fn subscribe(&self, channel: &str, tx: mpsc::Sender<ChannelMessage>) -> Result<()> {
        self.pubsub_cmd
            .send(PubSubCmd::Subscribe {
                channel: channel.to_string(),
                tx,
            })
            .await
            .map_err(|_| dispatcher_gone())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.pubsub_cmd
            .send(PubSubCmd::Unsubscribe {
                channel: channel.to_string(),
            })
            .await
            .map_err(|_| dispatcher_gone())
    }

    async fn quit(&self) -> Result<()> {
        // Dropping the dispatcher closes the pub/sub connection; the
        // managed command connection closes with the store itself.
        let _ = self.pubsub_cmd.send(PubSubCmd::Quit).await;
        Ok(())
    }
}

async fn run_pubsub_dispatcher(
    mut sink: PubSubSink,
    mut stream: PubSubStream,
    mut cmd_rx: mpsc::Receiver<PubSubCmd>,
) {
    let mut routes: HashMap<String, mpsc::Sender<ChannelMessage>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(PubSubCmd::Subscribe { channel, tx }) => {
                    if let Err(err) = sink.subscribe(&channel).await {
                        tracing::warn!(channel = %channel, error = %err, "pub/sub subscribe failed");
                        continue;
                    }
                    routes.insert(channel, tx);
                }
                Some(PubSubCmd::Unsubscribe { channel }) => {
                    routes.remove(&channel);
                    if let Err(err) = sink.unsubscribe(&channel).await {
                        tracing::debug!(channel = %channel, error = %err, "pub/sub unsubscribe failed");
                    }
                }
                Some(PubSubCmd::Quit) | None => break,
            },
            msg = stream.next() => match msg {
                Some(msg) => {
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::warn!(channel = %channel, error = %err, "undecodable pub/sub payload");
                            continue;
                        }
                    };
                    if let Some(tx) = routes.get(&channel) {
                        // try_send: one stalled consumer must not hold up
                        // delivery on the other channels
                        if tx.try_send(ChannelMessage { channel, payload }).is_err() {
                            tracing::warn!("liveness consumer lagging, message dropped");
                        }
                    }
                }
                None => {
                    tracing::warn!("pub/sub connection closed");
                    break;
                }
            },
        }
    }
}
