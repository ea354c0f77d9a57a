use serde_json::Value;

use crate::client::Client;
use crate::error::{QlessError, Result};
use crate::store::Reply;

/// Proxy for the store's resource limiter: named counters that cap how
/// many jobs holding a given resource may run at once.
#[derive(Clone)]
pub struct Resource {
    client: Client,
}

impl Resource {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create or resize a resource.
    pub async fn set(&self, id: &str, max: i64) -> Result<()> {
        self.client
            .store()
            .call("resource.set", vec![id.to_string(), max.to_string()])
            .await?;
        Ok(())
    }

    /// A resource's current description, or None if it does not exist.
    pub async fn get(&self, id: &str) -> Result<Option<Value>> {
        let reply = self
            .client
            .store()
            .call("resource.get", vec![id.to_string()])
            .await?;
        match reply.as_str() {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    /// Delete a resource.
    pub async fn unset(&self, id: &str) -> Result<()> {
        self.client
            .store()
            .call("resource.unset", vec![id.to_string()])
            .await?;
        Ok(())
    }

    /// Jids currently holding locks on a resource.
    pub async fn locks(&self, id: &str) -> Result<Vec<String>> {
        let reply = self
            .client
            .store()
            .call("resource.locks", vec![id.to_string()])
            .await?;
        match reply {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| {
                    item.into_text().ok_or_else(|| QlessError::MalformedReply {
                        command: "resource.locks".to_string(),
                        detail: "expected jids".to_string(),
                    })
                })
                .collect(),
            Reply::Nil => Ok(Vec::new()),
            other => Err(QlessError::MalformedReply {
                command: "resource.locks".to_string(),
                detail: format!("expected a jid list, got {:?}", other),
            }),
        }
    }

    /// Usage counts across all resources.
    pub async fn counts(&self) -> Result<Value> {
        let reply = self.client.store().call("resources", Vec::new()).await?;
        let raw = reply.as_str().ok_or_else(|| QlessError::MalformedReply {
            command: "resources".to_string(),
            detail: "expected resource counts".to_string(),
        })?;
        Ok(serde_json::from_str(raw)?)
    }
}
