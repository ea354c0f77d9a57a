use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::QlessError;
use crate::job::Job;

/// Failure payload reported back to the store when a job's handler fails:
/// `group` buckets related failures together in the store's failure
/// views, `message` carries the detail.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub group: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(group: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            message: message.into(),
        }
    }

    /// Build a failure from a structured error: the group is the error's
    /// type name (last path segment), the message its display plus the
    /// cause chain.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let group = type_name.rsplit("::").next().unwrap_or(type_name);

        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str("\n\ncaused by: ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        Self::new(group, message)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.group, self.message)
    }
}

impl From<QlessError> for HandlerError {
    fn from(err: QlessError) -> Self {
        let group = match &err {
            QlessError::HandlerNotFound(_) => "HandlerNotFound",
            QlessError::HandlerLacksPerform(_) => "HandlerLacksPerform",
            QlessError::Rejected { .. } => "StoreRejection",
            QlessError::Transport(_) => "TransportError",
            _ => "QlessError",
        };
        Self::new(group, err.to_string())
    }
}

/// The capability of actually working a job. Handlers get the job handle
/// mutably so they may edit its payload or finalize it themselves.
#[async_trait]
pub trait Performable: Send + Sync {
    async fn perform(&self, job: &mut Job) -> Result<(), HandlerError>;
}

/// Anything a resolver can hand back for a job class. Resolution and the
/// perform capability are separate failure modes: a class can be known to
/// the registry yet not performable (e.g. registered for tagging or
/// scheduling purposes only).
pub trait Handler: Send + Sync {
    fn as_performable(&self) -> Option<&dyn Performable> {
        None
    }
}

impl<T: Performable> Handler for T {
    fn as_performable(&self) -> Option<&dyn Performable> {
        Some(self)
    }
}

/// Maps a job's class identifier to a handler.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, klass: &str) -> Option<Arc<dyn Handler>>;
}

/// Registry resolver: an explicit map built at startup. Nothing is ever
/// loaded or evaluated from the class identifier itself.
#[derive(Default)]
pub struct StaticResolver {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, klass: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(klass.into(), handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl HandlerResolver for StaticResolver {
    fn resolve(&self, klass: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(klass).cloned()
    }
}
