use thiserror::Error;

#[derive(Error, Debug)]
pub enum QlessError {
    /// The store's script logic refused the operation (lock lost, job
    /// already finalized elsewhere, bad state transition).
    #[error("Store rejected {command}: {message}")]
    Rejected { command: String, message: String },

    /// Connectivity or protocol failure talking to the store.
    #[error("Store transport error: {0}")]
    Transport(#[source] redis::RedisError),

    #[error("No handler registered for job class: {0}")]
    HandlerNotFound(String),

    #[error("Handler for job class {0} does not perform jobs")]
    HandlerLacksPerform(String),

    #[error("Worker process error: {0}")]
    Process(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed reply from {command}: {detail}")]
    MalformedReply { command: String, detail: String },
}

impl QlessError {
    /// True when the store itself refused the call, as opposed to the call
    /// never reaching it. Finalize paths treat rejections as non-fatal.
    pub fn is_rejection(&self) -> bool {
        matches!(self, QlessError::Rejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, QlessError>;
