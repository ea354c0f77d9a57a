pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod job;
pub mod queue;
pub mod resource;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use client::Client;
pub use error::{QlessError, Result};
pub use handler::{Handler, HandlerError, HandlerResolver, Performable, StaticResolver};
pub use job::{Job, JobLookup, RecurringJob};
pub use queue::Queue;
