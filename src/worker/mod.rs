//! Worker engine: job reservation loops and the process pool above them.
//!
//! Two layers run the same jobs:
//! - **Serial**: [`SerialWorker`] reserves and performs one job at a time
//!   inside the current process.
//! - **Pool**: [`Pool`] spawns one serial worker per process slot,
//!   supervises them over the liveness channel plus stdout job reports,
//!   and kills or respawns them as locks and processes demand.
//!
//! # Supervision Flow
//!
//! 1. [`Pool::run`] spawns N child processes with the queue list and
//!    connection settings as trailing JSON arguments
//! 2. Each child decodes them via [`ChildEntry`] and runs a
//!    [`SerialWorker`] that prints a report line per job start and end
//! 3. The pool arms a watchdog per running job from those reports and
//!    from store heartbeats, and force-kills the worker if a lock
//!    expires or is revoked while the job is still marked running

pub mod entry;
pub mod ipc;
pub mod pool;
pub mod serial;
pub mod spawn;

pub use entry::{init_worker_logging, ChildEntry};
pub use ipc::{JobInfo, JobInfoSink, StdoutSink};
pub use pool::Pool;
pub use serial::{PreRunHook, SerialWorker};
pub use spawn::{ChildControl, ProcessSpawner, SpawnedChild, TokioSpawner};
