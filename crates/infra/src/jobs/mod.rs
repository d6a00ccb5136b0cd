//! Durable job scheduling with retry, timeout, cancellation and idempotency.
//!
//! ## Design
//!
//! - Every job is a persisted `JobRecord`; status follows a closed state machine
//! - Mutations of one record are serialized by a sharded per-record lock
//! - Every transition emits one audit event, `job.<kind>.<event>`
//! - Execution is delegated to a pluggable `ExecutionBackend`
//!
//! ## Components
//!
//! - `JobRecord` / `JobStatus`: record model and transitions
//! - `JobRegistry`: persistence (in-memory or SQLite)
//! - `ExecutionBackend`: in-process handlers, batch hand-off, Redis queue
//! - `Scheduler`: submit/cancel/get/wait and the per-attempt loop

pub mod backend;
pub mod batch;
pub mod locks;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod registry;
pub mod scheduler;
pub mod sqlite;
pub mod types;

pub use backend::{
    handler_fn, ExecutionBackend, ExecutionError, ExecutionOutput, InProcessBackend, JobHandler,
    WorkItem,
};
pub use batch::{BatchClient, BatchHandoffBackend, BatchState};
#[cfg(feature = "redis")]
pub use redis_queue::RedisQueueBackend;
pub use registry::{
    ClaimOutcome, IdempotencyRecord, InMemoryJobRegistry, JobRegistry, RecordQuery, RegistryError,
};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use sqlite::SqliteJobRegistry;
pub use types::{
    BackoffStrategy, JobError, JobRecord, JobStatus, JobView, ResultRef, RetryPolicy,
    SubmitOptions, SubmitReceipt,
};
