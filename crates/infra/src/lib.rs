//! Infrastructure layer: job scheduling, registries, execution backends,
//! artifacts, retention and configuration.

pub mod artifacts;
pub mod bridge;
pub mod config;
pub mod idempotency;
pub mod jobs;
pub mod workers;

pub use artifacts::{ArtifactError, ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
pub use bridge::Bridge;
pub use config::{BridgeConfig, ConfigError};
pub use idempotency::{request_fingerprint, IdempotencyGate, ToolCall};
pub use jobs::{Scheduler, SchedulerConfig, SubmitOptions};
pub use workers::{RetentionSweeper, SweepReport, VerificationTask, WorkerHandle};
