//! Redis list-backed distributed task queue.
//!
//! Tasks are pushed onto `<prefix>:tasks` for remote engine workers. A worker
//! pushes its outcome onto the task's reply key; interruption is signalled by
//! setting `<prefix>:cancel:<job_id>`, which workers poll between steps.
//!
//! ## Wire format
//!
//! - task: `{"job_id", "kind", "params", "attempt", "reply_to"}`
//! - reply: `{"ok": bool, "value"?, "error"?, "retryable"?}`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use simbridge_core::JobId;

use super::backend::{ExecutionBackend, ExecutionError, ExecutionOutput, WorkItem};

const DEFAULT_PREFIX: &str = "simbridge";

/// Seconds each BLPOP waits before the interrupt flag is checked again.
const POLL_SECONDS: u64 = 1;

/// Lifetime of a cancel marker.
const CANCEL_TTL_SECONDS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum RedisQueueError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),
}

impl From<RedisQueueError> for ExecutionError {
    fn from(err: RedisQueueError) -> Self {
        ExecutionError::Transient(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TaskMessage {
    job_id: JobId,
    kind: String,
    params: Value,
    attempt: u32,
    reply_to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ReplyMessage {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retryable: bool,
}

impl ReplyMessage {
    fn into_result(self) -> Result<Value, ExecutionError> {
        if self.ok {
            return Ok(self.value);
        }
        let message = self.error.unwrap_or_else(|| "remote worker failed".to_string());
        Err(if self.retryable {
            ExecutionError::Transient(message)
        } else {
            ExecutionError::Permanent(message)
        })
    }
}

/// [`ExecutionBackend`] that hands work to remote engine workers over Redis.
#[derive(Debug, Clone)]
pub struct RedisQueueBackend {
    client: Arc<redis::Client>,
    prefix: String,
    kinds: Vec<String>,
}

impl RedisQueueBackend {
    /// `kinds` lists the kind patterns remote workers serve (`"sim.*"`, `"*"`).
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: Option<String>,
        kinds: Vec<String>,
    ) -> Result<Self, RedisQueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisQueueError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            kinds,
        })
    }

    fn tasks_key(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    fn reply_key(&self, work: &WorkItem) -> String {
        format!("{}:reply:{}:{}", self.prefix, work.job_id, work.attempt)
    }

    fn cancel_key(&self, job_id: JobId) -> String {
        format!("{}:cancel:{}", self.prefix, job_id)
    }

    fn connection(client: &redis::Client) -> Result<redis::Connection, RedisQueueError> {
        client
            .get_connection()
            .map_err(|e| RedisQueueError::Connection(e.to_string()))
    }

    #[instrument(skip(self, work), fields(job_id = %work.job_id, attempt = work.attempt), err)]
    async fn enqueue(&self, work: &WorkItem, reply_to: String) -> Result<(), RedisQueueError> {
        let task = TaskMessage {
            job_id: work.job_id,
            kind: work.kind.clone(),
            params: work.params.clone(),
            attempt: work.attempt,
            reply_to,
        };
        let payload =
            serde_json::to_string(&task).map_err(|e| RedisQueueError::Command(e.to_string()))?;
        let client = self.client.clone();
        let key = self.tasks_key();

        blocking(move || {
            let mut conn = Self::connection(&client)?;
            let _: u64 = redis::cmd("LPUSH")
                .arg(&key)
                .arg(&payload)
                .query(&mut conn)
                .map_err(|e| RedisQueueError::Command(e.to_string()))?;
            Ok(())
        })
        .await
    }

    /// One bounded wait for the reply.
    async fn poll_reply(&self, reply_key: &str) -> Result<Option<String>, RedisQueueError> {
        let client = self.client.clone();
        let key = reply_key.to_string();
        blocking(move || {
            let mut conn = Self::connection(&client)?;
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&key)
                .arg(POLL_SECONDS)
                .query(&mut conn)
                .map_err(|e| RedisQueueError::Command(e.to_string()))?;
            Ok(popped.map(|(_, body)| body))
        })
        .await
    }

    async fn signal_cancel(&self, job_id: JobId) -> Result<(), RedisQueueError> {
        let client = self.client.clone();
        let key = self.cancel_key(job_id);
        blocking(move || {
            let mut conn = Self::connection(&client)?;
            let _: () = redis::cmd("SET")
                .arg(&key)
                .arg(1)
                .arg("EX")
                .arg(CANCEL_TTL_SECONDS)
                .query(&mut conn)
                .map_err(|e| RedisQueueError::Command(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, RedisQueueError>
where
    F: FnOnce() -> Result<T, RedisQueueError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RedisQueueError::Connection(format!("redis task failed: {e}")))?
}

fn kind_matches(pattern: &str, kind: &str) -> bool {
    pattern == "*"
        || pattern == kind
        || pattern
            .strip_suffix(".*")
            .and_then(|prefix| kind.strip_prefix(prefix))
            .is_some_and(|rest| rest.starts_with('.'))
}

#[async_trait]
impl ExecutionBackend for RedisQueueBackend {
    fn name(&self) -> &str {
        "redis-queue"
    }

    fn accepts(&self, kind: &str) -> bool {
        self.kinds.iter().any(|p| kind_matches(p, kind))
    }

    async fn run(
        &self,
        work: WorkItem,
        interrupt: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let reply_key = self.reply_key(&work);
        self.enqueue(&work, reply_key.clone()).await?;
        debug!(job_id = %work.job_id, reply_key = %reply_key, "task enqueued for remote worker");

        loop {
            if interrupt.is_cancelled() {
                if let Err(e) = self.signal_cancel(work.job_id).await {
                    warn!(job_id = %work.job_id, error = %e, "failed to signal remote cancellation");
                }
                return Err(ExecutionError::Interrupted);
            }

            if let Some(body) = self.poll_reply(&reply_key).await? {
                let reply: ReplyMessage = serde_json::from_str(&body).map_err(|e| {
                    ExecutionError::Permanent(format!("malformed worker reply: {e}"))
                })?;
                return reply.into_result().map(ExecutionOutput::new);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
