//! Execution backends: where a job body actually runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use simbridge_core::JobId;

/// One attempt of a job, as handed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub job_id: JobId,
    pub kind: String,
    pub params: Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Successful attempt output.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub value: Value,
    /// Handle in an external scheduler, if the attempt ran there.
    pub external_ref: Option<String>,
}

impl ExecutionOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            external_ref: None,
        }
    }
}

/// Failure of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Retryable (network blip, busy engine, ...).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Not worth retrying (bad params, model error, ...).
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The attempt stopped because interruption was requested.
    #[error("interrupted")]
    Interrupted,
}

/// Runs job bodies.
///
/// All variants share one contract: run the work, return its output or a
/// classified error, and stop as soon as practical once `interrupt` fires.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this backend can run jobs of `kind`.
    fn accepts(&self, kind: &str) -> bool;

    async fn run(
        &self,
        work: WorkItem,
        interrupt: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError>;
}

/// The narrow execute contract of a computation engine.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, work: &WorkItem) -> Result<Value, ExecutionError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send,
{
    async fn execute(&self, work: &WorkItem) -> Result<Value, ExecutionError> {
        (self.0)(work.clone()).await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Aborts the task when dropped, so a watchdog that drops `run` also stops
/// the handler.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs handlers as tasks on the local tokio runtime.
///
/// Concurrency is bounded by the scheduler's worker count. Handlers are
/// resolved by exact kind, then category (`"sim.*"` matches `"sim.cardio"`),
/// then the `"*"` wildcard.
#[derive(Default)]
pub struct InProcessBackend {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a kind pattern.
    pub fn register_handler(&mut self, kind_pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind_pattern.into(), handler);
    }

    /// Builder form of [`InProcessBackend::register_handler`].
    pub fn with_handler(mut self, kind_pattern: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.register_handler(kind_pattern, handler);
        self
    }

    /// Get the handler for a job kind.
    fn resolve(&self, kind: &str) -> Option<&Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(kind) {
            return Some(h);
        }

        // Longest category prefix wins
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = kind.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h);
        if category.is_some() {
            return category;
        }

        self.handlers.get("*")
    }
}

#[async_trait]
impl ExecutionBackend for InProcessBackend {
    fn name(&self) -> &str {
        "in-process"
    }

    fn accepts(&self, kind: &str) -> bool {
        self.resolve(kind).is_some()
    }

    async fn run(
        &self,
        work: WorkItem,
        interrupt: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let handler = self
            .resolve(&work.kind)
            .cloned()
            .ok_or_else(|| ExecutionError::Permanent(format!("no handler for kind {}", work.kind)))?;

        let job_id = work.job_id;
        let mut task = AbortOnDrop(tokio::spawn(async move { handler.execute(&work).await }));

        tokio::select! {
            _ = interrupt.cancelled() => {
                debug!(job_id = %job_id, "interrupting in-process handler");
                task.0.abort();
                Err(ExecutionError::Interrupted)
            }
            joined = &mut task.0 => match joined {
                Ok(result) => result.map(ExecutionOutput::new),
                Err(e) if e.is_panic() => {
                    warn!(job_id = %job_id, "job handler panicked");
                    Err(ExecutionError::Permanent("handler panicked".to_string()))
                }
                Err(_) => Err(ExecutionError::Interrupted),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn work(kind: &str) -> WorkItem {
        WorkItem {
            job_id: JobId::new(),
            kind: kind.to_string(),
            params: json!({}),
            attempt: 1,
        }
    }

    fn constant(tag: &'static str) -> Arc<dyn JobHandler> {
        handler_fn(move |_w| async move { Ok::<_, ExecutionError>(json!(tag)) })
    }

    #[tokio::test]
    async fn exact_then_category_then_wildcard() {
        let backend = InProcessBackend::new()
            .with_handler("sim.cardio", constant("exact"))
            .with_handler("sim.*", constant("category"))
            .with_handler("*", constant("wildcard"));

        let run = |kind: &'static str| {
            let b = &backend;
            async move { b.run(work(kind), CancellationToken::new()).await.unwrap().value }
        };
        assert_eq!(run("sim.cardio").await, json!("exact"));
        assert_eq!(run("sim.renal").await, json!("category"));
        assert_eq!(run("simulate").await, json!("wildcard"));
    }

    #[tokio::test]
    async fn unknown_kind_is_not_accepted() {
        let backend = InProcessBackend::new().with_handler("sim.*", constant("x"));
        assert!(backend.accepts("sim.a"));
        assert!(!backend.accepts("report.a"));
        let err = backend
            .run(work("report.a"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Permanent(_)));
    }

    #[tokio::test]
    async fn interruption_aborts_the_handler() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let backend = InProcessBackend::new().with_handler(
            "slow",
            handler_fn(move |_w| {
                let flag = flag.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, ExecutionError>(json!(null))
                }
            }),
        );

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = backend.run(work("slow"), token).await.unwrap_err();
        assert_eq!(err, ExecutionError::Interrupted);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_handler_is_permanent_failure() {
        let backend = InProcessBackend::new().with_handler(
            "boom",
            handler_fn(|_w| async move {
                if true {
                    panic!("engine crashed");
                }
                Ok::<_, ExecutionError>(json!(null))
            }),
        );
        let err = backend.run(work("boom"), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Permanent(_)));
    }
}
