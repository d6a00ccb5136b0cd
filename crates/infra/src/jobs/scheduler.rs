//! Durable job scheduler.
//!
//! Submissions are persisted QUEUED and handed to a fixed pool of dispatch
//! workers. Each worker drives one job at a time through its attempts:
//! checkpoint, run under a watchdog, settle, and back off between retries.
//! Every transition is persisted and audited under the job's record lock, so
//! the audit events of one job are strictly ordered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use simbridge_audit::AuditSink;
use simbridge_core::{time, BridgeError, ErrorKind, JobId};

use super::backend::{ExecutionBackend, ExecutionError, ExecutionOutput, WorkItem};
use super::locks::RecordLocks;
use super::registry::{ClaimOutcome, IdempotencyRecord, JobRegistry, RecordQuery};
use super::types::{
    JobError, JobRecord, JobStatus, JobView, ResultRef, RetryPolicy, SubmitOptions, SubmitReceipt,
    INTERRUPTED_BY_RESTART,
};
use crate::artifacts::ArtifactStore;
use crate::idempotency::request_fingerprint;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Dispatch pool size
    pub workers: usize,
    pub default_timeout_seconds: u64,
    pub default_max_retries: u32,
    /// Delay between a transient failure and the next attempt
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_timeout_seconds: 3600,
            default_max_retries: 2,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_default_timeout(mut self, seconds: u64) -> Self {
        self.default_timeout_seconds = seconds;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub idempotent_replays: u64,
    /// Attempts executing right now
    pub running: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    retried: AtomicU64,
    idempotent_replays: AtomicU64,
    running: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn terminal(&self, status: JobStatus) {
        match status {
            JobStatus::Succeeded => Self::bump(&self.succeeded),
            JobStatus::Failed => Self::bump(&self.failed),
            JobStatus::Cancelled => Self::bump(&self.cancelled),
            JobStatus::Timeout => Self::bump(&self.timed_out),
            JobStatus::Queued | JobStatus::Running => {}
        }
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            idempotent_replays: self.idempotent_replays.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// How long a backend gets to wind down after an interrupt.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// How the watchdog race around one attempt ended.
enum Attempt {
    Finished(Result<ExecutionOutput, ExecutionError>),
    Expired,
    Shutdown,
}

/// How one attempt ended, before it is applied to the record.
enum Outcome {
    Succeeded(ResultRef, Option<String>),
    Failed(ExecutionError),
    /// The result was produced but could not be stored.
    Unstored(String),
    TimedOut,
}

struct Inner {
    registry: Arc<dyn JobRegistry>,
    backend: Arc<dyn ExecutionBackend>,
    audit: Arc<AuditSink>,
    artifacts: Arc<dyn ArtifactStore>,
    config: SchedulerConfig,
    locks: RecordLocks,
    dispatch: mpsc::UnboundedSender<JobId>,
    /// Interruption handles of jobs currently owned by a worker.
    interrupts: StdMutex<HashMap<JobId, CancellationToken>>,
    /// Bumped on every terminal transition; `wait` subscribes to it.
    completions: watch::Sender<u64>,
    counters: Counters,
    shutdown: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

/// Job scheduler.
///
/// Cheap to clone; clones share the dispatch pool and all state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("backend", &self.inner.backend.name())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Reconcile the registry, start the dispatch pool and re-dispatch jobs
    /// that were queued when the previous process stopped.
    pub async fn start(
        registry: Arc<dyn JobRegistry>,
        backend: Arc<dyn ExecutionBackend>,
        audit: Arc<AuditSink>,
        artifacts: Arc<dyn ArtifactStore>,
        config: SchedulerConfig,
    ) -> Result<Self, BridgeError> {
        let (dispatch, queue) = mpsc::unbounded_channel();
        let (completions, _) = watch::channel(0);

        let scheduler = Self {
            inner: Arc::new(Inner {
                registry,
                backend,
                audit,
                artifacts,
                config,
                locks: RecordLocks::default(),
                dispatch,
                interrupts: StdMutex::new(HashMap::new()),
                completions,
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
                workers: StdMutex::new(Vec::new()),
            }),
        };

        let interrupted = scheduler.reconcile().await?;
        scheduler.spawn_workers(queue);
        let requeued = scheduler.redispatch_queued().await?;

        info!(
            backend = %scheduler.inner.backend.name(),
            workers = scheduler.inner.config.workers.max(1),
            interrupted,
            requeued,
            "job scheduler started"
        );
        Ok(scheduler)
    }

    /// Submit a job.
    ///
    /// With an idempotency key, a resubmission carrying the same fingerprint
    /// returns the original job and schedules nothing; a different
    /// fingerprint is a `Conflict`.
    pub async fn submit(
        &self,
        kind: impl Into<String>,
        params: Value,
        options: SubmitOptions,
    ) -> Result<SubmitReceipt, BridgeError> {
        let kind = kind.into();
        if !self.inner.backend.accepts(&kind) {
            return Err(BridgeError::not_found(format!("no handler for kind {kind}")));
        }

        let timeout_seconds = options
            .timeout_seconds
            .unwrap_or(self.inner.config.default_timeout_seconds);
        if timeout_seconds == 0 {
            return Err(BridgeError::invalid_input("timeout_seconds must be positive"));
        }
        let max_retries = options
            .max_retries
            .unwrap_or(self.inner.config.default_max_retries);

        let now = time::now();
        let mut record = JobRecord::new(JobId::new(), kind, params, timeout_seconds, max_retries, now)
            .with_idempotency_key(options.idempotency_key.clone());

        if let Some(key) = &options.idempotency_key {
            let fingerprint = match options.fingerprint {
                Some(fingerprint) => fingerprint,
                None => request_fingerprint(&record.kind, &record.params)?,
            };
            let claim = IdempotencyRecord {
                tool: options.tool.unwrap_or_else(|| record.kind.clone()),
                key: key.clone(),
                fingerprint,
                job_id: record.id,
                created_at: now,
            };

            match self.inner.registry.idempotency_claim(&claim).await? {
                ClaimOutcome::Claimed => {
                    debug!(job_id = %record.id, tool = %claim.tool, "idempotency key claimed");
                }
                ClaimOutcome::Existing(existing) if existing.fingerprint == claim.fingerprint => {
                    // The claimer may not have created the record yet; whoever
                    // creates it first is the original submission.
                    record.id = existing.job_id;
                }
                ClaimOutcome::Existing(existing) => {
                    warn!(job_id = %existing.job_id, tool = %existing.tool, "idempotency key reused with a different request");
                    return Err(BridgeError::conflict(format!(
                        "idempotency key {key} is bound to job {} with a different request",
                        existing.job_id
                    )));
                }
            }
        }

        let (stored, created) = self.create(record).await?;
        if !created {
            Counters::bump(&self.inner.counters.idempotent_replays);
            info!(job_id = %stored.id, "idempotent resubmission replayed");
        }
        Ok(SubmitReceipt::for_record(&stored, !created))
    }

    /// Persist and dispatch `record` unless a record with its id exists.
    ///
    /// Returns the stored record and whether this call created it.
    async fn create(&self, record: JobRecord) -> Result<(JobRecord, bool), BridgeError> {
        let job_id = record.id;
        {
            let _guard = self.inner.locks.lock(job_id).await;
            if let Some(existing) = self.inner.registry.get(job_id).await? {
                return Ok((existing, false));
            }

            if let Err(e) = self.inner.registry.upsert(&record).await {
                self.rollback(job_id).await;
                return Err(e.into());
            }
            if let Err(e) = self
                .inner
                .audit
                .record_event(event_type(&record, "queued"), event_payload(&record, json!({})))
                .await
            {
                error!(job_id = %job_id, error = %e, "queued event not recorded, withdrawing job");
                self.rollback(job_id).await;
                return Err(BridgeError::internal(format!("audit write failed: {e}")));
            }
        }

        Counters::bump(&self.inner.counters.submitted);
        info!(job_id = %job_id, kind = %record.kind, timeout_seconds = record.timeout_seconds, max_retries = record.max_retries, "job queued");
        self.dispatch(job_id);
        Ok((record, true))
    }

    async fn rollback(&self, job_id: JobId) {
        if let Err(e) = self.inner.registry.delete(job_id).await {
            error!(job_id = %job_id, error = %e, "failed to withdraw job record");
        }
        if let Err(e) = self.inner.registry.idempotency_delete_for_job(job_id).await {
            error!(job_id = %job_id, error = %e, "failed to withdraw idempotency mapping");
        }
    }

    fn dispatch(&self, job_id: JobId) {
        if self.inner.dispatch.send(job_id).is_err() {
            warn!(job_id = %job_id, "dispatch pool stopped; job stays queued until restart");
        }
    }

    /// Request cancellation.
    ///
    /// A queued job is cancelled at once. A running job is flagged and its
    /// attempt interrupted best-effort. Cancelling a finished job changes
    /// nothing.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobView, BridgeError> {
        let view = {
            let _guard = self.inner.locks.lock(job_id).await;
            let mut record = self
                .inner
                .registry
                .get(job_id)
                .await?
                .ok_or_else(|| BridgeError::not_found(format!("job {job_id}")))?;

            match record.status {
                JobStatus::Queued => {
                    record.cancel_requested = true;
                    record.mark_cancelled(time::now())?;
                    self.commit(&record, "cancelled", json!({})).await?;
                    info!(job_id = %job_id, "queued job cancelled");
                }
                JobStatus::Running if !record.cancel_requested => {
                    record.cancel_requested = true;
                    self.commit(&record, "cancel_requested", json!({})).await?;
                    info!(job_id = %job_id, attempt = record.attempts, "cancellation requested for running job");
                }
                status => {
                    debug!(job_id = %job_id, status = %status, "cancel is a no-op");
                }
            }
            JobView::from(&record)
        };

        if let Some(token) = self.interrupts().get(&job_id) {
            token.cancel();
        }
        Ok(view)
    }

    pub async fn get(&self, job_id: JobId) -> Result<JobView, BridgeError> {
        self.inner
            .registry
            .get(job_id)
            .await?
            .map(|r| JobView::from(&r))
            .ok_or_else(|| BridgeError::not_found(format!("job {job_id}")))
    }

    pub async fn list(&self, query: &RecordQuery) -> Result<Vec<JobView>, BridgeError> {
        let records = self.inner.registry.list(query).await?;
        Ok(records.iter().map(JobView::from).collect())
    }

    /// Load the stored result of a succeeded job.
    pub async fn result_value(&self, job_id: JobId) -> Result<Option<Value>, BridgeError> {
        let record = self
            .inner
            .registry
            .get(job_id)
            .await?
            .ok_or_else(|| BridgeError::not_found(format!("job {job_id}")))?;
        match &record.result {
            Some(result) => Ok(self.inner.artifacts.get(&result.key).await?),
            None => Ok(None),
        }
    }

    /// Wait until the job is terminal or `timeout` elapses.
    ///
    /// Only the calling task is suspended. Returns `Timeout` at the deadline.
    pub async fn wait(&self, job_id: JobId, timeout: Duration) -> Result<JobView, BridgeError> {
        let deadline = Instant::now() + timeout;
        // Subscribe before the first read so no completion is missed.
        let mut completions = self.inner.completions.subscribe();

        loop {
            let view = self.get(job_id).await?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            match tokio::time::timeout_at(deadline, completions.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(BridgeError::internal("scheduler stopped")),
                Err(_) => {
                    return Err(BridgeError::timeout(format!(
                        "job {job_id} still {} after {}ms",
                        view.status,
                        timeout.as_millis()
                    )));
                }
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.counters.snapshot()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Stop the dispatch pool.
    ///
    /// Jobs waiting out a backoff stay QUEUED and are re-dispatched by the
    /// next start. In-flight attempts are interrupted and left RUNNING, which
    /// the next start reconciles like a crash.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch worker ended abnormally");
            }
        }
        info!("job scheduler stopped");
    }

    fn interrupts(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.inner
            .interrupts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every record a previous process left RUNNING.
    async fn reconcile(&self) -> Result<usize, BridgeError> {
        let orphans = self
            .inner
            .registry
            .list(&RecordQuery::status(JobStatus::Running))
            .await?;

        let mut reconciled = 0;
        for orphan in orphans {
            let _guard = self.inner.locks.lock(orphan.id).await;
            let Some(mut record) = self.inner.registry.get(orphan.id).await? else {
                continue;
            };
            if record.status != JobStatus::Running {
                continue;
            }
            record.mark_interrupted_by_restart(time::now())?;
            self.commit(&record, "failed", json!({ "reason": INTERRUPTED_BY_RESTART }))
                .await?;
            warn!(job_id = %record.id, kind = %record.kind, attempt = record.attempts, "job interrupted by restart");
            reconciled += 1;
        }
        Ok(reconciled)
    }

    async fn redispatch_queued(&self) -> Result<usize, BridgeError> {
        let queued = self
            .inner
            .registry
            .list(&RecordQuery::status(JobStatus::Queued))
            .await?;
        for record in &queued {
            self.dispatch(record.id);
        }
        Ok(queued.len())
    }

    fn spawn_workers(&self, queue: mpsc::UnboundedReceiver<JobId>) {
        let queue = Arc::new(Mutex::new(queue));
        let handles = (0..self.inner.config.workers.max(1))
            .map(|worker| {
                let scheduler = self.clone();
                let queue = queue.clone();
                tokio::spawn(async move { scheduler.worker_loop(worker, queue).await })
            })
            .collect();
        *self.workers() = handles;
    }

    async fn worker_loop(self, worker: usize, queue: Arc<Mutex<mpsc::UnboundedReceiver<JobId>>>) {
        debug!(worker, "dispatch worker started");
        loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.cancelled() => None,
                next = async { queue.lock().await.recv().await } => next,
            };
            let Some(job_id) = next else { break };
            self.run_job(job_id).await;
        }
        debug!(worker, "dispatch worker stopped");
    }

    async fn run_job(&self, job_id: JobId) {
        let interrupt = CancellationToken::new();
        {
            let mut interrupts = self.interrupts();
            if interrupts.contains_key(&job_id) {
                debug!(job_id = %job_id, "job already owned by another worker");
                return;
            }
            interrupts.insert(job_id, interrupt.clone());
        }

        if let Err(e) = self.drive(job_id, &interrupt).await {
            error!(job_id = %job_id, error = %e, "job execution aborted");
        }

        self.interrupts().remove(&job_id);
    }

    /// Run attempts until the job is terminal, stays queued for shutdown, or
    /// is found already owned elsewhere.
    async fn drive(&self, job_id: JobId, interrupt: &CancellationToken) -> Result<(), BridgeError> {
        loop {
            let Some((work, timeout)) = self.begin_attempt(job_id).await? else {
                return Ok(());
            };
            let attempt = work.attempt;

            self.inner.counters.running.fetch_add(1, Ordering::Relaxed);
            let run = self.inner.backend.run(work, interrupt.clone());
            tokio::pin!(run);
            let ended = tokio::select! {
                result = &mut run => Attempt::Finished(result),
                _ = tokio::time::sleep(timeout) => Attempt::Expired,
                _ = self.inner.shutdown.cancelled() => Attempt::Shutdown,
            };
            if !matches!(ended, Attempt::Finished(_)) {
                // The backend owns the cleanup of remote work, so it must
                // observe the interrupt before `run` is dropped.
                interrupt.cancel();
                if tokio::time::timeout(INTERRUPT_GRACE, &mut run).await.is_err() {
                    warn!(job_id = %job_id, attempt, "backend ignored interrupt, abandoning attempt");
                }
            }
            self.inner.counters.running.fetch_sub(1, Ordering::Relaxed);

            let outcome = match ended {
                Attempt::Shutdown => {
                    warn!(job_id = %job_id, attempt, "shutdown interrupted a running attempt");
                    return Ok(());
                }
                Attempt::Expired => Outcome::TimedOut,
                Attempt::Finished(Ok(output)) => self.store_output(job_id, output).await,
                Attempt::Finished(Err(e)) => Outcome::Failed(e),
            };

            let Some(delay) = self.settle(job_id, outcome).await? else {
                return Ok(());
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = interrupt.cancelled() => {
                    debug!(job_id = %job_id, "backoff cut short by cancellation");
                }
                _ = self.inner.shutdown.cancelled() => {
                    info!(job_id = %job_id, "shutdown during backoff, job stays queued");
                    return Ok(());
                }
            }
        }
    }

    /// Pre-start checkpoint. Returns the work to run, or `None` when the job
    /// must not start.
    async fn begin_attempt(&self, job_id: JobId) -> Result<Option<(WorkItem, Duration)>, BridgeError> {
        let _guard = self.inner.locks.lock(job_id).await;
        let Some(mut record) = self.inner.registry.get(job_id).await? else {
            warn!(job_id = %job_id, "dispatched job is no longer registered");
            return Ok(None);
        };

        if record.status != JobStatus::Queued {
            debug!(job_id = %job_id, status = %record.status, "skipping dispatch of job that is not queued");
            return Ok(None);
        }

        if record.cancel_requested {
            record.mark_cancelled(time::now())?;
            self.commit(&record, "cancelled", json!({})).await?;
            info!(job_id = %job_id, "job cancelled before start");
            return Ok(None);
        }

        record.mark_running(time::now())?;
        self.commit(&record, "running", json!({})).await?;
        debug!(job_id = %job_id, kind = %record.kind, attempt = record.attempts, "attempt started");

        let work = WorkItem {
            job_id,
            kind: record.kind.clone(),
            params: record.params.clone(),
            attempt: record.attempts,
        };
        Ok(Some((work, Duration::from_secs(record.timeout_seconds))))
    }

    /// Store a clean result. Runs outside the record lock.
    async fn store_output(&self, job_id: JobId, output: ExecutionOutput) -> Outcome {
        match self.inner.artifacts.put(job_id, &output.value).await {
            Ok(result) => Outcome::Succeeded(result, output.external_ref),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to store job result");
                Outcome::Unstored(e.to_string())
            }
        }
    }

    /// Apply an attempt's outcome. Returns the backoff delay when the job was
    /// re-queued for another attempt.
    async fn settle(&self, job_id: JobId, outcome: Outcome) -> Result<Option<Duration>, BridgeError> {
        let _guard = self.inner.locks.lock(job_id).await;
        let Some(mut record) = self.inner.registry.get(job_id).await? else {
            warn!(job_id = %job_id, "job vanished while running");
            return Ok(None);
        };
        if record.status != JobStatus::Running {
            warn!(job_id = %job_id, status = %record.status, "attempt settled on a job that is not running");
            return Ok(None);
        }

        let now = time::now();
        match outcome {
            Outcome::Succeeded(result, external_ref) => {
                if external_ref.is_some() {
                    record.external_ref = external_ref;
                }
                record.mark_succeeded(result, now)?;
                self.commit(&record, "succeeded", json!({})).await?;
                info!(job_id = %job_id, attempts = record.attempts, "job succeeded");
            }
            Outcome::Unstored(message) => {
                record.mark_failed(
                    JobError::new(ErrorKind::Internal, format!("result not stored: {message}")),
                    now,
                )?;
                self.commit(&record, "failed", json!({})).await?;
            }
            Outcome::TimedOut => {
                record.mark_timed_out(now)?;
                self.commit(&record, "timeout", json!({})).await?;
                warn!(job_id = %job_id, timeout_seconds = record.timeout_seconds, "job timed out");
            }
            Outcome::Failed(ExecutionError::Interrupted) if record.cancel_requested => {
                record.mark_cancelled(now)?;
                self.commit(&record, "cancelled", json!({})).await?;
                info!(job_id = %job_id, "running job cancelled");
            }
            Outcome::Failed(ExecutionError::Interrupted) => {
                record.mark_failed(JobError::new(ErrorKind::Internal, "attempt interrupted"), now)?;
                self.commit(&record, "failed", json!({})).await?;
            }
            Outcome::Failed(ExecutionError::Transient(_)) if record.cancel_requested => {
                record.mark_cancelled(now)?;
                self.commit(&record, "cancelled", json!({})).await?;
                info!(job_id = %job_id, "job cancelled between attempts");
            }
            Outcome::Failed(ExecutionError::Transient(message)) if record.retry_allowed() => {
                let delay = self.inner.config.retry_policy.delay_for_attempt(record.attempts);
                record.mark_retry(JobError::new(ErrorKind::TransientBackendFailure, message.clone()))?;
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                self.commit(&record, "retry", json!({ "error": message, "delay_ms": delay_ms }))
                    .await?;
                Counters::bump(&self.inner.counters.retried);
                warn!(job_id = %job_id, attempt = record.attempts, delay_ms, error = %message, "transient failure, retrying");
                return Ok(Some(delay));
            }
            Outcome::Failed(ExecutionError::Transient(message)) => {
                record.mark_failed(
                    JobError::new(
                        ErrorKind::PermanentFailure,
                        format!("retries exhausted after {} attempts: {message}", record.attempts),
                    ),
                    now,
                )?;
                self.commit(&record, "failed", json!({})).await?;
                warn!(job_id = %job_id, attempts = record.attempts, "job failed, retries exhausted");
            }
            Outcome::Failed(ExecutionError::Permanent(message)) => {
                record.mark_failed(JobError::new(ErrorKind::PermanentFailure, message), now)?;
                self.commit(&record, "failed", json!({})).await?;
                warn!(job_id = %job_id, attempts = record.attempts, "job failed");
            }
        }
        Ok(None)
    }

    /// Persist `record` and emit `job.<kind>.<event>`. Caller holds the
    /// record lock.
    ///
    /// A transition the audit trail refused is undone: the stored record is
    /// put back as it was.
    async fn commit(&self, record: &JobRecord, event: &str, extra: Value) -> Result<(), BridgeError> {
        let prior = self.inner.registry.get(record.id).await?;
        self.inner.registry.upsert(record).await?;
        if let Err(e) = self
            .inner
            .audit
            .record_event(event_type(record, event), event_payload(record, extra))
            .await
        {
            error!(job_id = %record.id, event, error = %e, "transition not audited, restoring record");
            let restored = match &prior {
                Some(prior) => self.inner.registry.upsert(prior).await,
                None => self.inner.registry.delete(record.id).await.map(|_| ()),
            };
            if let Err(restore) = restored {
                error!(job_id = %record.id, error = %restore, "failed to restore job record");
            }
            return Err(e.into());
        }

        if record.status.is_terminal() {
            self.inner.counters.terminal(record.status);
            self.inner.completions.send_modify(|n| *n = n.wrapping_add(1));
        }
        Ok(())
    }
}

fn event_type(record: &JobRecord, event: &str) -> String {
    format!("job.{}.{}", record.kind, event)
}

fn event_payload(record: &JobRecord, extra: Value) -> Value {
    let mut payload = json!({
        "job_id": record.id,
        "kind": record.kind,
        "status": record.status,
        "attempt": record.attempts,
    });
    if let (Value::Object(base), Value::Object(extra)) = (&mut payload, extra) {
        base.extend(extra);
    }
    if let (Value::Object(base), Some(error)) = (&mut payload, &record.error) {
        if record.status.is_terminal() {
            base.entry("error_kind").or_insert(json!(error.kind));
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::InMemoryArtifactStore;
    use crate::jobs::backend::{handler_fn, InProcessBackend};
    use crate::jobs::registry::InMemoryJobRegistry;
    use simbridge_audit::store::MemoryAuditStore;

    async fn scheduler(backend: InProcessBackend) -> Scheduler {
        let audit = AuditSink::open(Arc::new(MemoryAuditStore::new()))
            .await
            .unwrap();
        Scheduler::start(
            Arc::new(InMemoryJobRegistry::new()),
            Arc::new(backend),
            Arc::new(audit),
            Arc::new(InMemoryArtifactStore::new()),
            SchedulerConfig::default()
                .with_workers(2)
                .with_retry_policy(RetryPolicy::immediate()),
        )
        .await
        .unwrap()
    }

    fn echo() -> InProcessBackend {
        InProcessBackend::new().with_handler(
            "sim.*",
            handler_fn(|w| async move { Ok::<_, ExecutionError>(w.params) }),
        )
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected_at_submit() {
        let s = scheduler(echo()).await;
        let err = s
            .submit("report.pdf", json!({}), SubmitOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(s.stats().submitted, 0);
    }

    #[tokio::test]
    async fn zero_timeout_is_invalid() {
        let s = scheduler(echo()).await;
        let err = s
            .submit("sim.a", json!({}), SubmitOptions::new().timeout_seconds(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn submit_run_and_fetch_result() {
        let s = scheduler(echo()).await;
        let receipt = s
            .submit("sim.a", json!({"steps": 3}), SubmitOptions::new())
            .await
            .unwrap();
        assert_eq!(receipt.status, JobStatus::Queued);
        assert!(!receipt.replayed);

        let view = s.wait(receipt.job_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(view.status, JobStatus::Succeeded);
        assert_eq!(view.attempts, 1);
        assert_eq!(
            s.result_value(receipt.job_id).await.unwrap(),
            Some(json!({"steps": 3}))
        );

        let stats = s.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.running, 0);
    }

    #[tokio::test]
    async fn wait_times_out_on_a_stuck_job() {
        let backend = InProcessBackend::new().with_handler(
            "sim.slow",
            handler_fn(|_w| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, ExecutionError>(json!(null))
            }),
        );
        let s = scheduler(backend).await;
        let receipt = s
            .submit("sim.slow", json!({}), SubmitOptions::new())
            .await
            .unwrap();
        let err = s
            .wait(receipt.job_id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let s = scheduler(echo()).await;
        assert_eq!(s.get(JobId::new()).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(s.cancel(JobId::new()).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn terminal_payload_carries_error_kind() {
        let mut r = JobRecord::new(JobId::new(), "sim.a", json!({}), 5, 0, time::now());
        r.mark_running(time::now()).unwrap();
        r.mark_timed_out(time::now()).unwrap();
        let payload = event_payload(&r, json!({"extra": 1}));
        assert_eq!(payload["status"], "TIMEOUT");
        assert_eq!(payload["error_kind"], "timeout");
        assert_eq!(payload["extra"], 1);
        assert_eq!(payload["attempt"], 1);
    }
}
