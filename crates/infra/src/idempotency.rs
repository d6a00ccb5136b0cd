//! Idempotent tool invocation.
//!
//! Callers attach a key to a request; resubmitting the same request under the
//! same key resolves to the original job. The mapping itself lives in the
//! job registry and is enforced by [`Scheduler::submit`].

use std::sync::Arc;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use simbridge_audit::canonical::to_canonical_bytes;
use simbridge_audit::AuditSink;
use simbridge_core::{BridgeError, ErrorKind};

use crate::jobs::scheduler::Scheduler;
use crate::jobs::types::{SubmitOptions, SubmitReceipt};

/// Longest accepted idempotency key.
pub const MAX_KEY_LEN: usize = 256;

/// SHA-256 (hex) of the canonical form of `{kind, params}`.
///
/// Key order and whitespace in `params` do not affect the result.
pub fn request_fingerprint(kind: &str, params: &Value) -> Result<String, BridgeError> {
    let bytes = to_canonical_bytes(&json!({ "kind": kind, "params": params }))
        .map_err(|e| BridgeError::internal(format!("fingerprint canonicalization failed: {e}")))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// A tool invocation that results in a job.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Idempotency namespace and audit label
    pub tool: String,
    pub kind: String,
    pub params: Value,
    pub idempotency_key: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, kind: impl Into<String>, params: Value) -> Self {
        Self {
            tool: tool.into(),
            kind: kind.into(),
            params,
            idempotency_key: None,
            timeout_seconds: None,
            max_retries: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// Front door for tool calls: deduplicates by key and audits every
/// invocation as `tool.<name>.invoked`, `.replayed` or `.conflict`.
#[derive(Debug, Clone)]
pub struct IdempotencyGate {
    scheduler: Scheduler,
    audit: Arc<AuditSink>,
}

impl IdempotencyGate {
    pub fn new(scheduler: Scheduler, audit: Arc<AuditSink>) -> Self {
        Self { scheduler, audit }
    }

    pub async fn invoke(&self, call: ToolCall) -> Result<SubmitReceipt, BridgeError> {
        if let Some(key) = &call.idempotency_key {
            if key.is_empty() || key.len() > MAX_KEY_LEN {
                return Err(BridgeError::invalid_input(format!(
                    "idempotency key must be 1..={MAX_KEY_LEN} bytes"
                )));
            }
        }

        let fingerprint = request_fingerprint(&call.kind, &call.params)?;
        let mut options = SubmitOptions::new()
            .fingerprint(fingerprint.clone())
            .tool(call.tool.clone());
        options.idempotency_key = call.idempotency_key.clone();
        options.timeout_seconds = call.timeout_seconds;
        options.max_retries = call.max_retries;

        let payload = |job_id: Option<String>| {
            json!({
                "tool": call.tool,
                "kind": call.kind,
                "idempotency_key": call.idempotency_key,
                "fingerprint": fingerprint,
                "job_id": job_id,
            })
        };

        match self.scheduler.submit(call.kind.clone(), call.params.clone(), options).await {
            Ok(receipt) => {
                let event = if receipt.replayed { "replayed" } else { "invoked" };
                self.audit
                    .record_event(
                        format!("tool.{}.{event}", call.tool),
                        payload(Some(receipt.job_id.to_string())),
                    )
                    .await?;
                info!(tool = %call.tool, job_id = %receipt.job_id, replayed = receipt.replayed, "tool invoked");
                Ok(receipt)
            }
            Err(e) if e.kind() == ErrorKind::Conflict => {
                warn!(tool = %call.tool, error = %e, "tool invocation conflicts with an earlier request");
                self.audit
                    .record_event(format!("tool.{}.conflict", call.tool), payload(None))
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
