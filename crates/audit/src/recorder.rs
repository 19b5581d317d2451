//! The audit recorder: redact, then append with bounded exponential retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};

use taxguard_core::AuditEntryId;

use crate::redact::redact;
use crate::{AuditActor, AuditEntry, AuditEvent, AuditOutcome, AuditSink, AuditStoreError, AuditTag, PendingEntry};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// Retries exhausted; the failure has been logged and counted.
    #[error("audit trail unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: usize,
        #[source]
        source: AuditStoreError,
    },

    #[error("audit entry rejected: {0}")]
    Rejected(AuditStoreError),
}

/// Retry bounds for audit writes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }
}

/// Appends redacted entries to an [`AuditSink`].
///
/// A persistent write failure is never swallowed: it is logged at `error`
/// under the `taxguard::audit` target, counted, and returned to the caller.
#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    retry: RetryPolicy,
    persistent_failures: Arc<AtomicU64>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            retry: RetryPolicy::default(),
            persistent_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Writes that failed after every retry since process start.
    pub fn persistent_failures(&self) -> u64 {
        self.persistent_failures.load(Ordering::Relaxed)
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    pub async fn record(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        self.record_at(event, Utc::now()).await
    }

    pub async fn record_at(&self, event: AuditEvent, now: DateTime<Utc>) -> Result<AuditEntry, AuditError> {
        let payload = redact(&event.payload);
        let pending = PendingEntry::new(event, payload, now);
        let action = pending.action.clone();
        let tag = pending.tag;

        let result = (|| async { self.sink.append(pending.clone()).await })
            .retry(self.retry.backoff())
            .when(AuditStoreError::is_retryable)
            .notify(|err: &AuditStoreError, delay: Duration| {
                warn!(target: "taxguard::audit", error = %err, ?delay, "audit write failed; retrying");
            })
            .await;

        match result {
            Ok(entry) => Ok(entry),
            Err(err) => {
                let total = self.persistent_failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(
                    target: "taxguard::audit",
                    action = %action,
                    tag = tag.as_str(),
                    error = %err,
                    persistent_failures = total,
                    "audit write failed permanently"
                );
                if err.is_retryable() {
                    Err(AuditError::Unavailable {
                        attempts: self.retry.max_retries + 1,
                        source: err,
                    })
                } else {
                    Err(AuditError::Rejected(err))
                }
            }
        }
    }

    /// Append a correction that references `original`. The original is untouched.
    pub async fn record_correction(
        &self,
        original: AuditEntryId,
        actor: AuditActor,
        reason: impl Into<String>,
        payload: Value,
    ) -> Result<AuditEntry, AuditError> {
        let mut event = AuditEvent::new(actor, "audit.correction", AuditOutcome::Succeeded)
            .with_tag(AuditTag::Correction)
            .with_payload(serde_json::json!({
                "reason": reason.into(),
                "details": payload,
            }));
        event.corrects = Some(original);
        self.record(event).await
    }
}
