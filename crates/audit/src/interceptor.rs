//! The single audit interception point for mutating operations.

use std::future::Future;

use serde_json::Value;

use crate::{AuditActor, AuditError, AuditEvent, AuditOutcome, AuditRecorder, AuditTag, AuditTarget};

/// Errors that know how they should appear in the audit trail.
pub trait AuditableError: core::fmt::Display {
    fn audit_outcome(&self) -> AuditOutcome;
}

/// Description of the operation being observed.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub actor: AuditActor,
    pub action: String,
    pub target: Option<AuditTarget>,
    pub tag: AuditTag,
    /// Request snapshot; redacted before persistence.
    pub payload: Value,
}

impl Observed {
    pub fn new(actor: AuditActor, action: impl Into<String>) -> Self {
        Self {
            actor,
            action: action.into(),
            target: None,
            tag: AuditTag::Standard,
            payload: Value::Null,
        }
    }

    pub fn target(mut self, target: AuditTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn tag(mut self, tag: AuditTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Failure of an observed operation.
#[derive(Debug)]
pub enum ObservedError<E> {
    /// The operation itself failed; its outcome was recorded.
    Operation(E),
    /// The operation succeeded but its audit entry could not be written.
    Audit(AuditError),
}

impl<E: core::fmt::Display> core::fmt::Display for ObservedError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ObservedError::Operation(e) => e.fmt(f),
            ObservedError::Audit(e) => e.fmt(f),
        }
    }
}

impl<E> std::error::Error for ObservedError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ObservedError::Operation(e) => Some(e),
            ObservedError::Audit(e) => Some(e),
        }
    }
}

impl AuditRecorder {
    /// Await `op` and record exactly one entry for its outcome.
    pub async fn observe<T, E, Fut>(&self, observed: Observed, op: Fut) -> Result<T, ObservedError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: AuditableError,
    {
        self.observe_with(observed, op, |_, _| {}).await
    }

    /// Like [`AuditRecorder::observe`]; `describe` may refine the entry from the
    /// successful result (e.g. the id of a newly created row).
    pub async fn observe_with<T, E, Fut, D>(
        &self,
        mut observed: Observed,
        op: Fut,
        describe: D,
    ) -> Result<T, ObservedError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: AuditableError,
        D: FnOnce(&T, &mut Observed),
    {
        let result = op.await;

        let outcome = match &result {
            Ok(value) => {
                describe(value, &mut observed);
                AuditOutcome::Succeeded
            }
            Err(e) => e.audit_outcome(),
        };

        let mut event = AuditEvent::new(observed.actor, observed.action, outcome)
            .with_tag(observed.tag)
            .with_payload(observed.payload);
        event.target = observed.target;

        let recorded = self.record(event).await;

        match (result, recorded) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(audit)) => Err(ObservedError::Audit(audit)),
            // the recorder already logged and counted the audit failure
            (Err(e), _) => Err(ObservedError::Operation(e)),
        }
    }
}
