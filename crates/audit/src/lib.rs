//! `taxguard-audit`: append-only, redacted, hash-chained audit trail.
//!
//! Every mutating request and every authentication failure goes through
//! [`AuditRecorder::observe`] (or [`AuditRecorder::record`] for events with no
//! wrapped operation). Redaction happens there and nowhere else.

pub mod entry;
pub mod interceptor;
pub mod recorder;
pub mod redact;
pub mod sink;

pub use entry::{
    AuditActor, AuditEntry, AuditEvent, AuditOutcome, AuditTag, AuditTarget, ChainBreak,
    PendingEntry, verify_chain,
};
pub use interceptor::{AuditableError, Observed, ObservedError};
pub use recorder::{AuditError, AuditRecorder, RetryPolicy};
pub use redact::{REDACTED, is_sensitive_key, redact};
pub use sink::{AuditSink, AuditStoreError};
