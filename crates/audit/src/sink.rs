use std::sync::Arc;

use thiserror::Error;

use crate::{AuditEntry, PendingEntry};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditStoreError {
    /// Transient: the store could not be reached or the write timed out.
    #[error("audit store unavailable: {0}")]
    Unavailable(String),

    /// Permanent: the store refused the entry (constraint, encoding).
    #[error("audit store rejected entry: {0}")]
    Rejected(String),
}

impl AuditStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuditStoreError::Unavailable(_))
    }
}

/// Append-only audit storage.
///
/// There is no update or delete method. Implementations must assign
/// `sequence` and `previous_hash` atomically with the insert.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: PendingEntry) -> Result<AuditEntry, AuditStoreError>;

    /// Entries in sequence order, starting after `after_sequence`.
    async fn read_from(&self, after_sequence: u64, limit: usize) -> Result<Vec<AuditEntry>, AuditStoreError>;
}

#[async_trait::async_trait]
impl<S> AuditSink for Arc<S>
where
    S: AuditSink + ?Sized,
{
    async fn append(&self, entry: PendingEntry) -> Result<AuditEntry, AuditStoreError> {
        (**self).append(entry).await
    }

    async fn read_from(&self, after_sequence: u64, limit: usize) -> Result<Vec<AuditEntry>, AuditStoreError> {
        (**self).read_from(after_sequence, limit).await
    }
}
