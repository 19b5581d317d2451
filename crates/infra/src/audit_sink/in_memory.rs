use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use taxguard_audit::{AuditEntry, AuditSink, AuditStoreError, PendingEntry};

/// In-memory append-only audit sink.
///
/// Intended for tests/dev. `set_available(false)` simulates an outage.
#[derive(Debug)]
pub struct InMemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
    available: AtomicBool,
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of every entry in sequence order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: PendingEntry) -> Result<AuditEntry, AuditStoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AuditStoreError::Unavailable("audit store offline".to_string()));
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AuditStoreError::Unavailable("lock poisoned".to_string()))?;

        let previous = entries.last().map(|e| (e.sequence, e.hash.clone()));
        let sequence = previous.as_ref().map(|(s, _)| s + 1).unwrap_or(1);
        let sealed = entry.seal(sequence, previous.map(|(_, h)| h));
        entries.push(sealed.clone());
        Ok(sealed)
    }

    async fn read_from(&self, after_sequence: u64, limit: usize) -> Result<Vec<AuditEntry>, AuditStoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| AuditStoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(entries
            .iter()
            .filter(|e| e.sequence > after_sequence)
            .take(limit)
            .cloned()
            .collect())
    }
}
