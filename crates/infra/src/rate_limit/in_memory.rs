use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{CounterError, CounterStore};

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

/// In-process counter store.
///
/// Intended for tests/dev and single-instance deployments; counters are not
/// shared across processes. Increments are atomic under the map lock.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Counter>>, CounterError> {
        self.counters
            .lock()
            .map_err(|_| CounterError::Unavailable("lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterError> {
        let now = Instant::now();
        let mut counters = self.lock()?;
        counters.retain(|_, c| c.expires_at > now);

        let counter = counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + ttl,
        });
        counter.count += 1;
        Ok(counter.count)
    }

    async fn current(&self, key: &str) -> Result<u64, CounterError> {
        let now = Instant::now();
        let counters = self.lock()?;
        Ok(counters
            .get(key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.count)
            .unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), CounterError> {
        self.lock().map(|_| ())
    }
}
