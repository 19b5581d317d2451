//! Redis-backed counters.
//!
//! The increment and the expiry are one Lua script so two near-simultaneous
//! requests can never both observe the pre-increment value.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::instrument;

use super::{CounterError, CounterStore};

const INCREMENT_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
    increment: redis::Script,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self, CounterError> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            increment: redis::Script::new(INCREMENT_WITH_EXPIRY),
        }
    }

    /// Handle to the shared multiplexed connection (e.g. for the revocation set).
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait::async_trait]
impl CounterStore for RedisCounterStore {
    #[instrument(skip(self, key), err)]
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterError> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let count: u64 = self
            .increment
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(count)
    }

    #[instrument(skip(self, key), err)]
    async fn current(&self, key: &str) -> Result<u64, CounterError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(count.unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

pub(crate) fn map_redis_error(err: redis::RedisError) -> CounterError {
    CounterError::Unavailable(format!("redis: {err}"))
}
