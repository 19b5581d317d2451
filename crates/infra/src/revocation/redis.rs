use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tracing::instrument;

use taxguard_auth::{RevocationError, RevocationList};
use taxguard_core::TokenId;

use super::revocation_key;

/// Revocation set in Redis: one key per token id, expiring with the token.
#[derive(Clone)]
pub struct RedisRevocationList {
    conn: MultiplexedConnection,
}

impl RedisRevocationList {
    pub async fn connect(redis_url: &str) -> Result<Self, RevocationError> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl RevocationList for RedisRevocationList {
    #[instrument(skip(self, token_id), fields(token_id = %token_id), err)]
    async fn is_revoked(&self, token_id: TokenId) -> Result<bool, RevocationError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(revocation_key(&token_id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(exists)
    }

    #[instrument(skip(self, token_id), fields(token_id = %token_id), err)]
    async fn revoke(&self, token_id: TokenId, expires_at: DateTime<Utc>) -> Result<(), RevocationError> {
        let ttl_ms = (expires_at - Utc::now()).num_milliseconds();
        if ttl_ms <= 0 {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(revocation_key(&token_id))
            .arg(1)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

fn map_redis_error(err: redis::RedisError) -> RevocationError {
    RevocationError::Unavailable(format!("redis: {err}"))
}
