use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use taxguard_core::TokenId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RevocationError {
    /// The revocation store could not be reached. Callers treat this as "revoked".
    #[error("revocation store unavailable: {0}")]
    Unavailable(String),
}

/// Set of revoked token ids, shared across instances.
///
/// Entries only need to live until the token's natural expiry; after that the
/// time-window check rejects the token anyway.
#[async_trait::async_trait]
pub trait RevocationList: Send + Sync {
    async fn is_revoked(&self, token_id: TokenId) -> Result<bool, RevocationError>;

    async fn revoke(&self, token_id: TokenId, expires_at: DateTime<Utc>) -> Result<(), RevocationError>;
}

#[async_trait::async_trait]
impl<R> RevocationList for Arc<R>
where
    R: RevocationList + ?Sized,
{
    async fn is_revoked(&self, token_id: TokenId) -> Result<bool, RevocationError> {
        (**self).is_revoked(token_id).await
    }

    async fn revoke(&self, token_id: TokenId, expires_at: DateTime<Utc>) -> Result<(), RevocationError> {
        (**self).revoke(token_id, expires_at).await
    }
}
