use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use taxguard_auth::{RevocationError, RevocationList};
use taxguard_core::TokenId;

/// In-process revocation set. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRevocationList {
    revoked: RwLock<HashMap<TokenId, DateTime<Utc>>>,
}

impl InMemoryRevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.revoked.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl RevocationList for InMemoryRevocationList {
    async fn is_revoked(&self, token_id: TokenId) -> Result<bool, RevocationError> {
        let revoked = self
            .revoked
            .read()
            .map_err(|_| RevocationError::Unavailable("lock poisoned".to_string()))?;
        Ok(revoked.contains_key(&token_id))
    }

    async fn revoke(&self, token_id: TokenId, expires_at: DateTime<Utc>) -> Result<(), RevocationError> {
        let now = Utc::now();
        let mut revoked = self
            .revoked
            .write()
            .map_err(|_| RevocationError::Unavailable("lock poisoned".to_string()))?;
        // expired tokens are rejected by the time-window check already
        revoked.retain(|_, exp| *exp > now);
        revoked.insert(token_id, expires_at);
        Ok(())
    }
}
