//! Token validation plus revocation check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use taxguard_core::TokenId;

use crate::{Principal, RevocationError, RevocationList, TokenValidationError, TokenVerifier};

/// Why a bearer token was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthenticationFailure {
    #[error("missing bearer token")]
    MissingToken,

    #[error(transparent)]
    InvalidToken(#[from] TokenValidationError),

    #[error("token has been revoked")]
    Revoked,

    /// The revocation set could not be consulted; the token is rejected.
    #[error("revocation check unavailable")]
    RevocationUnavailable,
}

impl AuthenticationFailure {
    /// Stable, non-enumerating reason code for audit payloads.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthenticationFailure::MissingToken => "missing_token",
            AuthenticationFailure::InvalidToken(TokenValidationError::Expired) => "expired",
            AuthenticationFailure::InvalidToken(TokenValidationError::NotYetValid) => "not_yet_valid",
            AuthenticationFailure::InvalidToken(_) => "invalid_token",
            AuthenticationFailure::Revoked => "revoked",
            AuthenticationFailure::RevocationUnavailable => "revocation_unavailable",
        }
    }
}

/// An authenticated session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Session {
    pub principal: Principal,
    pub token_id: TokenId,
    pub expires_at: DateTime<Utc>,
}

/// Signature check, time-window check, then revocation check.
#[derive(Clone)]
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
    revocations: Arc<dyn RevocationList>,
}

impl Authenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>, revocations: Arc<dyn RevocationList>) -> Self {
        Self {
            verifier,
            revocations,
        }
    }

    pub async fn authenticate(&self, token: &str, now: DateTime<Utc>) -> Result<Principal, AuthenticationFailure> {
        Ok(self.session(token, now).await?.principal)
    }

    /// Like [`Authenticator::authenticate`], keeping the token id for logout.
    pub async fn session(&self, token: &str, now: DateTime<Utc>) -> Result<Session, AuthenticationFailure> {
        let claims = self.verifier.verify(token, now)?;
        let principal = claims.principal()?;

        match self.revocations.is_revoked(claims.jti).await {
            Ok(false) => {}
            Ok(true) => return Err(AuthenticationFailure::Revoked),
            Err(RevocationError::Unavailable(msg)) => {
                warn!(token_id = %claims.jti, error = %msg, "revocation check failed; rejecting token");
                return Err(AuthenticationFailure::RevocationUnavailable);
            }
        }

        Ok(Session {
            principal,
            token_id: claims.jti,
            expires_at: claims.exp,
        })
    }

    /// Revoke the session's token until its natural expiry.
    pub async fn logout(&self, session: &Session) -> Result<(), RevocationError> {
        self.revocations
            .revoke(session.token_id, session.expires_at)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hs256TokenVerifier, TokenIssuer};
    use chrono::Duration;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use taxguard_core::UserId;

    const SECRET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    #[derive(Default)]
    struct FakeRevocations {
        revoked: Mutex<HashSet<TokenId>>,
        down: bool,
    }

    #[async_trait::async_trait]
    impl RevocationList for FakeRevocations {
        async fn is_revoked(&self, token_id: TokenId) -> Result<bool, RevocationError> {
            if self.down {
                return Err(RevocationError::Unavailable("connection refused".into()));
            }
            Ok(self.revoked.lock().unwrap().contains(&token_id))
        }

        async fn revoke(&self, token_id: TokenId, _expires_at: DateTime<Utc>) -> Result<(), RevocationError> {
            self.revoked.lock().unwrap().insert(token_id);
            Ok(())
        }
    }

    fn authenticator(revocations: FakeRevocations) -> Authenticator {
        Authenticator::new(Arc::new(Hs256TokenVerifier::new(SECRET)), Arc::new(revocations))
    }

    fn token(now: DateTime<Utc>) -> (Principal, String) {
        let principal = Principal::end_user(UserId::new());
        let issued = TokenIssuer::new(SECRET, Duration::minutes(10))
            .issue(&principal, now)
            .unwrap();
        (principal, issued.token)
    }

    #[tokio::test]
    async fn valid_token_resolves_principal() {
        let now = Utc::now();
        let (principal, token) = token(now);
        let auth = authenticator(FakeRevocations::default());
        assert_eq!(auth.authenticate(&token, now).await.unwrap(), principal);
    }

    #[tokio::test]
    async fn logout_revokes_the_token() {
        let now = Utc::now();
        let (_, token) = token(now);
        let auth = authenticator(FakeRevocations::default());

        let session = auth.session(&token, now).await.unwrap();
        auth.logout(&session).await.unwrap();

        assert_eq!(
            auth.authenticate(&token, now).await,
            Err(AuthenticationFailure::Revoked)
        );
    }

    #[tokio::test]
    async fn unreachable_revocation_store_fails_closed() {
        let now = Utc::now();
        let (_, token) = token(now);
        let auth = authenticator(FakeRevocations {
            down: true,
            ..Default::default()
        });

        let err = auth.authenticate(&token, now).await.unwrap_err();
        assert_eq!(err, AuthenticationFailure::RevocationUnavailable);
        assert_eq!(err.reason(), "revocation_unavailable");
    }

    #[tokio::test]
    async fn expired_token_never_reaches_the_revocation_store() {
        let now = Utc::now();
        let (_, token) = token(now);
        // a down store would turn any lookup into RevocationUnavailable
        let auth = authenticator(FakeRevocations {
            down: true,
            ..Default::default()
        });

        let err = auth
            .authenticate(&token, now + Duration::hours(1))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "expired");
    }
}
