//! HS256 session token signing and verification.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use thiserror::Error;

use crate::{Principal, SessionClaims, TokenValidationError, validate_claims};

/// Verifies a raw bearer token and returns its validated claims.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, TokenValidationError>;
}

/// HMAC-SHA256 verifier.
///
/// The library's own clock checks are disabled; the time window is validated
/// against the caller-supplied `now` by [`validate_claims`].
pub struct Hs256TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.required_spec_claims = HashSet::new();

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl TokenVerifier for Hs256TokenVerifier {
    fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims, TokenValidationError> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenValidationError::BadSignature
                }
                other => TokenValidationError::Malformed(format!("{other:?}")),
            })?;

        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to sign session token: {0}")]
pub struct TokenIssueError(String);

/// A freshly signed token and the claims inside it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: SessionClaims,
}

/// Signs HS256 session tokens.
pub struct TokenIssuer {
    key: EncodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn issue(&self, principal: &Principal, now: DateTime<Utc>) -> Result<IssuedToken, TokenIssueError> {
        let claims = SessionClaims::for_principal(principal, now, self.ttl)
            .ok_or_else(|| TokenIssueError(format!("lifetime {} overflows the clock", self.ttl)))?;
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| TokenIssueError(e.to_string()))?;
        Ok(IssuedToken { token, claims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaffRole;
    use taxguard_core::{StaffId, UserId};

    const SECRET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    #[test]
    fn issued_tokens_verify_and_resolve_the_principal() {
        let now = Utc::now();
        let principal = Principal::staff(StaffId::new(), StaffRole::Standard);
        let issued = TokenIssuer::new(SECRET, Duration::minutes(5))
            .issue(&principal, now)
            .unwrap();

        let claims = Hs256TokenVerifier::new(SECRET)
            .verify(&issued.token, now + Duration::seconds(1))
            .unwrap();
        assert_eq!(claims.jti, issued.claims.jti);
        assert_eq!(claims.principal().unwrap(), principal);
    }

    #[test]
    fn oversized_lifetime_is_an_error_not_a_panic() {
        let ttl = Duration::from_std(std::time::Duration::from_secs(9_000_000_000_000)).unwrap();
        let err = TokenIssuer::new(SECRET, ttl)
            .issue(&Principal::end_user(UserId::new()), Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn wrong_secret_is_a_bad_signature() {
        let now = Utc::now();
        let issued = TokenIssuer::new(SECRET, Duration::minutes(5))
            .issue(&Principal::end_user(UserId::new()), now)
            .unwrap();

        let err = Hs256TokenVerifier::new(b"a-completely-different-secret-value!")
            .verify(&issued.token, now)
            .unwrap_err();
        assert_eq!(err, TokenValidationError::BadSignature);
    }

    #[test]
    fn expiry_is_judged_against_the_supplied_clock() {
        let now = Utc::now();
        let issued = TokenIssuer::new(SECRET, Duration::minutes(5))
            .issue(&Principal::end_user(UserId::new()), now)
            .unwrap();

        let err = Hs256TokenVerifier::new(SECRET)
            .verify(&issued.token, now + Duration::minutes(6))
            .unwrap_err();
        assert_eq!(err, TokenValidationError::Expired);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = Hs256TokenVerifier::new(SECRET)
            .verify("not.a.jwt", Utc::now())
            .unwrap_err();
        assert!(matches!(err, TokenValidationError::Malformed(_)));
    }
}
