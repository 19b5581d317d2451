//! Rate-gated authentication flows: login, one-time-code request, logout.
//!
//! Credential checks and code delivery belong to external systems and sit
//! behind [`CredentialVerifier`] and [`OtpSender`]. This module only adds the
//! throttling, token issuance and auditing around them.
//!
//! Login ordering:
//!
//! ```text
//! ensure_not_locked(identity, origin)   -- locked identities never reach the verifier
//!   ↓
//! verifier.verify(identity, secret)
//!   ├─ ok      → issue token
//!   └─ refused → check_and_consume(FailedLogin) → InvalidCredentials
//! ```
//!
//! Every failure is audited under the `authentication_failure` tag.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use taxguard_audit::{
    AuditActor, AuditError, AuditOutcome, AuditRecorder, AuditTag, AuditableError, Observed, ObservedError,
};
use taxguard_auth::{AuthenticationFailure, Authenticator, IssuedToken, Principal, TokenIssuer};

use crate::dispatcher::audit_actor;
use crate::rate_limit::{ActionClass, RateLimited, RateLimiter};

pub const LOGIN: &str = "auth.login";
pub const OTP_REQUEST: &str = "auth.otp_request";
pub const LOGOUT: &str = "auth.logout";
pub const AUTHENTICATE: &str = "auth.authenticate";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// External user store.
#[async_trait::async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Ok(None)` when the identity is unknown or the secret is wrong; the two
    /// are not distinguished.
    async fn verify(&self, identity: &str, secret: &str) -> Result<Option<Principal>, CredentialError>;
}

#[async_trait::async_trait]
impl<V> CredentialVerifier for Arc<V>
where
    V: CredentialVerifier + ?Sized,
{
    async fn verify(&self, identity: &str, secret: &str) -> Result<Option<Principal>, CredentialError> {
        (**self).verify(identity, secret).await
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OtpError {
    #[error("one-time code delivery failed: {0}")]
    Delivery(String),
}

/// External one-time-code delivery (SMS, e-mail).
#[async_trait::async_trait]
pub trait OtpSender: Send + Sync {
    async fn send(&self, identity: &str) -> Result<(), OtpError>;
}

/// Fixed identity → (secret, principal) table.
///
/// Intended for tests/dev.
#[derive(Default)]
pub struct StaticCredentials {
    users: HashMap<String, (String, Principal)>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, identity: &str, secret: &str, principal: Principal) -> Self {
        self.users
            .insert(identity.trim().to_lowercase(), (secret.to_string(), principal));
        self
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait::async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, identity: &str, secret: &str) -> Result<Option<Principal>, CredentialError> {
        Ok(self
            .users
            .get(&identity.trim().to_lowercase())
            .filter(|(expected, _)| constant_time_eq(expected.as_bytes(), secret.as_bytes()))
            .map(|(_, principal)| *principal))
    }
}

/// Used when no user store is wired in; every login is refused as unavailable.
#[derive(Debug, Default)]
pub struct UnconfiguredCredentials;

#[async_trait::async_trait]
impl CredentialVerifier for UnconfiguredCredentials {
    async fn verify(&self, _identity: &str, _secret: &str) -> Result<Option<Principal>, CredentialError> {
        Err(CredentialError::Unavailable("no credential store configured".to_string()))
    }
}

/// Logs the dispatch and delivers nothing.
#[derive(Debug, Default)]
pub struct LoggingOtpSender;

#[async_trait::async_trait]
impl OtpSender for LoggingOtpSender {
    async fn send(&self, _identity: &str) -> Result<(), OtpError> {
        info!("one-time code dispatch requested");
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthFlowError {
    #[error(transparent)]
    RateLimited(RateLimited),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error(transparent)]
    Unauthenticated(AuthenticationFailure),

    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Audit(AuditError),
}

impl AuditableError for AuthFlowError {
    fn audit_outcome(&self) -> AuditOutcome {
        match self {
            AuthFlowError::RateLimited(_) => AuditOutcome::denied("rate_limited"),
            AuthFlowError::InvalidCredentials => AuditOutcome::denied("invalid_credentials"),
            AuthFlowError::Unauthenticated(f) => AuditOutcome::denied(f.reason()),
            AuthFlowError::Unavailable(_) => AuditOutcome::failed("backend_unavailable"),
            AuthFlowError::Audit(_) => AuditOutcome::failed("audit_unavailable"),
        }
    }
}

impl From<ObservedError<AuthFlowError>> for AuthFlowError {
    fn from(value: ObservedError<AuthFlowError>) -> Self {
        match value {
            ObservedError::Operation(e) => e,
            ObservedError::Audit(e) => AuthFlowError::Audit(e),
        }
    }
}

/// Record a rejected bearer token. Used by the HTTP authentication layer.
pub async fn record_authentication_failure(
    audit: &AuditRecorder,
    failure: &AuthenticationFailure,
    origin: &str,
) -> Result<(), AuditError> {
    let observed = Observed::new(AuditActor::Anonymous { identity: None }, AUTHENTICATE)
        .tag(AuditTag::AuthenticationFailure)
        .payload(json!({ "origin": origin }));
    let failure = AuthFlowError::Unauthenticated(failure.clone());

    match audit.observe::<(), _, _>(observed, async { Err(failure) }).await {
        Err(ObservedError::Audit(e)) => Err(e),
        _ => Ok(()),
    }
}

#[derive(Clone)]
pub struct AuthFlows {
    limiter: RateLimiter,
    verifier: Arc<dyn CredentialVerifier>,
    otp: Arc<dyn OtpSender>,
    issuer: Arc<TokenIssuer>,
    authenticator: Authenticator,
    audit: AuditRecorder,
}

impl AuthFlows {
    pub fn new(
        limiter: RateLimiter,
        verifier: Arc<dyn CredentialVerifier>,
        otp: Arc<dyn OtpSender>,
        issuer: Arc<TokenIssuer>,
        authenticator: Authenticator,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            limiter,
            verifier,
            otp,
            issuer,
            authenticator,
            audit,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// Exchange credentials for a session token.
    pub async fn login(
        &self,
        identity: &str,
        secret: &str,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, AuthFlowError> {
        let observed = Observed::new(
            AuditActor::Anonymous {
                identity: Some(identity.trim().to_lowercase()),
            },
            LOGIN,
        )
        .tag(AuditTag::AuthenticationFailure)
        .payload(json!({ "origin": origin }));

        let attempt = async {
            self.limiter
                .ensure_not_locked(Some(identity), origin, ActionClass::FailedLogin, now)
                .await
                .map_err(AuthFlowError::RateLimited)?;

            let verified = self
                .verifier
                .verify(identity, secret)
                .await
                .map_err(|e| AuthFlowError::Unavailable(e.to_string()))?;

            let Some(principal) = verified else {
                if let Err(limited) = self
                    .limiter
                    .check_and_consume(Some(identity), origin, ActionClass::FailedLogin, now)
                    .await
                {
                    warn!(retry_after_secs = limited.retry_after_secs(), "failed-login quota exhausted");
                }
                return Err(AuthFlowError::InvalidCredentials);
            };

            self.issuer
                .issue(&principal, now)
                .map_err(|e| AuthFlowError::Unavailable(e.to_string()))
        };

        let issued = self
            .audit
            .observe_with(observed, attempt, |issued: &IssuedToken, o: &mut Observed| {
                o.tag = AuditTag::Standard;
                if let Ok(principal) = issued.claims.principal() {
                    o.actor = audit_actor(&principal);
                }
                o.payload["token_id"] = json!(issued.claims.jti);
            })
            .await?;

        info!(token_id = %issued.claims.jti, "session issued");
        Ok(issued)
    }

    /// Ask the external sender to deliver a one-time code.
    pub async fn request_otp(&self, identity: &str, origin: &str, now: DateTime<Utc>) -> Result<(), AuthFlowError> {
        let observed = Observed::new(
            AuditActor::Anonymous {
                identity: Some(identity.trim().to_lowercase()),
            },
            OTP_REQUEST,
        )
        .payload(json!({ "origin": origin }));

        let attempt = async {
            self.limiter
                .check_and_consume(Some(identity), origin, ActionClass::OtpRequest, now)
                .await
                .map_err(AuthFlowError::RateLimited)?;

            self.otp
                .send(identity)
                .await
                .map_err(|e| AuthFlowError::Unavailable(e.to_string()))
        };

        Ok(self.audit.observe(observed, attempt).await?)
    }

    /// Revoke the presented token until its natural expiry.
    pub async fn logout(&self, token: &str, origin: &str, now: DateTime<Utc>) -> Result<(), AuthFlowError> {
        let session = match self.authenticator.session(token, now).await {
            Ok(session) => session,
            Err(failure) => {
                record_authentication_failure(&self.audit, &failure, origin)
                    .await
                    .map_err(AuthFlowError::Audit)?;
                return Err(AuthFlowError::Unauthenticated(failure));
            }
        };

        let observed = Observed::new(audit_actor(&session.principal), LOGOUT)
            .payload(json!({ "token_id": session.token_id, "origin": origin }));

        let attempt = async {
            self.authenticator
                .logout(&session)
                .await
                .map_err(|e| AuthFlowError::Unavailable(e.to_string()))
        };

        self.audit.observe(observed, attempt).await?;
        info!(token_id = %session.token_id, "session revoked");
        Ok(())
    }
}
