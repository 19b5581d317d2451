use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use taxguard_core::{StaffId, TokenId, UserId};

use crate::{Principal, StaffRole};

/// Whether the token's subject is a client or a staff member.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    EndUser,
    Staff,
}

/// Session token claims (transport-agnostic).
///
/// Timestamps are encoded as unix seconds so the token stays a standard JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject identifier (a `UserId` or `StaffId`, depending on `kind`).
    pub sub: Uuid,

    pub kind: SubjectKind,

    /// Present only for staff tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff_role: Option<StaffRole>,

    /// Token identifier; the unit of revocation.
    pub jti: TokenId,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub iat: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub exp: DateTime<Utc>,
}

impl SessionClaims {
    /// Claims for `principal`, valid from `now` for `ttl`.
    ///
    /// `None` when `now + ttl` is past the representable range.
    pub fn for_principal(principal: &Principal, now: DateTime<Utc>, ttl: chrono::Duration) -> Option<Self> {
        let (kind, staff_role) = match principal {
            Principal::EndUser { .. } => (SubjectKind::EndUser, None),
            Principal::Staff { role, .. } => (SubjectKind::Staff, Some(*role)),
        };

        let exp = now.checked_add_signed(ttl)?;

        Some(Self {
            sub: principal.subject(),
            kind,
            staff_role,
            jti: TokenId::new(),
            iat: now,
            exp,
        })
    }

    /// Resolve the principal the claims describe.
    pub fn principal(&self) -> Result<Principal, TokenValidationError> {
        match (self.kind, self.staff_role) {
            (SubjectKind::EndUser, None) => Ok(Principal::end_user(UserId::from_uuid(self.sub))),
            (SubjectKind::Staff, Some(role)) => {
                Ok(Principal::staff(StaffId::from_uuid(self.sub), role))
            }
            (SubjectKind::EndUser, Some(_)) => Err(TokenValidationError::Malformed(
                "end-user token carries a staff role".to_string(),
            )),
            (SubjectKind::Staff, None) => Err(TokenValidationError::Malformed(
                "staff token without a role".to_string(),
            )),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token signature is invalid")]
    BadSignature,

    #[error("token is malformed: {0}")]
    Malformed(String),

    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (iat is in the future)")]
    NotYetValid,

    #[error("invalid token time window (exp <= iat)")]
    InvalidTimeWindow,
}

/// Deterministically validate the claim time window against `now`.
///
/// Signature verification happens before this, in [`crate::TokenVerifier`].
pub fn validate_claims(claims: &SessionClaims, now: DateTime<Utc>) -> Result<(), TokenValidationError> {
    if claims.exp <= claims.iat {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.iat {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}
