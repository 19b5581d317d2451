use std::collections::BTreeSet;
use std::str::FromStr;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxguard_core::{StaffId, TokenId};
use taxguard_lifecycle::Status;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub identity: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub identity: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateEngagementRequest {
    pub filing_year: i32,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub to: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct AssignmentRequest {
    #[serde(default)]
    pub add: BTreeSet<StaffId>,
    #[serde(default)]
    pub remove: BTreeSet<StaffId>,
}

#[derive(Debug, Deserialize)]
pub struct RequestDocumentRequest {
    pub label: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub content_digest: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub token_id: TokenId,
    pub expires_at: DateTime<Utc>,
}

// -------------------------
// Parsing helpers
// -------------------------

/// Parse a path identifier. Malformed ids are indistinguishable from missing ones.
pub fn parse_id<T: FromStr>(raw: &str) -> Result<T, axum::response::Response> {
    raw.parse::<T>()
        .map_err(|_| errors::json_error(StatusCode::NOT_FOUND, "not_found", "not found"))
}

pub fn parse_status<S: Status>(raw: &str) -> Result<S, axum::response::Response> {
    S::parse(raw.trim()).ok_or_else(|| {
        errors::json_error_with_field(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_status",
            format!("unknown status '{raw}'"),
            "to",
        )
    })
}
