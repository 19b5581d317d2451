//! Lifecycle error model.
//!
//! Every variant is deterministic and carries a machine-readable `reason()`
//! plus the offending `field()` so API layers can report it verbatim.

use serde::Serialize;
use thiserror::Error;

use taxguard_core::{ActorKind, EntityKind};

/// Rejection of a status change by a transition table.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TransitionError {
    #[error("no such edge: {entity} '{from}' -> '{to}'")]
    NoSuchEdge {
        entity: EntityKind,
        from: &'static str,
        to: &'static str,
    },

    #[error("{actor} may not move {entity} '{from}' -> '{to}'")]
    WrongActor {
        entity: EntityKind,
        from: &'static str,
        to: &'static str,
        actor: ActorKind,
    },
}

impl TransitionError {
    pub fn reason(&self) -> &'static str {
        match self {
            TransitionError::NoSuchEdge { .. } => "no_such_edge",
            TransitionError::WrongActor { .. } => "wrong_actor",
        }
    }
}

/// A conditional sub-section required by a true-valued flag is missing.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[error("section '{field}' is required when '{flag}' is {flag_value}")]
pub struct ValidationFailure {
    /// The first missing section key (the offending field).
    pub field: String,
    /// The flag that made it required.
    pub flag: String,
    pub flag_value: bool,
    /// Every missing section key, in table order.
    pub missing: Vec<String>,
}

/// Any rejection raised by lifecycle entities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    /// Content fields are read-only outside the draft state, or to this actor.
    #[error("{entity} content is read-only ({detail})")]
    ContentLocked { entity: EntityKind, detail: String },

    /// Archived rows are history; they accept no further changes.
    #[error("{entity} is archived")]
    Archived { entity: EntityKind },

    #[error("override requires a non-empty reason")]
    OverrideReasonRequired,

    #[error("{entity} is already in status '{status}'")]
    AlreadyInStatus {
        entity: EntityKind,
        status: &'static str,
    },

    #[error("invalid input: {field}: {message}")]
    InvalidInput { field: &'static str, message: String },
}

impl LifecycleError {
    pub fn reason(&self) -> &'static str {
        match self {
            LifecycleError::Transition(e) => e.reason(),
            LifecycleError::Validation(_) => "missing_required_section",
            LifecycleError::ContentLocked { .. } => "content_locked",
            LifecycleError::Archived { .. } => "archived",
            LifecycleError::OverrideReasonRequired => "override_reason_required",
            LifecycleError::AlreadyInStatus { .. } => "already_in_status",
            LifecycleError::InvalidInput { .. } => "invalid_input",
        }
    }

    pub fn field(&self) -> String {
        match self {
            LifecycleError::Transition(_)
            | LifecycleError::Archived { .. }
            | LifecycleError::AlreadyInStatus { .. } => "status".to_string(),
            LifecycleError::Validation(v) => v.field.clone(),
            LifecycleError::ContentLocked { .. } => "data".to_string(),
            LifecycleError::OverrideReasonRequired => "reason".to_string(),
            LifecycleError::InvalidInput { field, .. } => field.to_string(),
        }
    }
}
