//! Actor kinds recognised by the lifecycle transition tables.

use serde::{Deserialize, Serialize};

/// The class of actor triggering a state change.
///
/// Transition tables are written in terms of actor *kinds*; the concrete
/// principal (and whether a staff member is super staff) is resolved by the
/// auth layer before a transition is attempted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    EndUser,
    Staff,
    /// The service itself (e.g. a payment record landing, automatic review intake).
    System,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::EndUser => "end_user",
            ActorKind::Staff => "staff",
            ActorKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "end_user" => Some(ActorKind::EndUser),
            "staff" => Some(ActorKind::Staff),
            "system" => Some(ActorKind::System),
            _ => None,
        }
    }
}

impl core::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
