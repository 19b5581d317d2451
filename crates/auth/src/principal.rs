use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taxguard_core::{ActorKind, StaffId, UserId};

use crate::StaffRole;

/// The authenticated actor making a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    EndUser { id: UserId },
    Staff { id: StaffId, role: StaffRole },
}

impl Principal {
    pub fn end_user(id: UserId) -> Self {
        Principal::EndUser { id }
    }

    pub fn staff(id: StaffId, role: StaffRole) -> Self {
        Principal::Staff { id, role }
    }

    /// Actor kind used by the transition tables.
    pub fn actor_kind(&self) -> ActorKind {
        match self {
            Principal::EndUser { .. } => ActorKind::EndUser,
            Principal::Staff { .. } => ActorKind::Staff,
        }
    }

    pub fn is_super(&self) -> bool {
        matches!(
            self,
            Principal::Staff {
                role: StaffRole::Super,
                ..
            }
        )
    }

    pub fn as_end_user(&self) -> Option<UserId> {
        match self {
            Principal::EndUser { id } => Some(*id),
            Principal::Staff { .. } => None,
        }
    }

    pub fn as_staff(&self) -> Option<StaffId> {
        match self {
            Principal::Staff { id, .. } => Some(*id),
            Principal::EndUser { .. } => None,
        }
    }

    /// Raw subject identifier (the token's `sub`).
    pub fn subject(&self) -> Uuid {
        match self {
            Principal::EndUser { id } => *id.as_uuid(),
            Principal::Staff { id, .. } => *id.as_uuid(),
        }
    }
}

impl core::fmt::Display for Principal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Principal::EndUser { id } => write!(f, "end_user:{id}"),
            Principal::Staff { id, role } => write!(f, "staff({role}):{id}"),
        }
    }
}
