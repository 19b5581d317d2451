//! Ownership & role guard.
//!
//! Decisions are evaluated in a fixed order:
//!
//! 1. super staff: allowed, returned as [`Grant::SuperStaff`] so the caller
//!    audits it as a privilege escalation;
//! 2. the owning end-user: allowed for end-user actions;
//! 3. standard staff in the engagement's assignment set: allowed for staff actions;
//! 4. anyone else: [`AuthzError::NotFound`], indistinguishable from a missing resource.
//!
//! A *related* principal (owner or assigned staff) asking for an action outside
//! its audience gets [`AuthzError::Forbidden`]; existence is no secret to them.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use taxguard_core::{EngagementId, EntityKind, StaffId, UserId};

use crate::Principal;

/// Who an action is meant for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    EndUser,
    Staff,
    Both,
    /// Only reachable through the super-staff path.
    SuperOnly,
}

/// Guarded operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateEngagement,
    Read,
    TransitionEngagement,
    OverrideEngagementStatus,
    AssignStaff,
    RequestDocument,
    UploadDocument,
    TransitionDocument,
    EditTaxForm,
    SubmitTaxForm,
    TransitionTaxForm,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CreateEngagement => "engagement.create",
            Action::Read => "resource.read",
            Action::TransitionEngagement => "engagement.transition",
            Action::OverrideEngagementStatus => "engagement.override",
            Action::AssignStaff => "engagement.assign_staff",
            Action::RequestDocument => "document.request",
            Action::UploadDocument => "document.upload",
            Action::TransitionDocument => "document.transition",
            Action::EditTaxForm => "tax_form.edit",
            Action::SubmitTaxForm => "tax_form.submit",
            Action::TransitionTaxForm => "tax_form.transition",
        }
    }

    pub fn audience(&self) -> Audience {
        match self {
            Action::CreateEngagement
            | Action::RequestDocument
            | Action::UploadDocument
            | Action::EditTaxForm
            | Action::SubmitTaxForm => Audience::EndUser,
            Action::AssignStaff | Action::TransitionDocument | Action::TransitionTaxForm => {
                Audience::Staff
            }
            // the transition table decides which side may take each edge
            Action::Read | Action::TransitionEngagement => Audience::Both,
            Action::OverrideEngagementStatus => Audience::SuperOnly,
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Action::Read)
    }
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ownership facts about an existing resource, resolved by the caller.
///
/// Documents and tax forms inherit owner and assignment from their engagement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceScope {
    pub kind: EntityKind,
    pub id: Uuid,
    pub engagement_id: EngagementId,
    pub owner: UserId,
    pub assigned_staff: BTreeSet<StaffId>,
}

/// The rule that allowed an action.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grant {
    Owner,
    AssignedStaff,
    /// Allowed through the super-staff path; always audited as an escalation.
    SuperStaff,
}

impl Grant {
    pub fn is_escalation(&self) -> bool {
        matches!(self, Grant::SuperStaff)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// Either the resource does not exist or the caller has no relation to it.
    #[error("not found")]
    NotFound,

    #[error("forbidden: {0}")]
    Forbidden(String),
}

fn audience_admits(audience: Audience, principal: &Principal) -> bool {
    match (audience, principal) {
        (Audience::Both, _) => true,
        (Audience::EndUser, Principal::EndUser { .. }) => true,
        (Audience::Staff, Principal::Staff { .. }) => true,
        _ => false,
    }
}

/// Authorize `principal` to perform `action` on the resource described by `scope`.
///
/// `scope == None` means the resource does not exist.
///
/// - No IO
/// - No panics
pub fn authorize(
    principal: &Principal,
    action: Action,
    scope: Option<&ResourceScope>,
) -> Result<Grant, AuthzError> {
    let Some(scope) = scope else {
        return Err(AuthzError::NotFound);
    };

    if principal.is_super() {
        return Ok(Grant::SuperStaff);
    }

    let grant = match principal {
        Principal::EndUser { id } if *id == scope.owner => Grant::Owner,
        Principal::Staff { id, .. } if scope.assigned_staff.contains(id) => Grant::AssignedStaff,
        _ => return Err(AuthzError::NotFound),
    };

    if !audience_admits(action.audience(), principal) {
        return Err(AuthzError::Forbidden(format!(
            "{} may not perform {}",
            principal.actor_kind(),
            action
        )));
    }

    Ok(grant)
}

/// Authorize an action that targets no existing resource (e.g. creation).
pub fn authorize_unscoped(principal: &Principal, action: Action) -> Result<(), AuthzError> {
    if audience_admits(action.audience(), principal) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(format!(
            "{} may not perform {}",
            principal.actor_kind(),
            action
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaffRole;
    use proptest::prelude::*;

    const ACTIONS: [Action; 11] = [
        Action::CreateEngagement,
        Action::Read,
        Action::TransitionEngagement,
        Action::OverrideEngagementStatus,
        Action::AssignStaff,
        Action::RequestDocument,
        Action::UploadDocument,
        Action::TransitionDocument,
        Action::EditTaxForm,
        Action::SubmitTaxForm,
        Action::TransitionTaxForm,
    ];

    fn scope(owner: UserId, staff: &[StaffId]) -> ResourceScope {
        let engagement_id = EngagementId::new();
        ResourceScope {
            kind: EntityKind::Engagement,
            id: *engagement_id.as_uuid(),
            engagement_id,
            owner,
            assigned_staff: staff.iter().copied().collect(),
        }
    }

    #[test]
    fn owner_may_act_on_own_engagement() {
        let owner = UserId::new();
        let s = scope(owner, &[]);
        assert_eq!(
            authorize(&Principal::end_user(owner), Action::SubmitTaxForm, Some(&s)),
            Ok(Grant::Owner)
        );
    }

    #[test]
    fn assigned_staff_may_act_but_not_as_the_client() {
        let staff = StaffId::new();
        let s = scope(UserId::new(), &[staff]);
        let p = Principal::staff(staff, StaffRole::Standard);

        assert_eq!(authorize(&p, Action::TransitionDocument, Some(&s)), Ok(Grant::AssignedStaff));
        assert!(matches!(
            authorize(&p, Action::EditTaxForm, Some(&s)),
            Err(AuthzError::Forbidden(_))
        ));
    }

    #[test]
    fn override_is_super_only() {
        let staff = StaffId::new();
        let s = scope(UserId::new(), &[staff]);
        assert!(matches!(
            authorize(&Principal::staff(staff, StaffRole::Standard), Action::OverrideEngagementStatus, Some(&s)),
            Err(AuthzError::Forbidden(_))
        ));
        assert_eq!(
            authorize(&Principal::staff(StaffId::new(), StaffRole::Super), Action::OverrideEngagementStatus, Some(&s)),
            Ok(Grant::SuperStaff)
        );
    }

    #[test]
    fn super_staff_is_an_escalation_even_when_unassigned() {
        let s = scope(UserId::new(), &[]);
        let grant = authorize(&Principal::staff(StaffId::new(), StaffRole::Super), Action::Read, Some(&s))
            .unwrap();
        assert!(grant.is_escalation());
    }

    #[test]
    fn nonexistent_resource_is_not_found_even_for_super() {
        let p = Principal::staff(StaffId::new(), StaffRole::Super);
        assert_eq!(authorize(&p, Action::Read, None), Err(AuthzError::NotFound));
    }

    #[test]
    fn creation_is_for_end_users() {
        assert!(authorize_unscoped(&Principal::end_user(UserId::new()), Action::CreateEngagement).is_ok());
        assert!(authorize_unscoped(
            &Principal::staff(StaffId::new(), StaffRole::Super),
            Action::CreateEngagement
        )
        .is_err());
    }

    fn unrelated_principal() -> impl Strategy<Value = Principal> {
        prop_oneof![
            Just(Principal::end_user(UserId::new())),
            Just(Principal::staff(StaffId::new(), StaffRole::Standard)),
        ]
    }

    proptest! {
        /// An unrelated, non-super principal cannot tell an existing resource from a missing one.
        #[test]
        fn unrelated_principals_see_identical_denials(
            principal in unrelated_principal(),
            action in prop::sample::select(ACTIONS.to_vec()),
        ) {
            let s = scope(UserId::new(), &[StaffId::new()]);
            let existing = authorize(&principal, action, Some(&s));
            let missing = authorize(&principal, action, None);
            prop_assert_eq!(existing, Err(AuthzError::NotFound));
            prop_assert_eq!(missing, Err(AuthzError::NotFound));
        }
    }
}
