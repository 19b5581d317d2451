//! Engagement lifecycle: one client's tax-filing relationship for one filing year.
//!
//! # Invariants
//! - Created only by the owning end-user.
//! - Status never regresses past `Filed` through the table; only an explicit
//!   superuser override (separately audited) may move it backwards.
//! - Staff mutate status and the assignment set only.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxguard_core::{ActorKind, EngagementId, EntityKind, StaffId, UserId, Versioned};

use crate::error::LifecycleError;
use crate::machine::{Edge, PlannedTransition, StateMachine, Status};

use self::EngagementStatus as S;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementStatus {
    Created,
    DocumentsPending,
    UnderReview,
    ReviewComplete,
    PaymentRequested,
    PaymentReceived,
    InPreparation,
    AwaitingApproval,
    Filed,
    Completed,
}

impl EngagementStatus {
    pub const ALL: [EngagementStatus; 10] = [
        EngagementStatus::Created,
        EngagementStatus::DocumentsPending,
        EngagementStatus::UnderReview,
        EngagementStatus::ReviewComplete,
        EngagementStatus::PaymentRequested,
        EngagementStatus::PaymentReceived,
        EngagementStatus::InPreparation,
        EngagementStatus::AwaitingApproval,
        EngagementStatus::Filed,
        EngagementStatus::Completed,
    ];

    /// `Filed` and everything after it.
    pub fn is_filed(&self) -> bool {
        matches!(self, EngagementStatus::Filed | EngagementStatus::Completed)
    }
}

impl Status for EngagementStatus {
    fn as_str(&self) -> &'static str {
        match self {
            EngagementStatus::Created => "created",
            EngagementStatus::DocumentsPending => "documents_pending",
            EngagementStatus::UnderReview => "under_review",
            EngagementStatus::ReviewComplete => "review_complete",
            EngagementStatus::PaymentRequested => "payment_requested",
            EngagementStatus::PaymentReceived => "payment_received",
            EngagementStatus::InPreparation => "in_preparation",
            EngagementStatus::AwaitingApproval => "awaiting_approval",
            EngagementStatus::Filed => "filed",
            EngagementStatus::Completed => "completed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl core::fmt::Display for EngagementStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

const END_USER: &[ActorKind] = &[ActorKind::EndUser];
const STAFF: &[ActorKind] = &[ActorKind::Staff];
const SYSTEM: &[ActorKind] = &[ActorKind::System];
const END_USER_OR_STAFF: &[ActorKind] = &[ActorKind::EndUser, ActorKind::Staff];

static ENGAGEMENT_EDGES: &[Edge<EngagementStatus>] = &[
    Edge { from: S::Created, to: S::DocumentsPending, actors: END_USER },
    Edge { from: S::DocumentsPending, to: S::UnderReview, actors: STAFF },
    Edge { from: S::UnderReview, to: S::ReviewComplete, actors: STAFF },
    // send-back for missing or unreadable documents
    Edge { from: S::UnderReview, to: S::DocumentsPending, actors: STAFF },
    Edge { from: S::ReviewComplete, to: S::PaymentRequested, actors: STAFF },
    Edge { from: S::PaymentRequested, to: S::PaymentReceived, actors: SYSTEM },
    Edge { from: S::PaymentReceived, to: S::InPreparation, actors: STAFF },
    Edge { from: S::InPreparation, to: S::AwaitingApproval, actors: STAFF },
    Edge { from: S::AwaitingApproval, to: S::Filed, actors: END_USER_OR_STAFF },
    // client rejects the prepared return
    Edge { from: S::AwaitingApproval, to: S::InPreparation, actors: END_USER_OR_STAFF },
    Edge { from: S::Filed, to: S::Completed, actors: STAFF },
];

/// Transition table for engagements.
pub struct EngagementMachine;

impl StateMachine for EngagementMachine {
    type State = EngagementStatus;

    const ENTITY: EntityKind = EntityKind::Engagement;

    fn states() -> &'static [EngagementStatus] {
        &EngagementStatus::ALL
    }

    fn initial() -> EngagementStatus {
        EngagementStatus::Created
    }

    fn is_terminal(state: EngagementStatus) -> bool {
        state == EngagementStatus::Completed
    }

    fn edges() -> &'static [Edge<EngagementStatus>] {
        ENGAGEMENT_EDGES
    }
}

/// Engagement row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub id: EngagementId,
    pub owner: UserId,
    pub filing_year: i32,
    pub status: EngagementStatus,
    pub assigned_staff: BTreeSet<StaffId>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Engagement {
    /// Open a new engagement on behalf of its owner.
    pub fn open(
        id: EngagementId,
        owner: UserId,
        filing_year: i32,
        now: DateTime<Utc>,
    ) -> Result<Self, LifecycleError> {
        if !(1900..=2200).contains(&filing_year) {
            return Err(LifecycleError::InvalidInput {
                field: "filing_year",
                message: format!("{filing_year} is not a plausible filing year"),
            });
        }

        Ok(Self {
            id,
            owner,
            filing_year,
            status: EngagementMachine::initial(),
            assigned_staff: BTreeSet::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_assigned(&self, staff: StaffId) -> bool {
        self.assigned_staff.contains(&staff)
    }

    /// Validate a table transition from the current status.
    pub fn plan_transition(
        &self,
        to: EngagementStatus,
        actor: ActorKind,
    ) -> Result<PlannedTransition<EngagementStatus>, LifecycleError> {
        Ok(EngagementMachine::attempt(self.status, to, actor)?)
    }

    /// Plan a superuser override: any target except the current one, with a reason.
    ///
    /// Whether the caller *is* super staff is the guard's decision, not this one.
    pub fn plan_override(
        &self,
        to: EngagementStatus,
        reason: &str,
    ) -> Result<PlannedTransition<EngagementStatus>, LifecycleError> {
        if reason.trim().is_empty() {
            return Err(LifecycleError::OverrideReasonRequired);
        }
        if to == self.status {
            return Err(LifecycleError::AlreadyInStatus {
                entity: EntityKind::Engagement,
                status: self.status.as_str(),
            });
        }

        Ok(PlannedTransition {
            entity: EntityKind::Engagement,
            from: self.status,
            to,
            actor: ActorKind::Staff,
        })
    }

    pub fn apply_status(&mut self, to: EngagementStatus, now: DateTime<Utc>) {
        self.status = to;
        self.version += 1;
        self.updated_at = now;
    }

    pub fn apply_assignment(&mut self, assigned: BTreeSet<StaffId>, now: DateTime<Utc>) {
        self.assigned_staff = assigned;
        self.version += 1;
        self.updated_at = now;
    }
}

impl Versioned for Engagement {
    type Id = EngagementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransitionError;
    use proptest::prelude::*;

    fn engagement() -> Engagement {
        Engagement::open(EngagementId::new(), UserId::new(), 2024, Utc::now()).unwrap()
    }

    const ACTORS: [ActorKind; 3] = [ActorKind::EndUser, ActorKind::Staff, ActorKind::System];

    #[test]
    fn happy_path_reaches_completed() {
        use EngagementStatus::*;
        let mut e = engagement();
        let steps = [
            (DocumentsPending, ActorKind::EndUser),
            (UnderReview, ActorKind::Staff),
            (ReviewComplete, ActorKind::Staff),
            (PaymentRequested, ActorKind::Staff),
            (PaymentReceived, ActorKind::System),
            (InPreparation, ActorKind::Staff),
            (AwaitingApproval, ActorKind::Staff),
            (Filed, ActorKind::EndUser),
            (Completed, ActorKind::Staff),
        ];
        for (to, actor) in steps {
            let planned = e.plan_transition(to, actor).unwrap();
            e.apply_status(planned.to, Utc::now());
        }
        assert_eq!(e.status, Completed);
        assert_eq!(e.version, 10);
    }

    #[test]
    fn payment_received_is_system_only() {
        let mut e = engagement();
        e.status = EngagementStatus::PaymentRequested;
        let err = e
            .plan_transition(EngagementStatus::PaymentReceived, ActorKind::Staff)
            .unwrap_err();
        assert_eq!(err.reason(), "wrong_actor");
    }

    #[test]
    fn skipping_ahead_is_no_such_edge() {
        let e = engagement();
        let err = e
            .plan_transition(EngagementStatus::Filed, ActorKind::Staff)
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Transition(TransitionError::NoSuchEdge { from: "created", to: "filed", .. })
        ));
    }

    #[test]
    fn override_requires_reason_and_a_different_target() {
        let mut e = engagement();
        e.status = EngagementStatus::Filed;
        assert_eq!(
            e.plan_override(EngagementStatus::InPreparation, "  "),
            Err(LifecycleError::OverrideReasonRequired)
        );
        assert!(matches!(
            e.plan_override(EngagementStatus::Filed, "typo"),
            Err(LifecycleError::AlreadyInStatus { .. })
        ));
        let planned = e
            .plan_override(EngagementStatus::InPreparation, "amended return")
            .unwrap();
        assert_eq!(planned.from, EngagementStatus::Filed);
        assert_eq!(planned.to, EngagementStatus::InPreparation);
    }

    #[test]
    fn implausible_filing_year_is_rejected() {
        let err = Engagement::open(EngagementId::new(), UserId::new(), 12, Utc::now()).unwrap_err();
        assert_eq!(err.field(), "filing_year");
    }

    proptest! {
        /// Every pair absent from the table is rejected as "no such edge" for every actor.
        #[test]
        fn absent_edges_are_always_rejected(
            from in prop::sample::select(EngagementStatus::ALL.to_vec()),
            to in prop::sample::select(EngagementStatus::ALL.to_vec()),
            actor in prop::sample::select(ACTORS.to_vec()),
        ) {
            let result = EngagementMachine::attempt(from, to, actor);
            if EngagementMachine::edge(from, to).is_none() {
                let is_no_such_edge = matches!(result, Err(TransitionError::NoSuchEdge { .. }));
                prop_assert!(is_no_such_edge);
            }
        }

        /// Once filed, no table sequence by any actor returns the engagement before `Filed`.
        #[test]
        fn filed_never_regresses_through_the_table(
            targets in prop::collection::vec(prop::sample::select(EngagementStatus::ALL.to_vec()), 1..20),
            actors in prop::collection::vec(prop::sample::select(ACTORS.to_vec()), 20),
        ) {
            let mut e = engagement();
            e.status = EngagementStatus::Filed;
            for (to, actor) in targets.into_iter().zip(actors) {
                if let Ok(planned) = e.plan_transition(to, actor) {
                    e.apply_status(planned.to, Utc::now());
                }
                prop_assert!(e.status.is_filed());
            }
        }
    }
}
