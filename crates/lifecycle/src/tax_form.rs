//! Tax form lifecycle.
//!
//! # Invariants
//! - One form per engagement.
//! - Content is writable only by the owning end-user while `Draft`. Once
//!   submitted, staff may change the status, never the content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxguard_core::{ActorKind, EngagementId, EntityKind, TaxFormId, Versioned};

use crate::error::LifecycleError;
use crate::machine::{Edge, PlannedTransition, StateMachine, Status};
use crate::requirements::{FormData, RequirementTable};

use self::TaxFormStatus as S;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxFormStatus {
    Draft,
    Submitted,
    Processed,
}

impl TaxFormStatus {
    pub const ALL: [TaxFormStatus; 3] = [
        TaxFormStatus::Draft,
        TaxFormStatus::Submitted,
        TaxFormStatus::Processed,
    ];
}

impl Status for TaxFormStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaxFormStatus::Draft => "draft",
            TaxFormStatus::Submitted => "submitted",
            TaxFormStatus::Processed => "processed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl core::fmt::Display for TaxFormStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

static TAX_FORM_EDGES: &[Edge<TaxFormStatus>] = &[
    Edge { from: S::Draft, to: S::Submitted, actors: &[ActorKind::EndUser] },
    Edge { from: S::Submitted, to: S::Processed, actors: &[ActorKind::Staff] },
];

pub struct TaxFormMachine;

impl StateMachine for TaxFormMachine {
    type State = TaxFormStatus;

    const ENTITY: EntityKind = EntityKind::TaxForm;

    fn states() -> &'static [TaxFormStatus] {
        &TaxFormStatus::ALL
    }

    fn initial() -> TaxFormStatus {
        TaxFormStatus::Draft
    }

    fn is_terminal(state: TaxFormStatus) -> bool {
        state == TaxFormStatus::Processed
    }

    fn edges() -> &'static [Edge<TaxFormStatus>] {
        TAX_FORM_EDGES
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxForm {
    pub id: TaxFormId,
    pub engagement_id: EngagementId,
    pub status: TaxFormStatus,
    pub data: FormData,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaxForm {
    pub fn draft(
        id: TaxFormId,
        engagement_id: EngagementId,
        data: FormData,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            engagement_id,
            status: TaxFormMachine::initial(),
            data,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `actor` may replace the form content right now.
    pub fn ensure_editable(&self, actor: ActorKind) -> Result<(), LifecycleError> {
        if actor != ActorKind::EndUser {
            return Err(LifecycleError::ContentLocked {
                entity: EntityKind::TaxForm,
                detail: format!("{actor} may not edit form content"),
            });
        }
        if self.status != TaxFormStatus::Draft {
            return Err(LifecycleError::ContentLocked {
                entity: EntityKind::TaxForm,
                detail: format!("form is {}", self.status),
            });
        }
        Ok(())
    }

    /// Validate a status change. Submission also runs the requirement table.
    pub fn plan_transition(
        &self,
        to: TaxFormStatus,
        actor: ActorKind,
        requirements: &RequirementTable,
    ) -> Result<PlannedTransition<TaxFormStatus>, LifecycleError> {
        let planned = TaxFormMachine::attempt(self.status, to, actor)?;
        if planned.to == TaxFormStatus::Submitted {
            requirements.validate(&self.data)?;
        }
        Ok(planned)
    }

    pub fn apply_data(&mut self, data: FormData, now: DateTime<Utc>) {
        self.data = data;
        self.version += 1;
        self.updated_at = now;
    }

    pub fn apply_status(&mut self, to: TaxFormStatus, now: DateTime<Utc>) {
        self.status = to;
        self.version += 1;
        self.updated_at = now;
    }
}

impl Versioned for TaxForm {
    type Id = TaxFormId;

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
    use serde_json::json;

    fn form(flag: bool, properties: serde_json::Value) -> TaxForm {
        let mut data = FormData::default();
        data.flags.insert("hasForeignProperty".into(), flag);
        data.sections.insert("foreignProperties".into(), properties);
        TaxForm::draft(TaxFormId::new(), EngagementId::new(), data, Utc::now())
    }

    #[test]
    fn submission_fails_naming_the_missing_field() {
        let tf = form(true, json!([]));
        let err = tf
            .plan_transition(TaxFormStatus::Submitted, ActorKind::EndUser, &RequirementTable::standard())
            .unwrap_err();
        assert_eq!(err.reason(), "missing_required_section");
        assert_eq!(err.field(), "foreignProperties");
    }

    #[test]
    fn submission_ignores_section_when_flag_is_false() {
        let tf = form(false, json!([]));
        let planned = tf
            .plan_transition(TaxFormStatus::Submitted, ActorKind::EndUser, &RequirementTable::standard())
            .unwrap();
        assert_eq!(planned.to, TaxFormStatus::Submitted);
    }

    #[test]
    fn staff_cannot_submit_and_end_user_cannot_process() {
        let mut tf = form(false, json!(null));
        let table = RequirementTable::standard();
        let err = tf
            .plan_transition(TaxFormStatus::Submitted, ActorKind::Staff, &table)
            .unwrap_err();
        assert_eq!(err.reason(), "wrong_actor");

        tf.apply_status(TaxFormStatus::Submitted, Utc::now());
        let err = tf
            .plan_transition(TaxFormStatus::Processed, ActorKind::EndUser, &table)
            .unwrap_err();
        assert_eq!(err.reason(), "wrong_actor");
        assert!(tf
            .plan_transition(TaxFormStatus::Processed, ActorKind::Staff, &table)
            .is_ok());
    }

    #[test]
    fn content_is_locked_after_submission_and_to_staff() {
        let mut tf = form(false, json!(null));
        assert!(tf.ensure_editable(ActorKind::EndUser).is_ok());
        assert!(matches!(
            tf.ensure_editable(ActorKind::Staff),
            Err(LifecycleError::ContentLocked { .. })
        ));

        tf.apply_status(TaxFormStatus::Submitted, Utc::now());
        assert!(matches!(
            tf.ensure_editable(ActorKind::EndUser),
            Err(LifecycleError::ContentLocked { .. })
        ));
    }
}
