//! Guarded lifecycle execution pipeline.
//!
//! `LifecycleDispatcher` is the one place where authorization, lifecycle rules,
//! persistence and auditing meet. Every mutating call runs the same pipeline:
//!
//! ```text
//! Request (principal, target, change)
//!   ↓
//! 1. Load the target row and resolve its ownership scope
//!   ↓
//! 2. Guard: authorize(principal, action, scope)
//!   ↓
//! 3. Plan the change with the entity's transition table (pure)
//!   ↓
//! 4. Commit: version-checked write + transition records, atomically
//!   ↓
//! 5. Audit: exactly one entry for the outcome, whatever it was
//! ```
//!
//! Step 5 wraps steps 1–4 through [`AuditRecorder::observe_with`], so denials,
//! rejected transitions and conflicts are recorded as faithfully as successes.
//! Super-staff grants are tagged `privilege_escalation`; overrides are tagged
//! `override`.
//!
//! Reads are audited only when they are denied or go through the super-staff path.

use std::collections::BTreeSet;
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use taxguard_audit::{
    AuditActor, AuditError, AuditOutcome, AuditRecorder, AuditTag, AuditTarget, AuditableError, Observed,
    ObservedError,
};
use taxguard_auth::{Action, AuthzError, Grant, Principal, ResourceScope, authorize, authorize_unscoped};
use taxguard_core::{ActorKind, DocumentId, EngagementId, EntityKind, StaffId, TaxFormId};
use taxguard_lifecycle::{
    Document, DocumentStatus, Engagement, EngagementStatus, FormData, LifecycleError, RequirementTable, Status,
    TaxForm, TaxFormStatus, TransitionError,
};

use crate::store::{EntityStore, StoreError, TransitionRecord};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// Missing, or not visible to the caller; the two are indistinguishable.
    #[error("not found")]
    NotFound,

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Refused by a lifecycle rule (transition table, requirement table, content lock).
    #[error(transparent)]
    Rejected(LifecycleError),

    /// Lost an optimistic-concurrency race or hit a uniqueness rule.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation committed but its audit entry could not be written.
    #[error(transparent)]
    Audit(AuditError),
}

impl From<AuthzError> for DispatchError {
    fn from(value: AuthzError) -> Self {
        match value {
            AuthzError::NotFound => DispatchError::NotFound,
            AuthzError::Forbidden(msg) => DispatchError::Forbidden(msg),
        }
    }
}

impl From<LifecycleError> for DispatchError {
    fn from(value: LifecycleError) -> Self {
        DispatchError::Rejected(value)
    }
}

impl From<TransitionError> for DispatchError {
    fn from(value: TransitionError) -> Self {
        DispatchError::Rejected(LifecycleError::Transition(value))
    }
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound => DispatchError::NotFound,
            StoreError::Conflict(msg) => DispatchError::Conflict(msg),
            StoreError::Unavailable(msg) | StoreError::Corrupt(msg) => DispatchError::Unavailable(msg),
        }
    }
}

impl From<ObservedError<DispatchError>> for DispatchError {
    fn from(value: ObservedError<DispatchError>) -> Self {
        match value {
            ObservedError::Operation(e) => e,
            ObservedError::Audit(e) => DispatchError::Audit(e),
        }
    }
}

impl AuditableError for DispatchError {
    fn audit_outcome(&self) -> AuditOutcome {
        match self {
            DispatchError::NotFound => AuditOutcome::denied("not_found"),
            DispatchError::Forbidden(_) => AuditOutcome::denied("forbidden"),
            DispatchError::Rejected(e) => AuditOutcome::denied(e.reason()),
            DispatchError::Conflict(_) => AuditOutcome::failed("conflict"),
            DispatchError::Unavailable(_) => AuditOutcome::failed("store_unavailable"),
            DispatchError::Audit(_) => AuditOutcome::failed("audit_unavailable"),
        }
    }
}

/// Audit identity of an authenticated principal.
pub fn audit_actor(principal: &Principal) -> AuditActor {
    match principal {
        Principal::EndUser { id } => AuditActor::EndUser { id: *id.as_uuid() },
        Principal::Staff { id, .. } => AuditActor::Staff {
            id: *id.as_uuid(),
            super_staff: principal.is_super(),
        },
    }
}

/// Staff additions and removals applied to an engagement's assignment set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentChange {
    #[serde(default)]
    pub add: BTreeSet<StaffId>,
    #[serde(default)]
    pub remove: BTreeSet<StaffId>,
}

/// An engagement together with its documents and form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngagementView {
    pub engagement: Engagement,
    pub documents: Vec<Document>,
    pub tax_form: Option<TaxForm>,
}

/// Result of a guarded step, before auditing.
struct Allowed<T> {
    value: T,
    grant: Grant,
    /// Merged into the audit payload on success.
    detail: Value,
}

impl<T> Allowed<T> {
    fn new(value: T, grant: Grant) -> Self {
        Self {
            value,
            grant,
            detail: Value::Null,
        }
    }

    fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

fn describe<T>(allowed: &Allowed<T>, observed: &mut Observed) {
    if allowed.grant.is_escalation() && observed.tag == AuditTag::Standard {
        observed.tag = AuditTag::PrivilegeEscalation;
    }
    if let (Value::Object(payload), Value::Object(detail)) = (&mut observed.payload, &allowed.detail) {
        for (k, v) in detail {
            payload.insert(k.clone(), v.clone());
        }
    }
    if let Value::Object(payload) = &mut observed.payload {
        payload.insert("grant".to_string(), json!(allowed.grant));
    }
}

fn engagement_scope(engagement: &Engagement, kind: EntityKind, id: Uuid) -> ResourceScope {
    ResourceScope {
        kind,
        id,
        engagement_id: engagement.id,
        owner: engagement.owner,
        assigned_staff: engagement.assigned_staff.clone(),
    }
}

/// Creation is reserved to the owning end-user, super staff included.
fn require_end_user(principal: &Principal, action: Action) -> Result<(), DispatchError> {
    if principal.actor_kind() == ActorKind::EndUser {
        Ok(())
    } else {
        Err(DispatchError::Forbidden(format!(
            "{} may not perform {}",
            principal.actor_kind(),
            action
        )))
    }
}

fn target(kind: EntityKind, id: impl ToString) -> AuditTarget {
    AuditTarget::new(kind.as_str(), id)
}

/// Orchestrates guarded lifecycle operations over an [`EntityStore`].
#[derive(Clone)]
pub struct LifecycleDispatcher<S> {
    store: S,
    audit: AuditRecorder,
    requirements: RequirementTable,
}

impl<S> LifecycleDispatcher<S> {
    pub fn new(store: S, audit: AuditRecorder) -> Self {
        Self {
            store,
            audit,
            requirements: RequirementTable::standard(),
        }
    }

    pub fn with_requirements(mut self, requirements: RequirementTable) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }
}

impl<S> LifecycleDispatcher<S>
where
    S: EntityStore,
{
    /// Run a mutating step and record exactly one audit entry for it.
    async fn mutate<T, Fut>(&self, observed: Observed, op: Fut) -> Result<T, DispatchError>
    where
        Fut: Future<Output = Result<Allowed<T>, DispatchError>>,
    {
        self.audit
            .observe_with(observed, op, describe)
            .await
            .map(|allowed| allowed.value)
            .map_err(DispatchError::from)
    }

    /// Run a read; only denials and escalations are recorded.
    async fn read<T, Fut>(&self, observed: Observed, op: Fut) -> Result<T, DispatchError>
    where
        Fut: Future<Output = Result<Allowed<T>, DispatchError>>,
    {
        match op.await {
            Ok(allowed) if !allowed.grant.is_escalation() => Ok(allowed.value),
            settled => self.mutate(observed, async { settled }).await,
        }
    }

    async fn load_engagement(&self, id: EngagementId) -> Result<Option<Engagement>, DispatchError> {
        Ok(self.store.engagement(id).await?)
    }

    /// Load an engagement and authorize `action` against it.
    async fn guard_engagement(
        &self,
        principal: &Principal,
        action: Action,
        id: EngagementId,
    ) -> Result<(Engagement, Grant), DispatchError> {
        let engagement = self.load_engagement(id).await?;
        let scope = engagement
            .as_ref()
            .map(|e| engagement_scope(e, EntityKind::Engagement, *id.as_uuid()));
        let grant = authorize(principal, action, scope.as_ref())?;
        let engagement = engagement.ok_or(DispatchError::NotFound)?;
        Ok((engagement, grant))
    }

    /// Load a document, inherit scope from its engagement, authorize.
    async fn guard_document(
        &self,
        principal: &Principal,
        action: Action,
        id: DocumentId,
    ) -> Result<(Document, Grant), DispatchError> {
        let document = self.store.document(id).await?;
        let engagement = match &document {
            Some(d) => self.load_engagement(d.engagement_id).await?,
            None => None,
        };
        let scope = engagement
            .as_ref()
            .map(|e| engagement_scope(e, EntityKind::Document, *id.as_uuid()));
        let grant = authorize(principal, action, scope.as_ref())?;
        let document = document.ok_or(DispatchError::NotFound)?;
        Ok((document, grant))
    }

    async fn guard_tax_form(
        &self,
        principal: &Principal,
        action: Action,
        id: TaxFormId,
    ) -> Result<(TaxForm, Grant), DispatchError> {
        let form = self.store.tax_form(id).await?;
        let engagement = match &form {
            Some(f) => self.load_engagement(f.engagement_id).await?,
            None => None,
        };
        let scope = engagement
            .as_ref()
            .map(|e| engagement_scope(e, EntityKind::TaxForm, *id.as_uuid()));
        let grant = authorize(principal, action, scope.as_ref())?;
        let form = form.ok_or(DispatchError::NotFound)?;
        Ok((form, grant))
    }

    // ---- engagements ----

    /// Open an engagement for the calling end-user.
    pub async fn create_engagement(
        &self,
        principal: &Principal,
        filing_year: i32,
        now: DateTime<Utc>,
    ) -> Result<Engagement, DispatchError> {
        let id = EngagementId::new();
        let action = Action::CreateEngagement;
        let observed = Observed::new(audit_actor(principal), action.as_str())
            .target(target(EntityKind::Engagement, id))
            .payload(json!({ "filing_year": filing_year }));

        self.mutate(observed, async {
            authorize_unscoped(principal, action)?;
            let owner = principal
                .as_end_user()
                .ok_or_else(|| DispatchError::Forbidden(format!("{} may not perform {action}", principal.actor_kind())))?;

            let engagement = Engagement::open(id, owner, filing_year, now)?;
            self.store.insert_engagement(&engagement).await?;

            info!(engagement_id = %id, filing_year, "engagement opened");
            Ok(Allowed::new(engagement, Grant::Owner))
        })
        .await
    }

    /// The engagement with its documents and tax form.
    pub async fn engagement(&self, principal: &Principal, id: EngagementId) -> Result<EngagementView, DispatchError> {
        let observed = Observed::new(audit_actor(principal), Action::Read.as_str())
            .target(target(EntityKind::Engagement, id))
            .payload(json!({}));

        self.read(observed, async {
            let (engagement, grant) = self.guard_engagement(principal, Action::Read, id).await?;
            let documents = self.store.documents_for(id).await?;
            let tax_form = self.store.tax_form_for(id).await?;
            Ok(Allowed::new(
                EngagementView {
                    engagement,
                    documents,
                    tax_form,
                },
                grant,
            ))
        })
        .await
    }

    /// Move an engagement along its transition table.
    pub async fn transition_engagement(
        &self,
        principal: &Principal,
        id: EngagementId,
        to: EngagementStatus,
        now: DateTime<Utc>,
    ) -> Result<Engagement, DispatchError> {
        let action = Action::TransitionEngagement;
        let observed = Observed::new(audit_actor(principal), action.as_str())
            .target(target(EntityKind::Engagement, id))
            .payload(json!({ "to": to.as_str() }));

        self.mutate(observed, async {
            let (engagement, grant) = self.guard_engagement(principal, action, id).await?;
            let planned = engagement.plan_transition(to, principal.actor_kind())?;

            let mut updated = engagement.clone();
            updated.apply_status(planned.to, now);
            let record = TransitionRecord::planned(&planned, *id.as_uuid(), now);
            self.store
                .update_engagement(&updated, engagement.version, std::slice::from_ref(&record))
                .await?;

            info!(engagement_id = %id, from = %planned.from, to = %planned.to, actor = %planned.actor, "engagement transitioned");
            Ok(Allowed::new(updated, grant).detail(json!({ "from": planned.from.as_str() })))
        })
        .await
    }

    /// Superuser override: any target state, with a mandatory reason.
    ///
    /// Produces exactly one audit entry tagged `override`, allowed or not.
    pub async fn override_engagement_status(
        &self,
        principal: &Principal,
        id: EngagementId,
        to: EngagementStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Engagement, DispatchError> {
        let action = Action::OverrideEngagementStatus;
        let observed = Observed::new(audit_actor(principal), action.as_str())
            .target(target(EntityKind::Engagement, id))
            .tag(AuditTag::Override)
            .payload(json!({ "to": to.as_str(), "reason": reason }));

        self.mutate(observed, async {
            let (engagement, grant) = self.guard_engagement(principal, action, id).await?;
            if !principal.is_super() {
                return Err(DispatchError::Forbidden(format!("{action} requires super staff")));
            }
            let planned = engagement.plan_override(to, reason)?;

            let mut updated = engagement.clone();
            updated.apply_status(planned.to, now);
            let record = TransitionRecord::planned(&planned, *id.as_uuid(), now).overridden();
            self.store
                .update_engagement(&updated, engagement.version, std::slice::from_ref(&record))
                .await?;

            info!(engagement_id = %id, from = %planned.from, to = %planned.to, "engagement status overridden");
            Ok(Allowed::new(updated, grant).detail(json!({ "from": planned.from.as_str() })))
        })
        .await
    }

    /// System edge: a payment record landed for the engagement.
    pub async fn record_payment_received(&self, id: EngagementId, now: DateTime<Utc>) -> Result<Engagement, DispatchError> {
        let observed = Observed::new(AuditActor::System, "engagement.payment_received")
            .target(target(EntityKind::Engagement, id))
            .payload(json!({ "to": EngagementStatus::PaymentReceived.as_str() }));

        self.mutate(observed, async {
            let engagement = self.load_engagement(id).await?.ok_or(DispatchError::NotFound)?;
            let planned = engagement.plan_transition(EngagementStatus::PaymentReceived, ActorKind::System)?;

            let mut updated = engagement.clone();
            updated.apply_status(planned.to, now);
            let record = TransitionRecord::planned(&planned, *id.as_uuid(), now);
            self.store
                .update_engagement(&updated, engagement.version, std::slice::from_ref(&record))
                .await?;

            info!(engagement_id = %id, "payment received");
            Ok(Allowed::new(updated, Grant::Owner))
        })
        .await
    }

    /// Add and remove staff from an engagement's assignment set.
    pub async fn assign_staff(
        &self,
        principal: &Principal,
        id: EngagementId,
        change: AssignmentChange,
        now: DateTime<Utc>,
    ) -> Result<Engagement, DispatchError> {
        let action = Action::AssignStaff;
        let observed = Observed::new(audit_actor(principal), action.as_str())
            .target(target(EntityKind::Engagement, id))
            .payload(json!({ "add": change.add, "remove": change.remove }));

        self.mutate(observed, async {
            let (engagement, grant) = self.guard_engagement(principal, action, id).await?;

            let mut assigned = engagement.assigned_staff.clone();
            assigned.extend(change.add.iter().copied());
            assigned.retain(|s| !change.remove.contains(s));
            if assigned == engagement.assigned_staff {
                return Ok(Allowed::new(engagement, grant).detail(json!({ "changed": false })));
            }

            let mut updated = engagement.clone();
            updated.apply_assignment(assigned, now);
            self.store.update_engagement(&updated, engagement.version, &[]).await?;

            info!(engagement_id = %id, assigned = updated.assigned_staff.len(), "staff assignment changed");
            Ok(Allowed::new(updated, grant).detail(json!({ "changed": true })))
        })
        .await
    }

    // ---- documents ----

    /// Open a document slot on the caller's engagement.
    pub async fn request_document(
        &self,
        principal: &Principal,
        engagement_id: EngagementId,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<Document, DispatchError> {
        let id = DocumentId::new();
        let action = Action::RequestDocument;
        let observed = Observed::new(audit_actor(principal), action.as_str())
            .target(target(EntityKind::Document, id))
            .payload(json!({ "engagement_id": engagement_id, "label": label }));

        self.mutate(observed, async {
            let (_, grant) = self.guard_engagement(principal, action, engagement_id).await?;
            require_end_user(principal, action)?;

            let document = Document::request(id, engagement_id, label, now)?;
            self.store.insert_document(&document).await?;

            info!(document_id = %id, engagement_id = %engagement_id, "document requested");
            Ok(Allowed::new(document, grant))
        })
        .await
    }

    /// Upload content into a document slot.
    ///
    /// From `Requested` the row itself takes the content. From
    /// `ReuploadRequested` a replacement row is created and the original is
    /// archived. Either way the uploaded row is moved straight into review by
    /// the system, in the same commit. Returns the live row.
    pub async fn upload_document(
        &self,
        principal: &Principal,
        id: DocumentId,
        content_digest: &str,
        now: DateTime<Utc>,
    ) -> Result<Document, DispatchError> {
        let action = Action::UploadDocument;
        let observed = Observed::new(audit_actor(principal), action.as_str())
            .target(target(EntityKind::Document, id))
            .payload(json!({ "content_digest": content_digest }));

        self.mutate(observed, async {
            let (document, grant) = self.guard_document(principal, action, id).await?;
            let actor = principal.actor_kind();
            let digest = content_digest.trim();

            if document.status == DocumentStatus::ReuploadRequested {
                let reupload = document.plan_reupload(actor, DocumentId::new(), digest, now)?;
                let mut replacement = reupload.replacement;
                let intake = replacement.plan_transition(DocumentStatus::UnderReview, ActorKind::System)?;
                replacement.apply_status(intake.to, now);

                let mut archived = document.clone();
                archived.apply_archive(now);

                let replacement_id = *replacement.id.as_uuid();
                let records = [
                    TransitionRecord::planned(&reupload.transition, replacement_id, now),
                    TransitionRecord::planned(&intake, replacement_id, now),
                ];
                self.store
                    .replace_document(&archived, document.version, &replacement, &records)
                    .await?;

                info!(document_id = %id, replacement_id = %replacement.id, "document re-uploaded");
                let detail = json!({ "replacement_id": replacement.id, "supersedes": id });
                return Ok(Allowed::new(replacement, grant).detail(detail));
            }

            let upload = document.plan_upload(actor, digest)?;
            let mut updated = document.clone();
            updated.apply_upload(digest.to_string(), now);
            let intake = updated.plan_transition(DocumentStatus::UnderReview, ActorKind::System)?;
            updated.apply_status(intake.to, now);

            let records = [
                TransitionRecord::planned(&upload, *id.as_uuid(), now),
                TransitionRecord::planned(&intake, *id.as_uuid(), now),
            ];
            self.store.update_document(&updated, document.version, &records).await?;

            info!(document_id = %id, "document uploaded");
            Ok(Allowed::new(updated, grant))
        })
        .await
    }

    /// Review decisions on a document.
    pub async fn transition_document(
        &self,
        principal: &Principal,
        id: DocumentId,
        to: DocumentStatus,
        now: DateTime<Utc>,
    ) -> Result<Document, DispatchError> {
        let action = Action::TransitionDocument;
        let observed = Observed::new(audit_actor(principal), action.as_str())
            .target(target(EntityKind::Document, id))
            .payload(json!({ "to": to.as_str() }));

        self.mutate(observed, async {
            let (document, grant) = self.guard_document(principal, action, id).await?;
            let planned = document.plan_transition(to, principal.actor_kind())?;

            let mut updated = document.clone();
            updated.apply_status(planned.to, now);
            let record = TransitionRecord::planned(&planned, *id.as_uuid(), now);
            self.store
                .update_document(&updated, document.version, std::slice::from_ref(&record))
                .await?;

            info!(document_id = %id, from = %planned.from, to = %planned.to, "document transitioned");
            Ok(Allowed::new(updated, grant).detail(json!({ "from": planned.from.as_str() })))
        })
        .await
    }

    pub async fn document(&self, principal: &Principal, id: DocumentId) -> Result<Document, DispatchError> {
        let observed = Observed::new(audit_actor(principal), Action::Read.as_str())
            .target(target(EntityKind::Document, id))
            .payload(json!({}));

        self.read(observed, async {
            let (document, grant) = self.guard_document(principal, Action::Read, id).await?;
            Ok(Allowed::new(document, grant))
        })
        .await
    }

    // ---- tax forms ----

    /// Create the engagement's draft form, or replace the draft's content.
    pub async fn save_tax_form(
        &self,
        principal: &Principal,
        engagement_id: EngagementId,
        data: FormData,
        now: DateTime<Utc>,
    ) -> Result<TaxForm, DispatchError> {
        let action = Action::EditTaxForm;
        let observed = Observed::new(audit_actor(principal), action.as_str())
            .target(target(EntityKind::Engagement, engagement_id))
            .payload(json!({ "data": data }));

        self.mutate(observed, async {
            let (_, grant) = self.guard_engagement(principal, action, engagement_id).await?;

            match self.store.tax_form_for(engagement_id).await? {
                Some(form) => {
                    form.ensure_editable(principal.actor_kind())?;
                    let mut updated = form.clone();
                    updated.apply_data(data, now);
                    self.store.update_tax_form(&updated, form.version, &[]).await?;

                    info!(tax_form_id = %form.id, "tax form draft updated");
                    Ok(Allowed::new(updated, grant).detail(json!({ "tax_form_id": form.id })))
                }
                None => {
                    require_end_user(principal, action)?;
                    let form = TaxForm::draft(TaxFormId::new(), engagement_id, data, now);
                    self.store.insert_tax_form(&form).await?;

                    info!(tax_form_id = %form.id, engagement_id = %engagement_id, "tax form drafted");
                    let detail = json!({ "tax_form_id": form.id, "created": true });
                    Ok(Allowed::new(form, grant).detail(detail))
                }
            }
        })
        .await
    }

    /// End-user submission; runs the requirement table once.
    pub async fn submit_tax_form(
        &self,
        principal: &Principal,
        id: TaxFormId,
        now: DateTime<Utc>,
    ) -> Result<TaxForm, DispatchError> {
        self.change_tax_form_status(principal, Action::SubmitTaxForm, id, TaxFormStatus::Submitted, now)
            .await
    }

    /// Staff status change; content is untouched.
    pub async fn transition_tax_form(
        &self,
        principal: &Principal,
        id: TaxFormId,
        to: TaxFormStatus,
        now: DateTime<Utc>,
    ) -> Result<TaxForm, DispatchError> {
        self.change_tax_form_status(principal, Action::TransitionTaxForm, id, to, now)
            .await
    }

    async fn change_tax_form_status(
        &self,
        principal: &Principal,
        action: Action,
        id: TaxFormId,
        to: TaxFormStatus,
        now: DateTime<Utc>,
    ) -> Result<TaxForm, DispatchError> {
        let observed = Observed::new(audit_actor(principal), action.as_str())
            .target(target(EntityKind::TaxForm, id))
            .payload(json!({ "to": to.as_str() }));

        self.mutate(observed, async {
            let (form, grant) = self.guard_tax_form(principal, action, id).await?;
            let planned = form.plan_transition(to, principal.actor_kind(), &self.requirements)?;

            let mut updated = form.clone();
            updated.apply_status(planned.to, now);
            let record = TransitionRecord::planned(&planned, *id.as_uuid(), now);
            self.store
                .update_tax_form(&updated, form.version, std::slice::from_ref(&record))
                .await?;

            info!(tax_form_id = %id, from = %planned.from, to = %planned.to, "tax form transitioned");
            Ok(Allowed::new(updated, grant).detail(json!({ "from": planned.from.as_str() })))
        })
        .await
    }

    pub async fn tax_form(&self, principal: &Principal, id: TaxFormId) -> Result<TaxForm, DispatchError> {
        let observed = Observed::new(audit_actor(principal), Action::Read.as_str())
            .target(target(EntityKind::TaxForm, id))
            .payload(json!({}));

        self.read(observed, async {
            let (form, grant) = self.guard_tax_form(principal, Action::Read, id).await?;
            Ok(Allowed::new(form, grant))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use serde_json::json;

    use taxguard_audit::{AuditEntry, REDACTED, RetryPolicy};
    use taxguard_auth::StaffRole;
    use taxguard_core::UserId;

    use crate::audit_sink::InMemoryAuditSink;
    use crate::store::InMemoryEntityStore;

    type Dispatcher = LifecycleDispatcher<Arc<InMemoryEntityStore>>;

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<InMemoryEntityStore>,
        sink: Arc<InMemoryAuditSink>,
        owner: Principal,
        staff: Principal,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryEntityStore::new());
            let sink = Arc::new(InMemoryAuditSink::new());
            let recorder = AuditRecorder::new(sink.clone()).with_retry(RetryPolicy {
                max_retries: 1,
                min_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(2),
            });
            Self {
                dispatcher: LifecycleDispatcher::new(store.clone(), recorder),
                store,
                sink,
                owner: Principal::end_user(UserId::new()),
                staff: Principal::staff(StaffId::new(), StaffRole::Standard),
            }
        }

        fn entries(&self) -> Vec<AuditEntry> {
            self.sink.entries()
        }

        async fn engagement(&self) -> Engagement {
            let e = self.dispatcher.create_engagement(&self.owner, 2025, now()).await.unwrap();
            let change = AssignmentChange {
                add: [self.staff.as_staff().unwrap()].into_iter().collect(),
                remove: BTreeSet::new(),
            };
            self.dispatcher.assign_staff(&super_staff(), e.id, change, now()).await.unwrap()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn super_staff() -> Principal {
        Principal::staff(StaffId::new(), StaffRole::Super)
    }

    #[tokio::test]
    async fn owner_opens_an_engagement_and_it_is_audited() {
        let f = Fixture::new();
        let e = f.dispatcher.create_engagement(&f.owner, 2025, now()).await.unwrap();
        assert_eq!(e.status, EngagementStatus::Created);
        assert_eq!(Some(e.owner), f.owner.as_end_user());

        let entries = f.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "engagement.create");
        assert_eq!(entries[0].outcome, AuditOutcome::Succeeded);
        assert_eq!(entries[0].target.as_ref().unwrap().id, e.id.to_string());
    }

    #[tokio::test]
    async fn staff_cannot_open_engagements() {
        let f = Fixture::new();
        for p in [f.staff.clone(), super_staff()] {
            let err = f.dispatcher.create_engagement(&p, 2025, now()).await.unwrap_err();
            assert!(matches!(err, DispatchError::Forbidden(_)));
        }
        assert!(f.entries().iter().all(|e| e.outcome == AuditOutcome::denied("forbidden")));
    }

    #[tokio::test]
    async fn unrelated_principals_get_not_found_for_existing_and_missing_rows() {
        let f = Fixture::new();
        let e = f.engagement().await;
        let stranger = Principal::end_user(UserId::new());
        let other_staff = Principal::staff(StaffId::new(), StaffRole::Standard);

        for p in [&stranger, &other_staff] {
            let existing = f.dispatcher.engagement(p, e.id).await.unwrap_err();
            let missing = f.dispatcher.engagement(p, EngagementId::new()).await.unwrap_err();
            assert_eq!(existing, DispatchError::NotFound);
            assert_eq!(existing, missing);

            let existing = f
                .dispatcher
                .transition_engagement(p, e.id, EngagementStatus::DocumentsPending, now())
                .await
                .unwrap_err();
            assert_eq!(existing, DispatchError::NotFound);
        }

        let untouched = f.store.engagement(e.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, EngagementStatus::Created);
    }

    #[tokio::test]
    async fn ordinary_reads_are_not_audited_but_escalations_and_denials_are() {
        let f = Fixture::new();
        let e = f.engagement().await;
        let before = f.entries().len();

        f.dispatcher.engagement(&f.owner, e.id).await.unwrap();
        f.dispatcher.engagement(&f.staff, e.id).await.unwrap();
        assert_eq!(f.entries().len(), before);

        f.dispatcher.engagement(&super_staff(), e.id).await.unwrap();
        let _ = f.dispatcher.engagement(&Principal::end_user(UserId::new()), e.id).await;

        let entries = f.entries();
        assert_eq!(entries.len(), before + 2);
        assert_eq!(entries[before].tag, AuditTag::PrivilegeEscalation);
        assert_eq!(entries[before + 1].outcome, AuditOutcome::denied("not_found"));
    }

    #[tokio::test]
    async fn illegal_edges_are_rejected_and_leave_state_unchanged() {
        let f = Fixture::new();
        let e = f.engagement().await;

        let err = f
            .dispatcher
            .transition_engagement(&f.staff, e.id, EngagementStatus::Filed, now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(LifecycleError::Transition(TransitionError::NoSuchEdge { .. }))));

        // the edge exists but belongs to the end-user
        let err = f
            .dispatcher
            .transition_engagement(&f.staff, e.id, EngagementStatus::DocumentsPending, now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(LifecycleError::Transition(TransitionError::WrongActor { .. }))));

        let stored = f.store.engagement(e.id).await.unwrap().unwrap();
        assert_eq!(stored, e);
        assert!(f.store.transitions(*e.id.as_uuid()).await.unwrap().is_empty());

        let last = f.entries().pop().unwrap();
        assert_eq!(last.outcome, AuditOutcome::denied("wrong_actor"));
    }

    #[tokio::test]
    async fn legal_transition_writes_state_and_history_together() {
        let f = Fixture::new();
        let e = f.engagement().await;

        let moved = f
            .dispatcher
            .transition_engagement(&f.owner, e.id, EngagementStatus::DocumentsPending, now())
            .await
            .unwrap();
        assert_eq!(moved.status, EngagementStatus::DocumentsPending);
        assert_eq!(moved.version, e.version + 1);

        let history = f.store.transitions(*e.id.as_uuid()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from, "created");
        assert_eq!(history[0].to, "documents_pending");
        assert!(!history[0].overridden);
    }

    #[tokio::test]
    async fn concurrent_transitions_have_exactly_one_winner() {
        let f = Fixture::new();
        let e = f.engagement().await;
        let dispatcher = Arc::new(f.dispatcher.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let d = dispatcher.clone();
                let owner = f.owner.clone();
                tokio::spawn(async move {
                    d.transition_engagement(&owner, e.id, EngagementStatus::DocumentsPending, now())
                        .await
                })
            })
            .collect();

        let mut wins = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => wins += 1,
                Err(DispatchError::Conflict(_)) | Err(DispatchError::Rejected(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(f.store.transitions(*e.id.as_uuid()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn override_is_super_only_and_records_exactly_one_override_entry() {
        let f = Fixture::new();
        let e = f.engagement().await;

        let before = f.entries().len();
        let err = f
            .dispatcher
            .override_engagement_status(&f.staff, e.id, EngagementStatus::Filed, "client called", now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        let admin = super_staff();
        let err = f
            .dispatcher
            .override_engagement_status(&admin, e.id, EngagementStatus::Filed, "  ", now())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Rejected(LifecycleError::OverrideReasonRequired));

        let moved = f
            .dispatcher
            .override_engagement_status(&admin, e.id, EngagementStatus::Filed, "filed on paper", now())
            .await
            .unwrap();
        assert_eq!(moved.status, EngagementStatus::Filed);

        let new_entries = &f.entries()[before..];
        assert_eq!(new_entries.len(), 3);
        assert!(new_entries.iter().all(|e| e.tag == AuditTag::Override));
        assert_eq!(new_entries[2].outcome, AuditOutcome::Succeeded);
        assert_eq!(new_entries[2].payload["reason"], "filed on paper");
        assert_eq!(new_entries[2].payload["from"], "created");

        let history = f.store.transitions(*e.id.as_uuid()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].overridden);
    }

    #[tokio::test]
    async fn payment_edge_belongs_to_the_system() {
        let f = Fixture::new();
        let e = f.engagement().await;
        let admin = super_staff();
        f.dispatcher
            .override_engagement_status(&admin, e.id, EngagementStatus::PaymentRequested, "invoice sent", now())
            .await
            .unwrap();

        let err = f
            .dispatcher
            .transition_engagement(&f.staff, e.id, EngagementStatus::PaymentReceived, now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(LifecycleError::Transition(TransitionError::WrongActor { .. }))));

        let paid = f.dispatcher.record_payment_received(e.id, now()).await.unwrap();
        assert_eq!(paid.status, EngagementStatus::PaymentReceived);
        assert_eq!(f.entries().last().unwrap().actor, AuditActor::System);
    }

    #[tokio::test]
    async fn upload_moves_straight_into_review_and_reupload_creates_a_new_row() {
        let f = Fixture::new();
        let e = f.engagement().await;

        let doc = f.dispatcher.request_document(&f.owner, e.id, "T4 slip", now()).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Requested);

        let uploaded = f.dispatcher.upload_document(&f.owner, doc.id, "sha256:aaa", now()).await.unwrap();
        assert_eq!(uploaded.status, DocumentStatus::UnderReview);
        assert_eq!(uploaded.content_digest.as_deref(), Some("sha256:aaa"));
        assert_eq!(f.store.transitions(*doc.id.as_uuid()).await.unwrap().len(), 2);

        // content is immutable once uploaded
        let err = f.dispatcher.upload_document(&f.owner, doc.id, "sha256:bbb", now()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(_)));

        f.dispatcher
            .transition_document(&f.staff, doc.id, DocumentStatus::ReuploadRequested, now())
            .await
            .unwrap();

        let replacement = f.dispatcher.upload_document(&f.owner, doc.id, "sha256:ccc", now()).await.unwrap();
        assert_ne!(replacement.id, doc.id);
        assert_eq!(replacement.supersedes, Some(doc.id));
        assert_eq!(replacement.status, DocumentStatus::UnderReview);

        let original = f.store.document(doc.id).await.unwrap().unwrap();
        assert!(original.archived);
        assert_eq!(original.content_digest.as_deref(), Some("sha256:aaa"));

        let err = f
            .dispatcher
            .transition_document(&f.staff, doc.id, DocumentStatus::Approved, now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(LifecycleError::Archived { .. })));
    }

    #[tokio::test]
    async fn staff_cannot_upload_and_owner_cannot_review() {
        let f = Fixture::new();
        let e = f.engagement().await;
        let doc = f.dispatcher.request_document(&f.owner, e.id, "receipts", now()).await.unwrap();

        let err = f.dispatcher.upload_document(&f.staff, doc.id, "sha256:x", now()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        f.dispatcher.upload_document(&f.owner, doc.id, "sha256:x", now()).await.unwrap();
        let err = f
            .dispatcher
            .transition_document(&f.owner, doc.id, DocumentStatus::Approved, now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));
    }

    fn form(flags: &[(&str, bool)], sections: serde_json::Value) -> FormData {
        serde_json::from_value(json!({
            "flags": flags.iter().map(|(k, v)| (k.to_string(), *v)).collect::<std::collections::BTreeMap<_, _>>(),
            "sections": sections,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn submission_requires_flagged_sections_and_locks_content() {
        let f = Fixture::new();
        let e = f.engagement().await;

        let draft = f
            .dispatcher
            .save_tax_form(&f.owner, e.id, form(&[("hasForeignProperty", true)], json!({})), now())
            .await
            .unwrap();

        let err = f.dispatcher.submit_tax_form(&f.owner, draft.id, now()).await.unwrap_err();
        match &err {
            DispatchError::Rejected(e) => assert_eq!(e.field(), "foreignProperties"),
            other => panic!("unexpected error: {other}"),
        }
        let stored = f.store.tax_form(draft.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaxFormStatus::Draft);

        let fixed = form(
            &[("hasForeignProperty", true)],
            json!({ "foreignProperties": [{ "country": "FR" }] }),
        );
        f.dispatcher.save_tax_form(&f.owner, e.id, fixed, now()).await.unwrap();
        let submitted = f.dispatcher.submit_tax_form(&f.owner, draft.id, now()).await.unwrap();
        assert_eq!(submitted.status, TaxFormStatus::Submitted);

        let err = f
            .dispatcher
            .save_tax_form(&f.owner, e.id, FormData::default(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(LifecycleError::ContentLocked { .. })));

        let processed = f
            .dispatcher
            .transition_tax_form(&f.staff, draft.id, TaxFormStatus::Processed, now())
            .await
            .unwrap();
        assert_eq!(processed.data, submitted.data);
    }

    #[tokio::test]
    async fn staff_never_edit_form_content() {
        let f = Fixture::new();
        let e = f.engagement().await;
        f.dispatcher
            .save_tax_form(&f.owner, e.id, FormData::default(), now())
            .await
            .unwrap();

        let err = f
            .dispatcher
            .save_tax_form(&f.staff, e.id, FormData::default(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        let err = f
            .dispatcher
            .save_tax_form(&super_staff(), e.id, FormData::default(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(LifecycleError::ContentLocked { .. })));
    }

    #[tokio::test]
    async fn sensitive_payload_fields_are_redacted() {
        let f = Fixture::new();
        let e = f.engagement().await;
        let data = form(&[], json!({ "identity": { "sin": "123-456-789", "name": "A" } }));
        f.dispatcher.save_tax_form(&f.owner, e.id, data, now()).await.unwrap();

        let entry = f.entries().pop().unwrap();
        let rendered = entry.payload.to_string();
        assert!(!rendered.contains("123-456-789"));
        assert!(rendered.contains(REDACTED));
    }

    #[tokio::test]
    async fn audit_outage_after_commit_is_surfaced() {
        let f = Fixture::new();
        let e = f.engagement().await;
        f.sink.set_available(false);

        let err = f
            .dispatcher
            .transition_engagement(&f.owner, e.id, EngagementStatus::DocumentsPending, now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Audit(_)));
        assert_eq!(f.dispatcher.audit().persistent_failures(), 1);
    }

    #[tokio::test]
    async fn assignment_changes_are_staff_only() {
        let f = Fixture::new();
        let e = f.engagement().await;
        let change = AssignmentChange {
            add: [StaffId::new()].into_iter().collect(),
            remove: BTreeSet::new(),
        };
        let err = f.dispatcher.assign_staff(&f.owner, e.id, change.clone(), now()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        let updated = f.dispatcher.assign_staff(&f.staff, e.id, change, now()).await.unwrap();
        assert_eq!(updated.assigned_staff.len(), 2);
    }
}
