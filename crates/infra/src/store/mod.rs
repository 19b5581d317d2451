//! Entity state storage.
//!
//! Every update is a compare-and-swap on the row version: the caller loads a
//! row, validates the change with the lifecycle rules, and commits it only if
//! the stored version is still the one it read. A second writer racing from
//! the same version gets [`StoreError::Conflict`]. A status change is written
//! together with its [`TransitionRecord`] or not at all.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use taxguard_core::{ActorKind, DocumentId, EngagementId, EntityKind, TaxFormId};
use taxguard_lifecycle::{Document, Engagement, PlannedTransition, Status, TaxForm};

pub use in_memory::InMemoryEntityStore;
pub use postgres::PostgresEntityStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    /// Stale version or uniqueness violation.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// The side-effect record of a committed status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub entity: EntityKind,
    pub entity_id: Uuid,
    pub from: String,
    pub to: String,
    pub actor: ActorKind,
    /// Written by a superuser override rather than a table edge.
    pub overridden: bool,
    pub at: DateTime<Utc>,
}

impl TransitionRecord {
    pub fn planned<S: Status>(planned: &PlannedTransition<S>, entity_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            entity: planned.entity,
            entity_id,
            from: planned.from.as_str().to_string(),
            to: planned.to.as_str().to_string(),
            actor: planned.actor,
            overridden: false,
            at,
        }
    }

    pub fn overridden(mut self) -> Self {
        self.overridden = true;
        self
    }
}

#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] if the owner already has an
    /// engagement for that filing year.
    async fn insert_engagement(&self, engagement: &Engagement) -> Result<(), StoreError>;

    async fn engagement(&self, id: EngagementId) -> Result<Option<Engagement>, StoreError>;

    /// Replace the row if its stored version is still `expected_version`.
    async fn update_engagement(
        &self,
        engagement: &Engagement,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError>;

    async fn insert_document(&self, document: &Document) -> Result<(), StoreError>;

    async fn document(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    async fn update_document(
        &self,
        document: &Document,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError>;

    /// Archive `archived` (version-checked) and insert `replacement`, atomically.
    async fn replace_document(
        &self,
        archived: &Document,
        expected_version: u64,
        replacement: &Document,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError>;

    /// Documents of an engagement, archived ones included, oldest first.
    async fn documents_for(&self, engagement_id: EngagementId) -> Result<Vec<Document>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the engagement already has a form.
    async fn insert_tax_form(&self, form: &TaxForm) -> Result<(), StoreError>;

    async fn tax_form(&self, id: TaxFormId) -> Result<Option<TaxForm>, StoreError>;

    async fn tax_form_for(&self, engagement_id: EngagementId) -> Result<Option<TaxForm>, StoreError>;

    async fn update_tax_form(
        &self,
        form: &TaxForm,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError>;

    /// Transition records for one entity, oldest first.
    async fn transitions(&self, entity_id: Uuid) -> Result<Vec<TransitionRecord>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<S> EntityStore for Arc<S>
where
    S: EntityStore + ?Sized,
{
    async fn insert_engagement(&self, engagement: &Engagement) -> Result<(), StoreError> {
        (**self).insert_engagement(engagement).await
    }

    async fn engagement(&self, id: EngagementId) -> Result<Option<Engagement>, StoreError> {
        (**self).engagement(id).await
    }

    async fn update_engagement(
        &self,
        engagement: &Engagement,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        (**self).update_engagement(engagement, expected_version, records).await
    }

    async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        (**self).insert_document(document).await
    }

    async fn document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        (**self).document(id).await
    }

    async fn update_document(
        &self,
        document: &Document,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        (**self).update_document(document, expected_version, records).await
    }

    async fn replace_document(
        &self,
        archived: &Document,
        expected_version: u64,
        replacement: &Document,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        (**self)
            .replace_document(archived, expected_version, replacement, records)
            .await
    }

    async fn documents_for(&self, engagement_id: EngagementId) -> Result<Vec<Document>, StoreError> {
        (**self).documents_for(engagement_id).await
    }

    async fn insert_tax_form(&self, form: &TaxForm) -> Result<(), StoreError> {
        (**self).insert_tax_form(form).await
    }

    async fn tax_form(&self, id: TaxFormId) -> Result<Option<TaxForm>, StoreError> {
        (**self).tax_form(id).await
    }

    async fn tax_form_for(&self, engagement_id: EngagementId) -> Result<Option<TaxForm>, StoreError> {
        (**self).tax_form_for(engagement_id).await
    }

    async fn update_tax_form(
        &self,
        form: &TaxForm,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        (**self).update_tax_form(form, expected_version, records).await
    }

    async fn transitions(&self, entity_id: Uuid) -> Result<Vec<TransitionRecord>, StoreError> {
        (**self).transitions(entity_id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }
}
