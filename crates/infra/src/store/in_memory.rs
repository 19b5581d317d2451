use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use taxguard_core::{DocumentId, EngagementId, TaxFormId, Versioned};
use taxguard_lifecycle::{Document, Engagement, TaxForm};

use super::{EntityStore, StoreError, TransitionRecord};

#[derive(Debug, Default)]
struct Tables {
    engagements: HashMap<EngagementId, Engagement>,
    documents: HashMap<DocumentId, Document>,
    tax_forms: HashMap<TaxFormId, TaxForm>,
    transitions: Vec<TransitionRecord>,
}

/// In-memory entity store.
///
/// Intended for tests/dev. All tables sit behind one lock, so multi-row
/// commits are atomic.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    tables: RwLock<Tables>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

fn check_version<R: Versioned>(stored: Option<&R>, expected: u64) -> Result<(), StoreError> {
    match stored.map(Versioned::version) {
        None => Err(StoreError::NotFound),
        Some(current) if current == expected => Ok(()),
        Some(current) => Err(StoreError::Conflict(format!(
            "expected version {expected}, found {current}"
        ))),
    }
}

#[async_trait::async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn insert_engagement(&self, engagement: &Engagement) -> Result<(), StoreError> {
        let mut t = self.write()?;
        if t.engagements.contains_key(&engagement.id) {
            return Err(StoreError::Conflict(format!("engagement {} exists", engagement.id)));
        }
        if t
            .engagements
            .values()
            .any(|e| e.owner == engagement.owner && e.filing_year == engagement.filing_year)
        {
            return Err(StoreError::Conflict(format!(
                "an engagement for filing year {} already exists",
                engagement.filing_year
            )));
        }
        t.engagements.insert(engagement.id, engagement.clone());
        Ok(())
    }

    async fn engagement(&self, id: EngagementId) -> Result<Option<Engagement>, StoreError> {
        Ok(self.read()?.engagements.get(&id).cloned())
    }

    async fn update_engagement(
        &self,
        engagement: &Engagement,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        let mut t = self.write()?;
        check_version(t.engagements.get(&engagement.id), expected_version)?;
        t.engagements.insert(engagement.id, engagement.clone());
        t.transitions.extend_from_slice(records);
        Ok(())
    }

    async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        let mut t = self.write()?;
        if !t.engagements.contains_key(&document.engagement_id) {
            return Err(StoreError::NotFound);
        }
        if t.documents.contains_key(&document.id) {
            return Err(StoreError::Conflict(format!("document {} exists", document.id)));
        }
        t.documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.read()?.documents.get(&id).cloned())
    }

    async fn update_document(
        &self,
        document: &Document,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        let mut t = self.write()?;
        check_version(t.documents.get(&document.id), expected_version)?;
        t.documents.insert(document.id, document.clone());
        t.transitions.extend_from_slice(records);
        Ok(())
    }

    async fn replace_document(
        &self,
        archived: &Document,
        expected_version: u64,
        replacement: &Document,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        let mut t = self.write()?;
        check_version(t.documents.get(&archived.id), expected_version)?;
        if t.documents.contains_key(&replacement.id) {
            return Err(StoreError::Conflict(format!("document {} exists", replacement.id)));
        }
        t.documents.insert(archived.id, archived.clone());
        t.documents.insert(replacement.id, replacement.clone());
        t.transitions.extend_from_slice(records);
        Ok(())
    }

    async fn documents_for(&self, engagement_id: EngagementId) -> Result<Vec<Document>, StoreError> {
        let t = self.read()?;
        let mut docs: Vec<Document> = t
            .documents
            .values()
            .filter(|d| d.engagement_id == engagement_id)
            .cloned()
            .collect();
        docs.sort_by_key(|d| (d.created_at, d.id));
        Ok(docs)
    }

    async fn insert_tax_form(&self, form: &TaxForm) -> Result<(), StoreError> {
        let mut t = self.write()?;
        if !t.engagements.contains_key(&form.engagement_id) {
            return Err(StoreError::NotFound);
        }
        if t.tax_forms.values().any(|f| f.engagement_id == form.engagement_id) {
            return Err(StoreError::Conflict("engagement already has a tax form".to_string()));
        }
        t.tax_forms.insert(form.id, form.clone());
        Ok(())
    }

    async fn tax_form(&self, id: TaxFormId) -> Result<Option<TaxForm>, StoreError> {
        Ok(self.read()?.tax_forms.get(&id).cloned())
    }

    async fn tax_form_for(&self, engagement_id: EngagementId) -> Result<Option<TaxForm>, StoreError> {
        Ok(self
            .read()?
            .tax_forms
            .values()
            .find(|f| f.engagement_id == engagement_id)
            .cloned())
    }

    async fn update_tax_form(
        &self,
        form: &TaxForm,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        let mut t = self.write()?;
        check_version(t.tax_forms.get(&form.id), expected_version)?;
        t.tax_forms.insert(form.id, form.clone());
        t.transitions.extend_from_slice(records);
        Ok(())
    }

    async fn transitions(&self, entity_id: Uuid) -> Result<Vec<TransitionRecord>, StoreError> {
        Ok(self
            .read()?
            .transitions
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.read().map(|_| ())
    }
}
