//! Postgres-backed entity store.
//!
//! ## Error Mapping
//!
//! | SQLx error | Code | StoreError | Scenario |
//! |---|---|---|---|
//! | Database (unique violation) | `23505` | `Conflict` | duplicate engagement per filing year, second tax form |
//! | Database (foreign key violation) | `23503` | `NotFound` | child row for a missing engagement |
//! | decode failures | n/a | `Corrupt` | unknown status string in a row |
//! | anything else | n/a | `Unavailable` | pool closed, network errors |
//!
//! ## Optimistic Concurrency
//!
//! Updates run inside a transaction:
//! 1. `UPDATE ... WHERE id = $1 AND version = $expected`
//! 2. zero rows affected → roll back; `NotFound` if the row is gone, else `Conflict`
//! 3. insert the transition records
//! 4. commit
//!
//! A concurrent writer from the same version either commits first or finds
//! its `WHERE` clause no longer matching.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use taxguard_core::{ActorKind, DocumentId, EngagementId, EntityKind, StaffId, TaxFormId, UserId};
use taxguard_lifecycle::{
    Document, DocumentStatus, Engagement, EngagementStatus, FormData, Status, TaxForm, TaxFormStatus,
};

use super::{EntityStore, StoreError, TransitionRecord};
use crate::postgres::is_unique_violation;

#[derive(Debug, Clone)]
pub struct PostgresEntityStore {
    pool: Arc<PgPool>,
}

impl PostgresEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(|e| map_sqlx_error(operation, e))
    }
}

async fn insert_transition(
    tx: &mut Transaction<'static, Postgres>,
    record: &TransitionRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO status_transitions (entity, entity_id, from_status, to_status, actor, overridden, at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(record.entity.as_str())
    .bind(record.entity_id)
    .bind(&record.from)
    .bind(&record.to)
    .bind(record.actor.as_str())
    .bind(record.overridden)
    .bind(record.at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_transition", e))?;
    Ok(())
}

/// Roll back after a zero-row update, telling a vanished row from a stale version.
async fn missed_update(
    mut tx: Transaction<'static, Postgres>,
    table: &'static str,
    id: Uuid,
    expected_version: u64,
) -> StoreError {
    let found: Result<Option<i64>, sqlx::Error> =
        sqlx::query_scalar(&format!("SELECT version FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await;
    let _ = tx.rollback().await;

    match found {
        Ok(None) => StoreError::NotFound,
        Ok(Some(current)) => StoreError::Conflict(format!(
            "expected version {expected_version}, found {current}"
        )),
        Err(e) => map_sqlx_error("missed_update", e),
    }
}

/// Finish an update: on a hit, record the transition and commit.
async fn finish_update(
    mut tx: Transaction<'static, Postgres>,
    rows_affected: u64,
    table: &'static str,
    id: Uuid,
    expected_version: u64,
    records: &[TransitionRecord],
) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(missed_update(tx, table, id, expected_version).await);
    }
    for record in records {
        insert_transition(&mut tx, record).await?;
    }
    tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
}

fn db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl EntityStore for PostgresEntityStore {
    #[instrument(skip(self, engagement), fields(engagement_id = %engagement.id), err)]
    async fn insert_engagement(&self, engagement: &Engagement) -> Result<(), StoreError> {
        let staff: Vec<Uuid> = engagement.assigned_staff.iter().map(|s| *s.as_uuid()).collect();
        sqlx::query(
            r#"
            INSERT INTO engagements
                (id, owner_id, filing_year, status, assigned_staff, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(engagement.id.as_uuid())
        .bind(engagement.owner.as_uuid())
        .bind(engagement.filing_year)
        .bind(engagement.status.as_str())
        .bind(&staff)
        .bind(db_version(engagement.version))
        .bind(engagement.created_at)
        .bind(engagement.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_engagement", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(engagement_id = %id), err)]
    async fn engagement(&self, id: EngagementId) -> Result<Option<Engagement>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, filing_year, status, assigned_staff, version, created_at, updated_at
            FROM engagements
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("engagement", e))?;

        row.map(|r| EngagementRow::from_row(&r).and_then(Engagement::try_from))
            .transpose()
    }

    #[instrument(skip(self, engagement, records), fields(engagement_id = %engagement.id), err)]
    async fn update_engagement(
        &self,
        engagement: &Engagement,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.begin("update_engagement").await?;
        let staff: Vec<Uuid> = engagement.assigned_staff.iter().map(|s| *s.as_uuid()).collect();

        let result = sqlx::query(
            r#"
            UPDATE engagements
            SET status = $2, assigned_staff = $3, version = $4, updated_at = $5
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(engagement.id.as_uuid())
        .bind(engagement.status.as_str())
        .bind(&staff)
        .bind(db_version(engagement.version))
        .bind(engagement.updated_at)
        .bind(db_version(expected_version))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_engagement", e))?;

        finish_update(
            tx,
            result.rows_affected(),
            "engagements",
            *engagement.id.as_uuid(),
            expected_version,
            records,
        )
        .await
    }

    #[instrument(skip(self, document), fields(document_id = %document.id), err)]
    async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        insert_document_row(&*self.pool, document).await
    }

    #[instrument(skip(self), fields(document_id = %id), err)]
    async fn document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(&format!("{DOCUMENT_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("document", e))?;

        row.map(|r| DocumentRow::from_row(&r).and_then(Document::try_from))
            .transpose()
    }

    #[instrument(skip(self, document, records), fields(document_id = %document.id), err)]
    async fn update_document(
        &self,
        document: &Document,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.begin("update_document").await?;
        let rows = update_document_row(&mut tx, document, expected_version).await?;
        finish_update(tx, rows, "documents", *document.id.as_uuid(), expected_version, records).await
    }

    #[instrument(
        skip(self, archived, replacement, records),
        fields(document_id = %archived.id, replacement_id = %replacement.id),
        err
    )]
    async fn replace_document(
        &self,
        archived: &Document,
        expected_version: u64,
        replacement: &Document,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.begin("replace_document").await?;

        let rows = update_document_row(&mut tx, archived, expected_version).await?;
        if rows == 0 {
            return Err(missed_update(tx, "documents", *archived.id.as_uuid(), expected_version).await);
        }

        if let Err(e) = insert_document_row(&mut *tx, replacement).await {
            let _ = tx.rollback().await;
            return Err(e);
        }

        for record in records {
            insert_transition(&mut tx, record).await?;
        }
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(
        skip(self),
        fields(engagement_id = %engagement_id, document_count = tracing::field::Empty),
        err
    )]
    async fn documents_for(&self, engagement_id: EngagementId) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query(&format!(
            "{DOCUMENT_COLUMNS} WHERE engagement_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(engagement_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("documents_for", e))?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            documents.push(Document::try_from(DocumentRow::from_row(&row)?)?);
        }
        Span::current().record("document_count", documents.len());
        Ok(documents)
    }

    #[instrument(skip(self, form), fields(tax_form_id = %form.id), err)]
    async fn insert_tax_form(&self, form: &TaxForm) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tax_forms (id, engagement_id, status, data, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(form.id.as_uuid())
        .bind(form.engagement_id.as_uuid())
        .bind(form.status.as_str())
        .bind(Json(&form.data))
        .bind(db_version(form.version))
        .bind(form.created_at)
        .bind(form.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_tax_form", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tax_form_id = %id), err)]
    async fn tax_form(&self, id: TaxFormId) -> Result<Option<TaxForm>, StoreError> {
        let row = sqlx::query(&format!("{TAX_FORM_COLUMNS} WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tax_form", e))?;

        row.map(|r| TaxFormRow::from_row(&r).and_then(TaxForm::try_from))
            .transpose()
    }

    #[instrument(skip(self), fields(engagement_id = %engagement_id), err)]
    async fn tax_form_for(&self, engagement_id: EngagementId) -> Result<Option<TaxForm>, StoreError> {
        let row = sqlx::query(&format!("{TAX_FORM_COLUMNS} WHERE engagement_id = $1"))
            .bind(engagement_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tax_form_for", e))?;

        row.map(|r| TaxFormRow::from_row(&r).and_then(TaxForm::try_from))
            .transpose()
    }

    #[instrument(skip(self, form, records), fields(tax_form_id = %form.id), err)]
    async fn update_tax_form(
        &self,
        form: &TaxForm,
        expected_version: u64,
        records: &[TransitionRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.begin("update_tax_form").await?;

        let result = sqlx::query(
            r#"
            UPDATE tax_forms
            SET status = $2, data = $3, version = $4, updated_at = $5
            WHERE id = $1 AND version = $6
            "#,
        )
        .bind(form.id.as_uuid())
        .bind(form.status.as_str())
        .bind(Json(&form.data))
        .bind(db_version(form.version))
        .bind(form.updated_at)
        .bind(db_version(expected_version))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_tax_form", e))?;

        finish_update(
            tx,
            result.rows_affected(),
            "tax_forms",
            *form.id.as_uuid(),
            expected_version,
            records,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn transitions(&self, entity_id: Uuid) -> Result<Vec<TransitionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity, entity_id, from_status, to_status, actor, overridden, at
            FROM status_transitions
            WHERE entity_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transitions", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let entity: String = row.try_get("entity").map_err(decode_error)?;
            let actor: String = row.try_get("actor").map_err(decode_error)?;
            records.push(TransitionRecord {
                entity: EntityKind::parse(&entity)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown entity kind '{entity}'")))?,
                entity_id: row.try_get("entity_id").map_err(decode_error)?,
                from: row.try_get("from_status").map_err(decode_error)?,
                to: row.try_get("to_status").map_err(decode_error)?,
                actor: ActorKind::parse(&actor)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown actor kind '{actor}'")))?,
                overridden: row.try_get("overridden").map_err(decode_error)?,
                at: row.try_get("at").map_err(decode_error)?,
            });
        }
        Ok(records)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        crate::postgres::ping(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))
    }
}

const DOCUMENT_COLUMNS: &str = r#"
    SELECT id, engagement_id, label, status, content_digest, supersedes, archived, version,
           created_at, updated_at
    FROM documents
"#;

const TAX_FORM_COLUMNS: &str = r#"
    SELECT id, engagement_id, status, data, version, created_at, updated_at
    FROM tax_forms
"#;

async fn insert_document_row<'e, E>(executor: E, document: &Document) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO documents
            (id, engagement_id, label, status, content_digest, supersedes, archived, version,
             created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(document.id.as_uuid())
    .bind(document.engagement_id.as_uuid())
    .bind(&document.label)
    .bind(document.status.as_str())
    .bind(document.content_digest.as_deref())
    .bind(document.supersedes.map(|d| *d.as_uuid()))
    .bind(document.archived)
    .bind(db_version(document.version))
    .bind(document.created_at)
    .bind(document.updated_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("insert_document", e))?;
    Ok(())
}

/// Version-checked update; the content digest is only ever set, never changed.
async fn update_document_row(
    tx: &mut Transaction<'static, Postgres>,
    document: &Document,
    expected_version: u64,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE documents
        SET status = $2,
            content_digest = COALESCE(content_digest, $3),
            archived = $4,
            version = $5,
            updated_at = $6
        WHERE id = $1 AND version = $7 AND archived = FALSE
        "#,
    )
    .bind(document.id.as_uuid())
    .bind(document.status.as_str())
    .bind(document.content_digest.as_deref())
    .bind(document.archived)
    .bind(db_version(document.version))
    .bind(document.updated_at)
    .bind(db_version(expected_version))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_document", e))?;
    Ok(result.rows_affected())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        return StoreError::Conflict(format!("{operation}: {err}"));
    }
    match &err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23503") => StoreError::NotFound,
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("{operation}: {err}"))
        }
        _ => StoreError::Unavailable(format!("{operation}: {err}")),
    }
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to decode row: {err}"))
}

fn parse_status<S: Status>(raw: &str) -> Result<S, StoreError> {
    S::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("unknown status '{raw}'")))
}

fn from_db_version(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version).map_err(|_| StoreError::Corrupt(format!("negative version {version}")))
}

// Row representations; decoding mirrors the column lists above.

struct EngagementRow {
    id: Uuid,
    owner_id: Uuid,
    filing_year: i32,
    status: String,
    assigned_staff: Vec<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EngagementRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.try_get("id").map_err(decode_error)?,
            owner_id: row.try_get("owner_id").map_err(decode_error)?,
            filing_year: row.try_get("filing_year").map_err(decode_error)?,
            status: row.try_get("status").map_err(decode_error)?,
            assigned_staff: row.try_get("assigned_staff").map_err(decode_error)?,
            version: row.try_get("version").map_err(decode_error)?,
            created_at: row.try_get("created_at").map_err(decode_error)?,
            updated_at: row.try_get("updated_at").map_err(decode_error)?,
        })
    }
}

impl TryFrom<EngagementRow> for Engagement {
    type Error = StoreError;

    fn try_from(row: EngagementRow) -> Result<Self, Self::Error> {
        Ok(Engagement {
            id: EngagementId::from_uuid(row.id),
            owner: UserId::from_uuid(row.owner_id),
            filing_year: row.filing_year,
            status: parse_status::<EngagementStatus>(&row.status)?,
            assigned_staff: row.assigned_staff.into_iter().map(StaffId::from_uuid).collect(),
            version: from_db_version(row.version)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct DocumentRow {
    id: Uuid,
    engagement_id: Uuid,
    label: String,
    status: String,
    content_digest: Option<String>,
    supersedes: Option<Uuid>,
    archived: bool,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DocumentRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.try_get("id").map_err(decode_error)?,
            engagement_id: row.try_get("engagement_id").map_err(decode_error)?,
            label: row.try_get("label").map_err(decode_error)?,
            status: row.try_get("status").map_err(decode_error)?,
            content_digest: row.try_get("content_digest").map_err(decode_error)?,
            supersedes: row.try_get("supersedes").map_err(decode_error)?,
            archived: row.try_get("archived").map_err(decode_error)?,
            version: row.try_get("version").map_err(decode_error)?,
            created_at: row.try_get("created_at").map_err(decode_error)?,
            updated_at: row.try_get("updated_at").map_err(decode_error)?,
        })
    }
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        Ok(Document {
            id: DocumentId::from_uuid(row.id),
            engagement_id: EngagementId::from_uuid(row.engagement_id),
            label: row.label,
            status: parse_status::<DocumentStatus>(&row.status)?,
            content_digest: row.content_digest,
            supersedes: row.supersedes.map(DocumentId::from_uuid),
            archived: row.archived,
            version: from_db_version(row.version)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct TaxFormRow {
    id: Uuid,
    engagement_id: Uuid,
    status: String,
    data: FormData,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaxFormRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, StoreError> {
        let data: Json<FormData> = row.try_get("data").map_err(decode_error)?;
        Ok(Self {
            id: row.try_get("id").map_err(decode_error)?,
            engagement_id: row.try_get("engagement_id").map_err(decode_error)?,
            status: row.try_get("status").map_err(decode_error)?,
            data: data.0,
            version: row.try_get("version").map_err(decode_error)?,
            created_at: row.try_get("created_at").map_err(decode_error)?,
            updated_at: row.try_get("updated_at").map_err(decode_error)?,
        })
    }
}

impl TryFrom<TaxFormRow> for TaxForm {
    type Error = StoreError;

    fn try_from(row: TaxFormRow) -> Result<Self, Self::Error> {
        Ok(TaxForm {
            id: TaxFormId::from_uuid(row.id),
            engagement_id: EngagementId::from_uuid(row.engagement_id),
            status: parse_status::<TaxFormStatus>(&row.status)?,
            data: row.data,
            version: from_db_version(row.version)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
