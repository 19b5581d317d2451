//! Postgres audit sink.
//!
//! Appends serialize on a transaction-scoped advisory lock so that reading the
//! chain head and inserting the next link happen as one step. The table
//! carries a trigger rejecting `UPDATE` and `DELETE`.

use std::sync::Arc;

use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use taxguard_audit::{
    AuditActor, AuditEntry, AuditOutcome, AuditSink, AuditStoreError, AuditTag, AuditTarget, PendingEntry,
};
use taxguard_core::AuditEntryId;

use crate::postgres::{is_permanent, is_unique_violation};

/// Advisory lock key guarding the chain head ("audit" in ASCII).
const CHAIN_LOCK: i64 = 0x6175_6469_74;

#[derive(Debug, Clone)]
pub struct PostgresAuditSink {
    pool: Arc<PgPool>,
}

impl PostgresAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait::async_trait]
impl AuditSink for PostgresAuditSink {
    #[instrument(skip(self, entry), fields(audit_id = %entry.id, action = %entry.action), err)]
    async fn append(&self, entry: PendingEntry) -> Result<AuditEntry, AuditStoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CHAIN_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_chain", e))?;

        let head = sqlx::query("SELECT sequence, hash FROM audit_entries ORDER BY sequence DESC LIMIT 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("chain_head", e))?;

        let (sequence, previous_hash) = match head {
            None => (1u64, None),
            Some(row) => {
                let last: i64 = row.try_get("sequence").map_err(decode_error)?;
                let hash: String = row.try_get("hash").map_err(decode_error)?;
                let last = u64::try_from(last).map_err(|_| decode_error_msg("negative sequence"))?;
                (last + 1, Some(hash))
            }
        };

        let sealed = entry.seal(sequence, previous_hash);

        sqlx::query(
            r#"
            INSERT INTO audit_entries
                (sequence, id, recorded_at, actor, action, target_kind, target_id, outcome, tag,
                 payload, corrects, previous_hash, hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(i64::try_from(sealed.sequence).unwrap_or(i64::MAX))
        .bind(sealed.id.as_uuid())
        .bind(sealed.recorded_at)
        .bind(Json(&sealed.actor))
        .bind(&sealed.action)
        .bind(sealed.target.as_ref().map(|t| t.kind.as_str()))
        .bind(sealed.target.as_ref().map(|t| t.id.as_str()))
        .bind(Json(&sealed.outcome))
        .bind(sealed.tag.as_str())
        .bind(&sealed.payload)
        .bind(sealed.corrects.map(|c| *c.as_uuid()))
        .bind(sealed.previous_hash.as_deref())
        .bind(&sealed.hash)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_audit_entry", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(sealed)
    }

    #[instrument(skip(self), err)]
    async fn read_from(&self, after_sequence: u64, limit: usize) -> Result<Vec<AuditEntry>, AuditStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, id, recorded_at, actor, action, target_kind, target_id, outcome, tag,
                   payload, corrects, previous_hash, hash
            FROM audit_entries
            WHERE sequence > $1
            ORDER BY sequence ASC
            LIMIT $2
            "#,
        )
        .bind(i64::try_from(after_sequence).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_from", e))?;

        rows.iter().map(decode_entry).collect()
    }
}

fn decode_entry(row: &sqlx::postgres::PgRow) -> Result<AuditEntry, AuditStoreError> {
    let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
    let id: Uuid = row.try_get("id").map_err(decode_error)?;
    let actor: Json<AuditActor> = row.try_get("actor").map_err(decode_error)?;
    let outcome: Json<AuditOutcome> = row.try_get("outcome").map_err(decode_error)?;
    let tag: String = row.try_get("tag").map_err(decode_error)?;
    let target_kind: Option<String> = row.try_get("target_kind").map_err(decode_error)?;
    let target_id: Option<String> = row.try_get("target_id").map_err(decode_error)?;
    let corrects: Option<Uuid> = row.try_get("corrects").map_err(decode_error)?;

    Ok(AuditEntry {
        id: AuditEntryId::from_uuid(id),
        sequence: u64::try_from(sequence).map_err(|_| decode_error_msg("negative sequence"))?,
        recorded_at: row.try_get("recorded_at").map_err(decode_error)?,
        actor: actor.0,
        action: row.try_get("action").map_err(decode_error)?,
        target: match (target_kind, target_id) {
            (Some(kind), Some(id)) => Some(AuditTarget { kind, id }),
            _ => None,
        },
        outcome: outcome.0,
        tag: AuditTag::parse(&tag).ok_or_else(|| decode_error_msg(&format!("unknown tag '{tag}'")))?,
        payload: row.try_get("payload").map_err(decode_error)?,
        corrects: corrects.map(AuditEntryId::from_uuid),
        previous_hash: row.try_get("previous_hash").map_err(decode_error)?,
        hash: row.try_get("hash").map_err(decode_error)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> AuditStoreError {
    // a duplicate sequence means another writer won the chain head; retrying re-reads it
    if !is_unique_violation(&err) && is_permanent(&err) {
        AuditStoreError::Rejected(format!("{operation}: {err}"))
    } else {
        AuditStoreError::Unavailable(format!("{operation}: {err}"))
    }
}

fn decode_error(err: sqlx::Error) -> AuditStoreError {
    AuditStoreError::Rejected(format!("failed to decode audit row: {err}"))
}

fn decode_error_msg(msg: &str) -> AuditStoreError {
    AuditStoreError::Rejected(format!("failed to decode audit row: {msg}"))
}
