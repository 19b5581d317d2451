//! Document lifecycle.
//!
//! # Invariants
//! - A document belongs to exactly one engagement.
//! - Uploaded content is immutable: the digest is set once, on the upload out
//!   of `Requested`. A correction creates a *new* row that supersedes the old
//!   one; the old row is archived and never mutated again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxguard_core::{ActorKind, DocumentId, EngagementId, EntityKind, Versioned};

use crate::error::LifecycleError;
use crate::machine::{Edge, PlannedTransition, StateMachine, Status};

use self::DocumentStatus as S;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Requested,
    Uploaded,
    UnderReview,
    Approved,
    ReuploadRequested,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 5] = [
        DocumentStatus::Requested,
        DocumentStatus::Uploaded,
        DocumentStatus::UnderReview,
        DocumentStatus::Approved,
        DocumentStatus::ReuploadRequested,
    ];
}

impl Status for DocumentStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Requested => "requested",
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::UnderReview => "under_review",
            DocumentStatus::Approved => "approved",
            DocumentStatus::ReuploadRequested => "reupload_requested",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl core::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

static DOCUMENT_EDGES: &[Edge<DocumentStatus>] = &[
    Edge { from: S::Requested, to: S::Uploaded, actors: &[ActorKind::EndUser] },
    Edge { from: S::Uploaded, to: S::UnderReview, actors: &[ActorKind::System] },
    Edge { from: S::UnderReview, to: S::Approved, actors: &[ActorKind::Staff] },
    Edge { from: S::UnderReview, to: S::ReuploadRequested, actors: &[ActorKind::Staff] },
    // realised as a new row; see `Document::plan_reupload`
    Edge { from: S::ReuploadRequested, to: S::Uploaded, actors: &[ActorKind::EndUser] },
];

/// Transition table for documents.
pub struct DocumentMachine;

impl StateMachine for DocumentMachine {
    type State = DocumentStatus;

    const ENTITY: EntityKind = EntityKind::Document;

    fn states() -> &'static [DocumentStatus] {
        &DocumentStatus::ALL
    }

    fn initial() -> DocumentStatus {
        DocumentStatus::Requested
    }

    fn is_terminal(state: DocumentStatus) -> bool {
        state == DocumentStatus::Approved
    }

    fn edges() -> &'static [Edge<DocumentStatus>] {
        DOCUMENT_EDGES
    }
}

/// Document row. The encrypted blob itself lives in external file storage;
/// this row only holds its digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub engagement_id: EngagementId,
    pub label: String,
    pub status: DocumentStatus,
    pub content_digest: Option<String>,
    pub supersedes: Option<DocumentId>,
    pub archived: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a re-upload: the fresh row plus the planned archival of the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reupload {
    pub replacement: Document,
    pub transition: PlannedTransition<DocumentStatus>,
}

impl Document {
    /// Open a document slot in `Requested`.
    pub fn request(
        id: DocumentId,
        engagement_id: EngagementId,
        label: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, LifecycleError> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(LifecycleError::InvalidInput {
                field: "label",
                message: "document label cannot be empty".to_string(),
            });
        }

        Ok(Self {
            id,
            engagement_id,
            label: label.trim().to_string(),
            status: DocumentMachine::initial(),
            content_digest: None,
            supersedes: None,
            archived: false,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    fn ensure_live(&self) -> Result<(), LifecycleError> {
        if self.archived {
            return Err(LifecycleError::Archived {
                entity: EntityKind::Document,
            });
        }
        Ok(())
    }

    fn validate_digest(digest: &str) -> Result<(), LifecycleError> {
        if digest.trim().is_empty() {
            return Err(LifecycleError::InvalidInput {
                field: "content_digest",
                message: "content digest cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Validate a plain status transition (review decisions, automatic intake).
    ///
    /// `ReuploadRequested -> Uploaded` is not a status flip on this row; callers
    /// must go through [`Document::plan_reupload`].
    pub fn plan_transition(
        &self,
        to: DocumentStatus,
        actor: ActorKind,
    ) -> Result<PlannedTransition<DocumentStatus>, LifecycleError> {
        self.ensure_live()?;
        let planned = DocumentMachine::attempt(self.status, to, actor)?;
        if planned.from == DocumentStatus::ReuploadRequested {
            return Err(LifecycleError::ContentLocked {
                entity: EntityKind::Document,
                detail: "corrections are uploaded as a new document".to_string(),
            });
        }
        if planned.to == DocumentStatus::Uploaded {
            return Err(LifecycleError::InvalidInput {
                field: "content_digest",
                message: "uploads must carry content".to_string(),
            });
        }
        Ok(planned)
    }

    /// First upload into a `Requested` slot.
    pub fn plan_upload(
        &self,
        actor: ActorKind,
        digest: &str,
    ) -> Result<PlannedTransition<DocumentStatus>, LifecycleError> {
        self.ensure_live()?;
        if self.status == DocumentStatus::ReuploadRequested {
            return Err(LifecycleError::ContentLocked {
                entity: EntityKind::Document,
                detail: "corrections are uploaded as a new document".to_string(),
            });
        }
        let planned = DocumentMachine::attempt(self.status, DocumentStatus::Uploaded, actor)?;
        if self.content_digest.is_some() {
            return Err(LifecycleError::ContentLocked {
                entity: EntityKind::Document,
                detail: "uploaded content is immutable".to_string(),
            });
        }
        Self::validate_digest(digest)?;
        Ok(planned)
    }

    /// Correction upload: builds the replacement row; the current row is archived.
    pub fn plan_reupload(
        &self,
        actor: ActorKind,
        replacement_id: DocumentId,
        digest: &str,
        now: DateTime<Utc>,
    ) -> Result<Reupload, LifecycleError> {
        self.ensure_live()?;
        let transition = DocumentMachine::attempt(self.status, DocumentStatus::Uploaded, actor)?;
        if self.status != DocumentStatus::ReuploadRequested {
            return Err(LifecycleError::InvalidInput {
                field: "status",
                message: "only documents awaiting re-upload can be replaced".to_string(),
            });
        }
        Self::validate_digest(digest)?;

        let replacement = Document {
            id: replacement_id,
            engagement_id: self.engagement_id,
            label: self.label.clone(),
            status: DocumentStatus::Uploaded,
            content_digest: Some(digest.to_string()),
            supersedes: Some(self.id),
            archived: false,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        Ok(Reupload {
            replacement,
            transition,
        })
    }

    pub fn apply_status(&mut self, to: DocumentStatus, now: DateTime<Utc>) {
        self.status = to;
        self.version += 1;
        self.updated_at = now;
    }

    pub fn apply_upload(&mut self, digest: String, now: DateTime<Utc>) {
        self.content_digest = Some(digest);
        self.apply_status(DocumentStatus::Uploaded, now);
    }

    pub fn apply_archive(&mut self, now: DateTime<Utc>) {
        self.archived = true;
        self.version += 1;
        self.updated_at = now;
    }
}

impl Versioned for Document {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
