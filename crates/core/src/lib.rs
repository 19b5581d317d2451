//! `taxguard-core`: identifiers, actor kinds and entity kinds shared by every
//! other crate. No IO lives here.

pub mod actor;
pub mod entity;
pub mod error;
pub mod id;
pub mod version;

pub use actor::ActorKind;
pub use entity::EntityKind;
pub use error::InvalidId;
pub use id::{AuditEntryId, DocumentId, EngagementId, StaffId, TaxFormId, TokenId, UserId};
pub use version::Versioned;
