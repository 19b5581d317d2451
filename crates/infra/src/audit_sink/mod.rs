//! Audit trail storage.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryAuditSink;
pub use postgres::PostgresAuditSink;
