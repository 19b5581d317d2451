//! Storage for the token revocation set.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryRevocationList;
#[cfg(feature = "redis")]
pub use self::redis::RedisRevocationList;

/// Key under which a revoked token id is stored.
pub fn revocation_key(token_id: &taxguard_core::TokenId) -> String {
    format!("revoked:{token_id}")
}
