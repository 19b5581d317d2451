//! Startup invariant checks.
//!
//! Run once by `main` before the listener is bound, in this order, stopping
//! at the first failure:
//!
//! 1. (a) signing secret present, ≥ 32 bytes, ≥ 10 distinct byte values
//! 2. (b) counter / revocation store reachable
//! 3. (c) primary datastore reachable (schema applied)
//! 4. (d) content-encryption key present, ≥ 32 bytes after hex decoding
//! 5. (e) file-storage directory writable
//! 6. (f) every transition table internally consistent
//!
//! Fault messages name configuration keys, never their values.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use sqlx::PgPool;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use taxguard_infra::config::{self, Settings};
use taxguard_infra::rate_limit::RedisCounterStore;
use taxguard_infra::{CounterStore, EntityStore};

pub const MIN_SECRET_BYTES: usize = 32;
pub const MIN_SECRET_DISTINCT_BYTES: usize = 10;
pub const MIN_CONTENT_KEY_BYTES: usize = 32;

const DATASTORE_MAX_CONNECTIONS: u32 = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationFault {
    #[error("{key} is not set")]
    Missing { key: &'static str },

    #[error("{key} is too weak: {detail}")]
    WeakSecret { key: &'static str, detail: String },

    #[error("counter/revocation store unreachable: {0}")]
    KeyValueStoreUnreachable(String),

    #[error("datastore unreachable: {0}")]
    DatastoreUnreachable(String),

    #[error("storage directory not writable: {0}")]
    StorageNotWritable(String),

    #[error("inconsistent transition tables: {0}")]
    InconsistentTables(String),
}

/// Connected external stores, handed to the service wiring once every check passed.
pub struct Backends {
    pub redis: RedisCounterStore,
    pub pool: PgPool,
}

pub struct StartupChecker {
    settings: Arc<Settings>,
}

impl StartupChecker {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Run every check against the configured Redis and Postgres.
    pub async fn run(&self) -> Result<Backends, ConfigurationFault> {
        check_signing_secret(&self.settings)?;

        let redis_url = self
            .settings
            .redis_url
            .as_deref()
            .ok_or(ConfigurationFault::Missing { key: config::REDIS_URL })?;
        let redis = RedisCounterStore::connect(redis_url)
            .await
            .map_err(|e| ConfigurationFault::KeyValueStoreUnreachable(e.to_string()))?;
        check_key_value_store(&redis).await?;

        let database_url = self
            .settings
            .database_url
            .as_deref()
            .ok_or(ConfigurationFault::Missing { key: config::DATABASE_URL })?;
        let pool = taxguard_infra::postgres::connect(database_url, DATASTORE_MAX_CONNECTIONS)
            .await
            .map_err(|e| ConfigurationFault::DatastoreUnreachable(e.to_string()))?;
        taxguard_infra::postgres::apply_schema(&pool)
            .await
            .map_err(|e| ConfigurationFault::DatastoreUnreachable(e.to_string()))?;
        taxguard_infra::postgres::ping(&pool)
            .await
            .map_err(|e| ConfigurationFault::DatastoreUnreachable(e.to_string()))?;

        self.check_local().await?;
        info!("startup checks passed");
        Ok(Backends { redis, pool })
    }

    /// The same sequence against already-built stores (in-memory deployments, tests).
    pub async fn run_with(
        &self,
        counters: &dyn CounterStore,
        entities: &dyn EntityStore,
    ) -> Result<(), ConfigurationFault> {
        check_signing_secret(&self.settings)?;
        check_key_value_store(counters).await?;
        entities
            .ping()
            .await
            .map_err(|e| ConfigurationFault::DatastoreUnreachable(e.to_string()))?;
        self.check_local().await
    }

    async fn check_local(&self) -> Result<(), ConfigurationFault> {
        check_content_key(&self.settings)?;
        check_storage_dir(&self.settings).await?;
        check_transition_tables()
    }
}

/// (a)
pub fn check_signing_secret(settings: &Settings) -> Result<(), ConfigurationFault> {
    let key = config::SIGNING_SECRET;
    let secret = settings
        .signing_secret
        .as_deref()
        .ok_or(ConfigurationFault::Missing { key })?;

    if secret.len() < MIN_SECRET_BYTES {
        return Err(ConfigurationFault::WeakSecret {
            key,
            detail: format!("{} bytes, need at least {MIN_SECRET_BYTES}", secret.len()),
        });
    }

    let distinct = secret.bytes().collect::<HashSet<u8>>().len();
    if distinct < MIN_SECRET_DISTINCT_BYTES {
        return Err(ConfigurationFault::WeakSecret {
            key,
            detail: format!("{distinct} distinct byte values, need at least {MIN_SECRET_DISTINCT_BYTES}"),
        });
    }

    Ok(())
}

/// (b)
pub async fn check_key_value_store(counters: &dyn CounterStore) -> Result<(), ConfigurationFault> {
    counters
        .ping()
        .await
        .map_err(|e| ConfigurationFault::KeyValueStoreUnreachable(e.to_string()))
}

/// (d)
pub fn check_content_key(settings: &Settings) -> Result<(), ConfigurationFault> {
    let key = config::CONTENT_KEY;
    let decoded = settings
        .content_key_bytes()
        .ok_or(ConfigurationFault::Missing { key })?
        .map_err(|_| ConfigurationFault::WeakSecret {
            key,
            detail: "not valid hex".to_string(),
        })?;

    if decoded.len() < MIN_CONTENT_KEY_BYTES {
        return Err(ConfigurationFault::WeakSecret {
            key,
            detail: format!("{} bytes, need at least {MIN_CONTENT_KEY_BYTES}", decoded.len()),
        });
    }
    Ok(())
}

/// (e) create and remove a probe file.
pub async fn check_storage_dir(settings: &Settings) -> Result<(), ConfigurationFault> {
    let dir = settings
        .storage_dir
        .as_deref()
        .ok_or(ConfigurationFault::Missing { key: config::STORAGE_DIR })?;
    probe_writable(dir).await
}

async fn probe_writable(dir: &Path) -> Result<(), ConfigurationFault> {
    let probe = dir.join(format!(".taxguard-probe-{}", Uuid::now_v7()));
    tokio::fs::write(&probe, b"probe")
        .await
        .map_err(|e| ConfigurationFault::StorageNotWritable(format!("{}: {e}", dir.display())))?;
    tokio::fs::remove_file(&probe)
        .await
        .map_err(|e| ConfigurationFault::StorageNotWritable(format!("{}: {e}", dir.display())))
}

/// (f)
pub fn check_transition_tables() -> Result<(), ConfigurationFault> {
    let defects = taxguard_lifecycle::check_all_tables();
    if defects.is_empty() {
        return Ok(());
    }
    let listed = defects.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("; ");
    Err(ConfigurationFault::InconsistentTables(listed))
}
