//! Service wiring: stores, rate limiter, authenticator, audit recorder, dispatcher.
//!
//! Two deployments share one shape:
//!
//! - `in_memory`: in-process stores (dev/test, black-box tests)
//! - `persistent`: Postgres entity/audit tables + Redis counters/revocations

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use taxguard_audit::{AuditRecorder, AuditSink};
use taxguard_auth::{Authenticator, Hs256TokenVerifier, RevocationList, TokenIssuer};
use taxguard_infra::audit_sink::{InMemoryAuditSink, PostgresAuditSink};
use taxguard_infra::rate_limit::InMemoryCounterStore;
use taxguard_infra::revocation::{InMemoryRevocationList, RedisRevocationList};
use taxguard_infra::store::{InMemoryEntityStore, PostgresEntityStore};
use taxguard_infra::{
    AuthFlows, CounterStore, CredentialVerifier, EntityStore, LifecycleDispatcher, LoggingOtpSender, OtpSender,
    RateLimiter, Settings,
};

use crate::middleware::AuthState;
use crate::startup::Backends;

pub type Dispatcher = LifecycleDispatcher<Arc<dyn EntityStore>>;

/// The storage side of a deployment.
pub struct Stores {
    pub entities: Arc<dyn EntityStore>,
    pub audit: Arc<dyn AuditSink>,
    pub counters: Arc<dyn CounterStore>,
    pub revocations: Arc<dyn RevocationList>,
}

impl Stores {
    /// In-process stores. Intended for tests/dev.
    pub fn in_memory() -> Self {
        Self {
            entities: Arc::new(InMemoryEntityStore::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
            counters: Arc::new(InMemoryCounterStore::new()),
            revocations: Arc::new(InMemoryRevocationList::new()),
        }
    }

    pub fn persistent(backends: Backends) -> Self {
        let Backends { redis, pool } = backends;
        let revocations = RedisRevocationList::new(redis.connection());
        Self {
            entities: Arc::new(PostgresEntityStore::new(pool.clone())),
            audit: Arc::new(PostgresAuditSink::new(pool)),
            counters: Arc::new(redis),
            revocations: Arc::new(revocations),
        }
    }
}

/// Pluggable external collaborators.
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialVerifier>,
    pub otp: Arc<dyn OtpSender>,
}

impl Collaborators {
    pub fn new(credentials: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            credentials,
            otp: Arc::new(LoggingOtpSender),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub datastore: bool,
    pub key_value_store: bool,
    pub audit_persistent_failures: u64,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.datastore && self.key_value_store
    }
}

#[derive(Clone)]
pub struct AppServices {
    pub settings: Arc<Settings>,
    pub dispatcher: Dispatcher,
    pub auth: AuthFlows,
    pub audit: AuditRecorder,
    entities: Arc<dyn EntityStore>,
    counters: Arc<dyn CounterStore>,
}

impl AppServices {
    pub fn new(settings: Arc<Settings>, stores: Stores, collaborators: Collaborators) -> Self {
        let secret = settings.signing_secret.clone().unwrap_or_default();
        let ttl = chrono::Duration::from_std(settings.token_ttl).unwrap_or_else(|_| {
            warn!("token ttl out of range; using one hour");
            chrono::Duration::hours(1)
        });

        let audit = AuditRecorder::new(stores.audit);
        let authenticator = Authenticator::new(
            Arc::new(Hs256TokenVerifier::new(secret.as_bytes())),
            stores.revocations,
        );
        let limiter = RateLimiter::new(stores.counters.clone(), settings.rate_limits);
        let auth = AuthFlows::new(
            limiter,
            collaborators.credentials,
            collaborators.otp,
            Arc::new(TokenIssuer::new(secret.as_bytes(), ttl)),
            authenticator,
            audit.clone(),
        );

        Self {
            dispatcher: LifecycleDispatcher::new(stores.entities.clone(), audit.clone()),
            settings,
            auth,
            audit,
            entities: stores.entities,
            counters: stores.counters,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            authenticator: self.auth.authenticator().clone(),
            audit: self.audit.clone(),
        }
    }

    pub async fn readiness(&self) -> Readiness {
        let datastore = match self.entities.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "datastore ping failed");
                false
            }
        };
        let key_value_store = match self.counters.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "key-value store ping failed");
                false
            }
        };
        Readiness {
            datastore,
            key_value_store,
            audit_persistent_failures: self.audit.persistent_failures(),
        }
    }
}
