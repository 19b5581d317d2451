//! Fixed-window rate limiting over a shared counter store.
//!
//! Every gated request consumes one unit from two independent counters:
//!
//! ```text
//! rl:{class}:identity:{identity}:{window_index}
//! rl:{class}:origin:{origin}:{window_index}
//! ```
//!
//! Both must stay within their limits. Each increment is a single atomic
//! server-side operation in the store. Any store failure throttles the
//! request for a full window.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

pub use in_memory::InMemoryCounterStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCounterStore;

/// Rate-gated action classes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    OtpRequest,
    FailedLogin,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::OtpRequest => "otp_request",
            ActionClass::FailedLogin => "failed_login",
        }
    }
}

impl core::fmt::Display for ActionClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Identity,
    Origin,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Identity => "identity",
            Dimension::Origin => "origin",
        }
    }
}

/// `limit` units per fixed `window`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u64,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    fn window_millis(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX).max(1)
    }

    /// Index of the fixed window containing `now`.
    pub fn window_index(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis().div_euclid(self.window_millis())
    }

    /// Time left until the window containing `now` closes.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        let window = self.window_millis();
        let elapsed = now.timestamp_millis().rem_euclid(window);
        Duration::from_millis(u64::try_from(window - elapsed).unwrap_or(0))
    }
}

/// Per-class identity limits plus the coarser per-origin cap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RateLimits {
    pub otp_request: RateLimitPolicy,
    pub failed_login: RateLimitPolicy,
    pub origin: RateLimitPolicy,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            otp_request: RateLimitPolicy::new(3, Duration::from_secs(600)),
            failed_login: RateLimitPolicy::new(5, Duration::from_secs(600)),
            origin: RateLimitPolicy::new(30, Duration::from_secs(3600)),
        }
    }
}

impl RateLimits {
    pub fn policy(&self, class: ActionClass, dimension: Dimension) -> RateLimitPolicy {
        match (dimension, class) {
            (Dimension::Origin, _) => self.origin,
            (Dimension::Identity, ActionClass::OtpRequest) => self.otp_request,
            (Dimension::Identity, ActionClass::FailedLogin) => self.failed_login,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Shared counter storage.
#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`, setting `ttl` when the key is created.
    /// Returns the count after the increment.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterError>;

    /// Current count without consuming; absent keys read as zero.
    async fn current(&self, key: &str) -> Result<u64, CounterError>;

    async fn ping(&self) -> Result<(), CounterError>;
}

#[async_trait::async_trait]
impl<S> CounterStore for Arc<S>
where
    S: CounterStore + ?Sized,
{
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterError> {
        (**self).increment(key, ttl).await
    }

    async fn current(&self, key: &str) -> Result<u64, CounterError> {
        (**self).current(key).await
    }

    async fn ping(&self) -> Result<(), CounterError> {
        (**self).ping().await
    }
}

/// Why a request was throttled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", content = "dimension", rename_all = "snake_case")]
pub enum ThrottleCause {
    Quota(Dimension),
    /// The counter store could not be consulted.
    StoreUnavailable,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rate limited: {class}; retry after {}s", self.retry_after_secs())]
pub struct RateLimited {
    pub class: ActionClass,
    pub cause: ThrottleCause,
    pub retry_after: Duration,
}

impl RateLimited {
    /// Whole seconds for a `Retry-After` header, never zero.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 { secs + 1 } else { secs };
        rounded.max(1)
    }
}

/// Builds the counter key for one dimension.
pub fn counter_key(class: ActionClass, dimension: Dimension, key: &str, window_index: i64) -> String {
    format!("rl:{}:{}:{}:{}", class.as_str(), dimension.as_str(), key, window_index)
}

fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limits: RateLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    fn dimensions(&self, identity: Option<&str>, origin: &str) -> Vec<(Dimension, String)> {
        let mut dims = Vec::with_capacity(2);
        if let Some(identity) = identity.map(normalize_identity).filter(|i| !i.is_empty()) {
            dims.push((Dimension::Identity, identity));
        }
        dims.push((Dimension::Origin, origin.trim().to_string()));
        dims
    }

    fn unavailable(&self, class: ActionClass, err: &CounterError) -> RateLimited {
        error!(class = class.as_str(), error = %err, "rate limiter store failed; throttling");
        let window = self
            .limits
            .policy(class, Dimension::Identity)
            .window
            .max(self.limits.origin.window);
        RateLimited {
            class,
            cause: ThrottleCause::StoreUnavailable,
            retry_after: window,
        }
    }

    /// Consume one unit from both dimensions; both must stay within limits.
    ///
    /// `identity` may be absent (e.g. a request that never named one); the
    /// origin dimension is always enforced.
    pub async fn check_and_consume(
        &self,
        identity: Option<&str>,
        origin: &str,
        class: ActionClass,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimited> {
        let mut exceeded: Option<RateLimited> = None;

        for (dimension, key) in self.dimensions(identity, origin) {
            let policy = self.limits.policy(class, dimension);
            let counter = counter_key(class, dimension, &key, policy.window_index(now));

            let count = self
                .store
                .increment(&counter, policy.window)
                .await
                .map_err(|e| self.unavailable(class, &e))?;

            if count > policy.limit {
                let retry_after = policy.retry_after(now);
                let longer = exceeded.as_ref().is_none_or(|prev| retry_after > prev.retry_after);
                if longer {
                    exceeded = Some(RateLimited {
                        class,
                        cause: ThrottleCause::Quota(dimension),
                        retry_after,
                    });
                }
            }
        }

        match exceeded {
            None => Ok(()),
            Some(limited) => {
                warn!(
                    class = class.as_str(),
                    cause = ?limited.cause,
                    retry_after_secs = limited.retry_after_secs(),
                    "rate limit exceeded"
                );
                Err(limited)
            }
        }
    }

    /// Whether either dimension has already used its whole quota, without consuming.
    pub async fn ensure_not_locked(
        &self,
        identity: Option<&str>,
        origin: &str,
        class: ActionClass,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimited> {
        for (dimension, key) in self.dimensions(identity, origin) {
            let policy = self.limits.policy(class, dimension);
            let counter = counter_key(class, dimension, &key, policy.window_index(now));

            let count = self
                .store
                .current(&counter)
                .await
                .map_err(|e| self.unavailable(class, &e))?;

            if count >= policy.limit {
                warn!(class = class.as_str(), dimension = dimension.as_str(), "locked out");
                return Err(RateLimited {
                    class,
                    cause: ThrottleCause::Quota(dimension),
                    retry_after: policy.retry_after(now),
                });
            }
        }
        Ok(())
    }

    /// Identity-only lockout check.
    pub async fn is_locked(&self, identity: &str, class: ActionClass, now: DateTime<Utc>) -> bool {
        let policy = self.limits.policy(class, Dimension::Identity);
        let counter = counter_key(
            class,
            Dimension::Identity,
            &normalize_identity(identity),
            policy.window_index(now),
        );
        match self.store.current(&counter).await {
            Ok(count) => count >= policy.limit,
            Err(e) => {
                self.unavailable(class, &e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    struct DownStore;

    #[async_trait::async_trait]
    impl CounterStore for DownStore {
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, CounterError> {
            Err(CounterError::Unavailable("connection refused".into()))
        }

        async fn current(&self, _key: &str) -> Result<u64, CounterError> {
            Err(CounterError::Unavailable("connection refused".into()))
        }

        async fn ping(&self) -> Result<(), CounterError> {
            Err(CounterError::Unavailable("connection refused".into()))
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_400 + secs, 0).single().unwrap()
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryCounterStore::new()), RateLimits::default())
    }

    #[test]
    fn keys_follow_the_documented_layout() {
        assert_eq!(
            counter_key(ActionClass::OtpRequest, Dimension::Identity, "a@b.c", 42),
            "rl:otp_request:identity:a@b.c:42"
        );
    }

    #[test]
    fn retry_after_runs_to_the_window_end() {
        let policy = RateLimitPolicy::new(3, Duration::from_secs(600));
        // 1_700_000_400 is a multiple of 600
        assert_eq!(policy.retry_after(at(0)), Duration::from_secs(600));
        assert_eq!(policy.retry_after(at(100)), Duration::from_secs(500));
        assert_eq!(policy.window_index(at(599)), policy.window_index(at(0)));
        assert_ne!(policy.window_index(at(600)), policy.window_index(at(0)));
    }

    #[tokio::test]
    async fn fourth_otp_request_in_a_window_is_throttled() {
        let limiter = limiter();
        for _ in 0..3 {
            limiter
                .check_and_consume(Some("client@example.com"), "10.0.0.1", ActionClass::OtpRequest, at(10))
                .await
                .unwrap();
        }
        let err = limiter
            .check_and_consume(Some("client@example.com"), "10.0.0.1", ActionClass::OtpRequest, at(20))
            .await
            .unwrap_err();
        assert_eq!(err.cause, ThrottleCause::Quota(Dimension::Identity));
        assert_eq!(err.retry_after_secs(), 580);
    }

    #[tokio::test]
    async fn a_new_window_restores_the_quota() {
        let limiter = limiter();
        for _ in 0..4 {
            let _ = limiter
                .check_and_consume(Some("c@example.com"), "10.0.0.1", ActionClass::OtpRequest, at(10))
                .await;
        }
        assert!(limiter
            .check_and_consume(Some("c@example.com"), "10.0.0.1", ActionClass::OtpRequest, at(610))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn identities_are_case_insensitive() {
        let limiter = limiter();
        for identity in ["A@B.C", "a@b.c", " a@B.c "] {
            limiter
                .check_and_consume(Some(identity), "10.0.0.1", ActionClass::OtpRequest, at(0))
                .await
                .unwrap();
        }
        assert!(limiter
            .check_and_consume(Some("a@b.c"), "10.0.0.1", ActionClass::OtpRequest, at(0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn origin_cap_spans_identities() {
        let limits = RateLimits {
            origin: RateLimitPolicy::new(2, Duration::from_secs(3600)),
            ..RateLimits::default()
        };
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()), limits);

        for who in ["a@x.io", "b@x.io"] {
            limiter
                .check_and_consume(Some(who), "203.0.113.9", ActionClass::OtpRequest, at(0))
                .await
                .unwrap();
        }
        let err = limiter
            .check_and_consume(Some("c@x.io"), "203.0.113.9", ActionClass::OtpRequest, at(1))
            .await
            .unwrap_err();
        assert_eq!(err.cause, ThrottleCause::Quota(Dimension::Origin));

        // a different origin is unaffected
        assert!(limiter
            .check_and_consume(Some("c@x.io"), "198.51.100.7", ActionClass::OtpRequest, at(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unreachable_store_throttles() {
        let limiter = RateLimiter::new(Arc::new(DownStore), RateLimits::default());
        let err = limiter
            .check_and_consume(Some("a@b.c"), "10.0.0.1", ActionClass::OtpRequest, at(0))
            .await
            .unwrap_err();
        assert_eq!(err.cause, ThrottleCause::StoreUnavailable);
        assert_eq!(err.retry_after, Duration::from_secs(3600));

        assert!(limiter.is_locked("a@b.c", ActionClass::FailedLogin, at(0)).await);
        assert!(limiter
            .ensure_not_locked(Some("a@b.c"), "10.0.0.1", ActionClass::FailedLogin, at(0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn lockout_peeks_without_consuming() {
        let limiter = limiter();
        for _ in 0..4 {
            let _ = limiter
                .check_and_consume(Some("a@b.c"), "10.0.0.1", ActionClass::FailedLogin, at(0))
                .await;
        }
        for _ in 0..10 {
            assert!(!limiter.is_locked("a@b.c", ActionClass::FailedLogin, at(1)).await);
        }
        let _ = limiter
            .check_and_consume(Some("a@b.c"), "10.0.0.1", ActionClass::FailedLogin, at(2))
            .await;
        assert!(limiter.is_locked("a@b.c", ActionClass::FailedLogin, at(3)).await);
        assert!(!limiter.is_locked("a@b.c", ActionClass::FailedLogin, at(601)).await);
    }

    proptest! {
        #[test]
        fn retry_after_never_exceeds_the_window(offset in 0i64..10_000_000, window_secs in 1u64..86_400) {
            let policy = RateLimitPolicy::new(1, Duration::from_secs(window_secs));
            let now = at(offset);
            let wait = policy.retry_after(now);
            prop_assert!(wait > Duration::ZERO);
            prop_assert!(wait <= policy.window);

            let reopened = now + chrono::Duration::from_std(wait).unwrap();
            prop_assert_eq!(policy.window_index(reopened), policy.window_index(now) + 1);
        }
    }
}
