//! Process configuration.
//!
//! Loaded once at startup into an immutable [`Settings`] value and shared as
//! `Arc<Settings>`. Nothing re-reads the environment per request.
//!
//! Secret material is kept as-is here; whether it is *good enough* is the
//! startup checker's call, so a missing or weak secret is not a [`ConfigError`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::rate_limit::{RateLimitPolicy, RateLimits};

pub const SIGNING_SECRET: &str = "TAXGUARD_SIGNING_SECRET";
pub const CONTENT_KEY: &str = "TAXGUARD_CONTENT_KEY";
pub const DATABASE_URL: &str = "DATABASE_URL";
pub const REDIS_URL: &str = "REDIS_URL";
pub const STORAGE_DIR: &str = "TAXGUARD_STORAGE_DIR";
pub const BIND_ADDR: &str = "TAXGUARD_BIND_ADDR";
pub const TOKEN_TTL_SECS: &str = "TAXGUARD_TOKEN_TTL_SECS";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
pub const MAX_TOKEN_TTL_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Immutable runtime configuration.
#[derive(Clone)]
pub struct Settings {
    pub signing_secret: Option<String>,
    /// Hex-encoded content-encryption key.
    pub content_key: Option<String>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub storage_dir: Option<PathBuf>,
    pub bind_addr: SocketAddr,
    pub token_ttl: Duration,
    pub rate_limits: RateLimits,
}

impl Settings {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = get(BIND_ADDR)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid(BIND_ADDR, e.to_string()))?;

        let token_ttl_secs = parse_u64(&get, TOKEN_TTL_SECS, DEFAULT_TOKEN_TTL_SECS)?;
        if token_ttl_secs == 0 {
            return Err(ConfigError::invalid(TOKEN_TTL_SECS, "must be positive"));
        }
        if token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(ConfigError::invalid(
                TOKEN_TTL_SECS,
                format!("{token_ttl_secs} exceeds the maximum of {MAX_TOKEN_TTL_SECS}"),
            ));
        }

        let defaults = RateLimits::default();
        let rate_limits = RateLimits {
            otp_request: parse_policy(&get, "OTP_REQUEST", defaults.otp_request)?,
            failed_login: parse_policy(&get, "FAILED_LOGIN", defaults.failed_login)?,
            origin: parse_policy(&get, "ORIGIN", defaults.origin)?,
        };

        Ok(Self {
            signing_secret: get(SIGNING_SECRET),
            content_key: get(CONTENT_KEY),
            database_url: get(DATABASE_URL),
            redis_url: get(REDIS_URL),
            storage_dir: get(STORAGE_DIR).map(PathBuf::from),
            bind_addr,
            token_ttl: Duration::from_secs(token_ttl_secs),
            rate_limits,
        })
    }

    /// Decoded content key, if present and valid hex.
    pub fn content_key_bytes(&self) -> Option<Result<Vec<u8>, hex::FromHexError>> {
        self.content_key.as_deref().map(|k| hex::decode(k.trim()))
    }
}

fn parse_u64<G>(get: &G, key: &str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::invalid(key, format!("'{raw}' is not a non-negative integer ({e})"))),
    }
}

fn parse_policy<G>(get: &G, class: &str, default: RateLimitPolicy) -> Result<RateLimitPolicy, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let limit_key = format!("TAXGUARD_RL_{class}_LIMIT");
    let window_key = format!("TAXGUARD_RL_{class}_WINDOW_SECS");

    let limit = parse_u64(get, &limit_key, default.limit)?;
    let window_secs = parse_u64(get, &window_key, default.window.as_secs())?;

    if limit == 0 {
        return Err(ConfigError::invalid(limit_key, "must be positive"));
    }
    if window_secs == 0 {
        return Err(ConfigError::invalid(window_key, "must be positive"));
    }

    Ok(RateLimitPolicy::new(limit, Duration::from_secs(window_secs)))
}

fn mask(value: &Option<String>) -> &'static str {
    match value {
        Some(_) => "<set>",
        None => "<unset>",
    }
}

impl core::fmt::Debug for Settings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Settings")
            .field("signing_secret", &mask(&self.signing_secret))
            .field("content_key", &mask(&self.content_key))
            .field("database_url", &mask(&self.database_url))
            .field("redis_url", &mask(&self.redis_url))
            .field("storage_dir", &self.storage_dir)
            .field("bind_addr", &self.bind_addr)
            .field("token_ttl", &self.token_ttl)
            .field("rate_limits", &self.rate_limits)
            .finish()
    }
}
