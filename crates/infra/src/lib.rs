//! Infrastructure layer: Postgres, Redis, config, and the guarded execution pipeline.

pub mod audit_sink;
pub mod auth_flow;
pub mod config;
pub mod dispatcher;
pub mod postgres;
pub mod rate_limit;
pub mod revocation;
pub mod store;

pub use auth_flow::{
    AuthFlowError, AuthFlows, CredentialError, CredentialVerifier, LoggingOtpSender, OtpError, OtpSender,
    StaticCredentials, UnconfiguredCredentials,
};
pub use config::{ConfigError, Settings};
pub use dispatcher::{AssignmentChange, DispatchError, EngagementView, LifecycleDispatcher, audit_actor};
pub use rate_limit::{ActionClass, CounterStore, RateLimited, RateLimiter, RateLimits};
pub use store::{EntityStore, StoreError, TransitionRecord};
