//! HTTP API: routing, middleware, error mapping and startup checks.

pub mod app;
pub mod context;
pub mod middleware;
pub mod startup;
