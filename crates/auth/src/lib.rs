//! `taxguard-auth`: authentication and authorization boundary.
//!
//! This crate is decoupled from HTTP and storage: revocation is reached through
//! the [`RevocationList`] contract, and the guard is a pure function over an
//! already-resolved [`ResourceScope`].

pub mod authenticate;
pub mod authorize;
pub mod claims;
pub mod principal;
pub mod revocation;
pub mod roles;
pub mod token;

pub use authenticate::{AuthenticationFailure, Authenticator, Session};
pub use authorize::{Action, Audience, AuthzError, Grant, ResourceScope, authorize, authorize_unscoped};
pub use claims::{SessionClaims, SubjectKind, TokenValidationError, validate_claims};
pub use principal::Principal;
pub use revocation::{RevocationError, RevocationList};
pub use roles::StaffRole;
pub use token::{Hs256TokenVerifier, IssuedToken, TokenIssueError, TokenIssuer, TokenVerifier};
