use taxguard_auth::{Principal, Session};

/// Network origin of a request, used as the coarse rate-limit dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin(String);

impl RequestOrigin {
    pub fn new(origin: impl Into<String>) -> Self {
        Self(origin.into())
    }

    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Authenticated session for a request.
///
/// Present on every protected route; inserted by the authentication middleware.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    session: Session,
}

impl PrincipalContext {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn principal(&self) -> &Principal {
        &self.session.principal
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
