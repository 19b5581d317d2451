use thiserror::Error;

/// A string could not be read as one of the typed identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {detail}")]
pub struct InvalidId {
    pub kind: &'static str,
    pub detail: String,
}
