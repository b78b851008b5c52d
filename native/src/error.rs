//! Error types for the native layer.
//!
//! These never cross the boundary as values: they are rendered into the
//! failure string handed to `on_failure`.

use thiserror::Error;

/// All possible errors from the reference native engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Boundary errors
    #[error("invalid {0} handle")]
    InvalidHandle(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    // Lookup errors
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("provider not reachable: {0}")]
    ProviderUnreachable(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("author not found: {0}")]
    AuthorNotFound(String),

    #[error("tag not found: {0}")]
    TagNotFound(String),

    // State errors
    #[error("docs not enabled on this node")]
    DocsDisabled,

    #[error("node is shut down")]
    NodeShutDown,

    #[error("document is read-only")]
    ReadOnly,

    #[error("injected failure: {0}")]
    Injected(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result type for native operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::InvalidHandle("node");
        assert_eq!(err.to_string(), "invalid node handle");

        let err = Error::BlobNotFound("abc".into());
        assert_eq!(err.to_string(), "blob not found: abc");

        assert_eq!(Error::DocsDisabled.to_string(), "docs not enabled on this node");
    }
}
