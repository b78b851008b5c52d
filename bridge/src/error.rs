//! Unified error handling for the bridge.

use std::fmt;

use crate::config::ConfigError;

/// The bridged operations, named in failure messages and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Close,
    Info,
    Put,
    Get,
    GetWithProgress,
    ValidateTicket,
    CreateTicket,
    TagSet,
    TagDelete,
    CreateAuthor,
    ImportAuthor,
    CreateDoc,
    JoinDoc,
    DocSet,
    DocGet,
    DocGetMany,
    DocDelete,
    ReadContent,
    Share,
    Subscribe,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Close => "close",
            OperationKind::Info => "info",
            OperationKind::Put => "put",
            OperationKind::Get => "get",
            OperationKind::GetWithProgress => "get_with_progress",
            OperationKind::ValidateTicket => "validate_ticket",
            OperationKind::CreateTicket => "create_ticket",
            OperationKind::TagSet => "tag_set",
            OperationKind::TagDelete => "tag_delete",
            OperationKind::CreateAuthor => "create_author",
            OperationKind::ImportAuthor => "import_author",
            OperationKind::CreateDoc => "create_doc",
            OperationKind::JoinDoc => "join_doc",
            OperationKind::DocSet => "doc_set",
            OperationKind::DocGet => "doc_get",
            OperationKind::DocGetMany => "doc_get_many",
            OperationKind::DocDelete => "doc_delete",
            OperationKind::ReadContent => "read_content",
            OperationKind::Share => "share",
            OperationKind::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kinds of native handle a wrapper owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Engine,
    Document,
    Subscription,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleKind::Engine => "engine",
            HandleKind::Document => "document",
            HandleKind::Subscription => "subscription",
        })
    }
}

/// Bridge error type.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Resource creation failed: {0}")]
    ResourceCreationFailed(String),

    #[error("{kind} failed: {message}")]
    OperationFailed {
        kind: OperationKind,
        message: String,
    },

    #[error("{0} is closed")]
    ResourceClosed(HandleKind),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0} timed out")]
    Timeout(OperationKind),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        attempts: u32,
        last_error: Box<BridgeError>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Stream failed: {0}")]
    StreamFailed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Native failure of `kind`, or a creation failure for `create`.
    pub(crate) fn native(kind: OperationKind, message: String) -> Self {
        match kind {
            OperationKind::Create => BridgeError::ResourceCreationFailed(message),
            kind => BridgeError::OperationFailed { kind, message },
        }
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
