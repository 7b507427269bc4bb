//! Error types for the sync engine and its collaborators.

use thiserror::Error;

use crate::protocol::DocumentId;

/// Failure reported by one of the external collaborators
/// (snapshot service, range-replace service, heartbeat channel).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Document not found: {0}")]
    NotFound(DocumentId),
}

impl ServiceError {
    /// Whether repeating the same request later may succeed.
    ///
    /// Server-side rejections in the 4xx range are permanent; everything
    /// transport-shaped is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => !(400..500).contains(status),
            Self::Malformed(_) | Self::NotFound(_) => false,
        }
    }
}

/// Engine and session level errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Unrecognized content shape: {0}")]
    UnrecognizedContent(String),

    #[error("Initial load of document {document_id} failed: {source}")]
    InitialLoad {
        document_id: DocumentId,
        #[source]
        source: ServiceError,
    },

    #[error("Document {0} is closed")]
    Closed(DocumentId),

    #[error("Document {0} is already open")]
    AlreadyOpen(DocumentId),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
