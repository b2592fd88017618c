//! Error types for DIMSE operations

use std::time::Duration;

use thiserror::Error;

use crate::association::AssociationRejection;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Association rejected: {0}")]
    AssociationRejected(AssociationRejection),

    #[error("Association request timed out {attempts} consecutive time(s) after {timeout:?}")]
    AssociationRequestTimedOut { timeout: Duration, attempts: u32 },

    #[error("Request [{message_id}] timed out after {timeout:?}")]
    RequestTimedOut { message_id: u16, timeout: Duration },

    /// Reported by association implementations when the peer sends A-ABORT
    #[error("Association aborted: {0}")]
    AssociationAborted(String),

    #[error("Connection closed before the final response was received")]
    ConnectionClosed,

    #[error("Association has already been released, aborted or disposed")]
    AssociationDisposed,

    #[error("Peer did not answer the user identity negotiation")]
    MissingUserIdentityResponse,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Request was dropped before a final response was received")]
    RequestAbandoned,

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DimseError::Network(_)
                | DimseError::AssociationRequestTimedOut { .. }
                | DimseError::RequestTimedOut { .. }
                | DimseError::ConnectionClosed
        )
    }

    /// Check if this error was caused by cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DimseError::Cancelled)
    }
}
