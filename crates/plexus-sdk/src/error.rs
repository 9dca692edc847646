//! Errors raised by the worker loop.

use plexus_protocol::ProtocolError;

/// Errors from [`serve`](crate::serve).
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    /// Reading or writing the pipe failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The runtime sent something out of order.
    #[error("unexpected message from runtime: {0}")]
    Unexpected(String),

    /// The runtime closed the connection mid-exchange.
    #[error("runtime closed the connection")]
    Closed,
}

/// Result type for worker operations.
pub type SdkResult<T> = Result<T, SdkError>;
