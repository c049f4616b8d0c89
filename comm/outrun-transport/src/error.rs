//! Transport error types.

use outrun_protocol::RpcError;
use thiserror::Error;

/// Result type alias using [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures at the byte-stream layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// An oversized or undersized frame was announced; the stream state is
    /// unrecoverable.
    #[error("framing error: {0}")]
    Frame(String),

    /// Underlying socket failure.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::Shutdown,
            TransportError::Frame(msg) => Self::Protocol(msg),
            TransportError::Io(e) => Self::Io(e.to_string()),
        }
    }
}
