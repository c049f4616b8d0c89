//! Error taxonomy shared by both ends of the protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using [`RpcError`].
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Every failure the filesystem plane can produce.
///
/// A subset of these travel over the wire inside [`crate::Response::Error`];
/// the rest (`Timeout`, `Busy`, `Shutdown`, `CacheCorrupt`) are produced
/// locally on the remote side. An RPC result is either a typed response or
/// exactly one of these, never both.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RpcError {
    /// The path does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// The caller may not perform the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// A directory operation was applied to a non-directory.
    #[error("not a directory")]
    NotADirectory,

    /// `readlink` was applied to something that is not a symlink.
    #[error("not a symlink")]
    NotASymlink,

    /// The local filesystem is out of space.
    #[error("no space left on device")]
    NoSpace,

    /// The handle is unknown to the serving connection.
    #[error("bad file handle")]
    BadHandle,

    /// Any other I/O failure, with the OS error description.
    #[error("i/o error: {0}")]
    Io(String),

    /// The request did not complete within its deadline.
    #[error("rpc call timed out")]
    Timeout,

    /// The client's in-flight window is full and the call was non-blocking.
    #[error("rpc client busy")]
    Busy,

    /// The FUSE request was interrupted by the kernel or a shutdown race.
    #[error("interrupted")]
    Interrupted,

    /// The byte stream is no longer parseable; fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session token presented at handshake was rejected.
    #[error("authentication failed")]
    AuthFailed,

    /// The session is draining; no further calls are accepted.
    #[error("session shut down")]
    Shutdown,

    /// A cache record failed its integrity check.
    #[error("cache corrupt: {0}")]
    CacheCorrupt(String),
}

impl RpcError {
    /// Maps the error onto the errno the kernel should observe.
    ///
    /// `Timeout` and `Busy` are expected to be retried before they reach
    /// this point; if they do reach it they degrade to `EIO`.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::NotADirectory => libc::ENOTDIR,
            Self::NotASymlink => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::BadHandle => libc::EBADF,
            Self::Interrupted => libc::EINTR,
            Self::Io(_)
            | Self::Timeout
            | Self::Busy
            | Self::Protocol(_)
            | Self::AuthFailed
            | Self::Shutdown
            | Self::CacheCorrupt(_) => libc::EIO,
        }
    }

    /// Whether the failure tears down the whole session rather than a single
    /// request.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::AuthFailed)
    }

    /// Whether a local retry with backoff is worthwhile.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Busy)
    }

    /// Builds a protocol error from any displayable cause.
    pub fn protocol(cause: impl std::fmt::Display) -> Self {
        Self::Protocol(cause.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => match err.raw_os_error() {
                Some(libc::ENOTDIR) => Self::NotADirectory,
                Some(libc::ENOSPC) => Self::NoSpace,
                Some(libc::EBADF) => Self::BadHandle,
                Some(libc::EINTR) => Self::Interrupted,
                _ => Self::Io(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(RpcError::NotFound.errno(), libc::ENOENT);
        assert_eq!(RpcError::NotADirectory.errno(), libc::ENOTDIR);
        assert_eq!(RpcError::Timeout.errno(), libc::EIO);
        assert_eq!(RpcError::Interrupted.errno(), libc::EINTR);
    }

    #[test]
    fn test_io_error_conversion() {
        let err = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(RpcError::from(err), RpcError::NotFound);

        let err = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(RpcError::from(err), RpcError::NoSpace);

        let err = std::io::Error::from_raw_os_error(libc::ENOTDIR);
        assert_eq!(RpcError::from(err), RpcError::NotADirectory);
    }

    #[test]
    fn test_fatal_and_retryable() {
        assert!(RpcError::AuthFailed.is_fatal());
        assert!(RpcError::protocol("bad frame").is_fatal());
        assert!(!RpcError::NotFound.is_fatal());

        assert!(RpcError::Timeout.is_retryable());
        assert!(RpcError::Busy.is_retryable());
        assert!(!RpcError::NotFound.is_retryable());
    }
}
