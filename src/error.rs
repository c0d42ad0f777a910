//! The tagged error type shared by every module in this crate.
//!
//! Library code returns [`Result<T>`] exclusively; `color-eyre` is reserved
//! for the binary entry point, where these errors are wrapped for
//! human-facing reporting.

use std::fmt;
use std::path::PathBuf;

/// Errors raised by the dedup engine's core subsystems.
#[derive(Debug, thiserror::Error)]
pub enum DedupeError {
    /// The path does not exist, or was removed between a `stat` and a
    /// subsequent `open`.
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// The path exists but is not currently usable for the requested
    /// operation (no mapped extents, vanished mid-walk, malformed CLI
    /// input).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other syscall or persistent-store failure.
    #[error("io error: {message}")]
    Io {
        errno: Option<i32>,
        message: String,
    },

    /// A failure inside the persistent index.
    #[error("persistent store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl DedupeError {
    /// Wrap a `std::io::Error`, carrying its raw OS error number when one is
    /// available.
    pub fn io(context: impl fmt::Display, source: &std::io::Error) -> Self {
        DedupeError::Io {
            errno: source.raw_os_error(),
            message: format!("{context}: {source}"),
        }
    }

    /// Wrap a `nix::Error`, carrying its errno.
    pub fn nix(context: impl fmt::Display, source: nix::Error) -> Self {
        DedupeError::Io {
            errno: Some(source as i32),
            message: format!("{context}: {source}"),
        }
    }

    /// True for the "file vanished" / "no mapped extents" case the driver
    /// treats as a removal rather than a fatal error.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, DedupeError::InvalidArgument(_))
    }
}

pub type Result<T> = std::result::Result<T, DedupeError>;
