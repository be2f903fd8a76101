//! Pipeline error types for `wcdb-transcode`.

use std::path::PathBuf;

use thiserror::Error;
use wcdb_crypto_core::CryptoError;

/// Errors produced while transcoding an encrypted database.
///
/// Key-length and page-authentication failures arrive through
/// [`TranscodeError::Crypto`].
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Key derivation or page decryption failed (delegated from crypto-core).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Input database does not exist.
    #[error("input file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Input is shorter than a single page.
    #[error("input file too small: {len} bytes (one page is {page_size} bytes)")]
    FileTooSmall {
        /// Input length in bytes.
        len: u64,
        /// Configured page size.
        page_size: usize,
    },

    /// Input length is not a whole number of pages, or a page came up short
    /// mid-stream.
    #[error("malformed input: {len} bytes is not a multiple of the {page_size}-byte page size")]
    MalformedLength {
        /// Input length in bytes (as observed when the problem was found).
        len: u64,
        /// Configured page size.
        page_size: usize,
    },

    /// Read/write failure, with the operation and path it happened on.
    #[error("I/O error while {op} {}: {source}", .path.display())]
    Io {
        /// What was being attempted (e.g. "reading", "renaming").
        op: &'static str,
        /// File the operation targeted.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Cancellation was requested; no output was produced.
    #[error("transcode cancelled after {pages_done} pages")]
    Cancelled {
        /// Pages fully decoded before the cancellation was observed.
        pages_done: u64,
    },

    /// Option values out of range.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl TranscodeError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Zero-based index of the page whose MAC failed, if that is the cause.
    #[must_use]
    pub const fn failed_page(&self) -> Option<u32> {
        match self {
            Self::Crypto(CryptoError::AuthenticationFailure { page_index }) => Some(*page_index),
            _ => None,
        }
    }
}
