//! Cryptographic error types for `wcdb-crypto-core`.

use thiserror::Error;

/// Errors produced by key derivation and page decryption.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material is not exactly 32 bytes.
    #[error("invalid key length: {actual} bytes (expected {expected})")]
    InvalidKeyLength {
        /// Required length in bytes.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// Key material could not be decoded (e.g. non-hex characters).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// PBKDF2 parameters rejected (zero iterations, bad salt length).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Page HMAC did not verify (wrong key or corrupted page).
    #[error("page {page_index}: authentication failed (HMAC mismatch)")]
    AuthenticationFailure {
        /// Zero-based index of the failing page.
        page_index: u32,
    },

    /// A page buffer shorter (or longer) than the configured page size.
    #[error("page {page_index}: {actual} bytes (expected {expected})")]
    ShortPage {
        /// Zero-based index of the offending page.
        page_index: u32,
        /// Configured page size.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },

    /// Cipher parameters outside the supported range.
    #[error("invalid cipher parameters: {0}")]
    InvalidParams(String),

    /// AES-256-CBC failure (bad key/IV length, misaligned buffer).
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Secure memory operation failure (CSPRNG, core dump limits).
    #[error("secure memory error: {0}")]
    SecureMemory(String),
}
