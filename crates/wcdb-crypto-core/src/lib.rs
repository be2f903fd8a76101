//! `wcdb-crypto-core` — Pure cryptographic primitives for WCDB/SQLCipher 4 databases.
//!
//! This crate is the audit target: zero file I/O, zero threads, zero logging.
//! It derives the per-file keys and verifies/decrypts individual pages; the
//! file-level pipeline lives in `wcdb-transcode`.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod memory;

pub mod kdf;
pub mod page;

pub use error::CryptoError;
pub use kdf::{
    derive, derive_with_iterations, DerivedKeys, KeyMaterial, DEFAULT_KDF_ITERATIONS,
    HMAC_KDF_ITERATIONS, HMAC_SALT_MASK, KEY_LEN, SALT_LEN,
};
pub use memory::{disable_core_dumps, SecretBytes};
pub use page::{
    random_iv, validate_page_size, DecryptedPage, PageCodec, DEFAULT_PAGE_SIZE, HMAC_LEN, IV_LEN,
    MAX_PAGE_SIZE, MIN_PAGE_SIZE, RESERVE_SIZE, SQLITE_HEADER,
};
