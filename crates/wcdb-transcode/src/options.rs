//! Transcode options — cipher parameters and run policy.
//!
//! Every field has a default matching WCDB / SQLCipher 4, so an empty JSON
//! object (or no config file at all) yields a working configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use wcdb_crypto_core::{validate_page_size, DEFAULT_KDF_ITERATIONS, DEFAULT_PAGE_SIZE};

use crate::error::TranscodeError;

// ── Cipher parameters ──────────────────────────────────────────────

/// SQLCipher settings the database was created with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CipherParams {
    /// `PRAGMA cipher_page_size` (default 4096).
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// `PRAGMA kdf_iter` (default 256 000).
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

impl Default for CipherParams {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

const fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}
const fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

// ── Policies ───────────────────────────────────────────────────────

/// What to do when a page's HMAC does not verify.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthFailurePolicy {
    /// Stop at the first failing page; no output file is produced.
    #[default]
    Abort,
    /// Decode every page, zero-fill failing ones, and list them in the report.
    Continue,
}

/// What the 80-byte reserved trailer of each output page contains.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReserveMode {
    /// Zero-filled.
    #[default]
    Zeroed,
    /// Original IV and HMAC bytes copied through.
    Preserve,
}

// ── TranscodeOptions ───────────────────────────────────────────────

/// Full configuration for one transcode run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeOptions {
    /// Cipher settings of the input database.
    #[serde(default)]
    pub params: CipherParams,

    /// Behaviour on HMAC mismatch.
    #[serde(default)]
    pub auth_failure_policy: AuthFailurePolicy,

    /// Content of each output page's reserved trailer.
    #[serde(default)]
    pub reserve_mode: ReserveMode,

    /// Decoder threads; 0 means one per available CPU.
    #[serde(default)]
    pub workers: usize,

    /// Pages read, decoded and written per batch (bounds memory use).
    #[serde(default = "default_batch_pages")]
    pub batch_pages: usize,

    /// Include BLAKE3 fingerprints of the derived keys in the report.
    #[serde(default)]
    pub reveal_key_fingerprints: bool,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            params: CipherParams::default(),
            auth_failure_policy: AuthFailurePolicy::default(),
            reserve_mode: ReserveMode::default(),
            workers: 0,
            batch_pages: default_batch_pages(),
            reveal_key_fingerprints: false,
        }
    }
}

const fn default_batch_pages() -> usize {
    256
}

impl TranscodeOptions {
    /// Load options from a JSON file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// - [`TranscodeError::Io`] if the file cannot be read
    /// - [`TranscodeError::Config`] if it is not valid JSON for this type
    pub fn load(path: &Path) -> Result<Self, TranscodeError> {
        let contents =
            fs::read_to_string(path).map_err(|e| TranscodeError::io("reading", path, e))?;
        let options: Self = serde_json::from_str(&contents)
            .map_err(|e| TranscodeError::Config(format!("{}: {e}", path.display())))?;
        options.validate()?;
        Ok(options)
    }

    /// Check ranges the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError::InvalidOptions`] naming the offending field.
    pub fn validate(&self) -> Result<(), TranscodeError> {
        validate_page_size(self.params.page_size)
            .map_err(|e| TranscodeError::InvalidOptions(e.to_string()))?;
        if self.params.kdf_iterations == 0 {
            return Err(TranscodeError::InvalidOptions(
                "kdfIterations must be at least 1".into(),
            ));
        }
        if self.batch_pages == 0 {
            return Err(TranscodeError::InvalidOptions(
                "batchPages must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Number of decoder threads to run.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
