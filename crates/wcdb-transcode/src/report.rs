//! Run summary returned to the caller and printed by the CLI.

use std::path::PathBuf;

use serde::Serialize;

/// Outcome of a run that produced an output file.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TranscodeStatus {
    /// Every page verified and decrypted.
    Success,
    /// Continue policy only: listed pages failed their HMAC and were zero-filled.
    #[serde(rename_all = "camelCase")]
    CompletedWithFailures {
        /// Zero-based indices, ascending.
        failed_pages: Vec<u32>,
    },
}

/// BLAKE3 fingerprints (16 hex chars) of the derived keys.
///
/// Identifies which keys were used without revealing them.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyFingerprints {
    /// Fingerprint of the AES-256 encryption key.
    pub encryption_key: String,
    /// Fingerprint of the HMAC-SHA512 key.
    pub hmac_key: String,
}

/// Summary of a finished transcode.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeReport {
    /// Encrypted input.
    pub input_path: PathBuf,
    /// Plaintext output.
    pub output_path: PathBuf,
    /// File salt (first 16 bytes of the input), hex.
    pub salt: String,
    /// Pages processed.
    pub page_count: u64,
    /// Bytes written to the output (equals the input length).
    pub bytes_written: u64,
    /// Success, or the pages that failed under the continue policy.
    pub status: TranscodeStatus,
    /// Present only when fingerprints were requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_fingerprints: Option<KeyFingerprints>,
}

impl TranscodeReport {
    /// `true` when every page decrypted.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, TranscodeStatus::Success)
    }
}
