//! `wcdb-transcode` — Turns a WCDB/SQLCipher 4 encrypted database into a
//! plain SQLite file.
//!
//! Everything that touches the filesystem or spawns threads lives here; the
//! per-page cryptography is delegated to `wcdb-crypto-core`.
//!
//! ```no_run
//! use std::path::Path;
//! use wcdb_transcode::{DatabaseTranscoder, TranscodeOptions};
//! use wcdb_crypto_core::KeyMaterial;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let key = KeyMaterial::from_hex(&"00".repeat(32))?;
//! let transcoder = DatabaseTranscoder::new(TranscodeOptions::default())?;
//! let report = transcoder.transcode(
//!     Path::new("message_0.db"),
//!     &key,
//!     Path::new("message_0_decrypted.db"),
//! )?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod cancel;
pub mod error;
pub mod options;
pub mod report;
pub mod staging;
pub mod transcoder;

pub use cancel::CancelToken;
pub use error::TranscodeError;
pub use options::{AuthFailurePolicy, CipherParams, ReserveMode, TranscodeOptions};
pub use report::{KeyFingerprints, TranscodeReport, TranscodeStatus};
pub use staging::{staging_path_for, StagingFile};
pub use transcoder::{default_output_path, transcode, DatabaseTranscoder};
