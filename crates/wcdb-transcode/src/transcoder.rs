//! Encrypted database → plaintext database.
//!
//! # Pipeline
//!
//! ```text
//! open input → read salt → derive keys → { read batch → decode pages → write batch }* → commit
//! ```
//!
//! 1. Validates the input length (`FileTooSmall`, `MalformedLength`) before
//!    any decryption.
//! 2. Derives the page keys exactly once from the salt in bytes `[0, 16)`.
//! 3. Streams the file in batches of `batch_pages`; inside a batch, a fixed
//!    pool of scoped worker threads pulls page jobs from a shared queue and
//!    writes each result into that page's slot of a pre-sized output buffer,
//!    so output order always equals input order.
//! 4. Writes to a staging file that is renamed over the output path only
//!    after the last page; failures and cancellation leave no output.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use data_encoding::HEXLOWER;
use secrecy::{ExposeSecret, SecretString};
use wcdb_crypto_core::{
    derive_with_iterations, CryptoError, KeyMaterial, PageCodec, RESERVE_SIZE, SALT_LEN,
};
use zeroize::Zeroizing;

use crate::cancel::CancelToken;
use crate::error::TranscodeError;
use crate::options::{AuthFailurePolicy, ReserveMode, TranscodeOptions};
use crate::report::{KeyFingerprints, TranscodeReport, TranscodeStatus};
use crate::staging::StagingFile;

/// Zero trailer written when the reserve is not preserved.
const ZERO_RESERVE: [u8; RESERVE_SIZE] = [0u8; RESERVE_SIZE];

/// Suffix appended to the input stem when no output path is given.
const DEFAULT_OUTPUT_SUFFIX: &str = "_decrypted";

// ---------------------------------------------------------------------------
// Convenience entry points
// ---------------------------------------------------------------------------

/// Decrypt `input` with a hex key using default (SQLCipher 4) options.
///
/// `output` defaults to [`default_output_path`].
///
/// # Errors
///
/// See [`DatabaseTranscoder::transcode`]; additionally
/// [`CryptoError::InvalidKeyMaterial`] / [`CryptoError::InvalidKeyLength`]
/// for a malformed key, reported before any file is touched.
pub fn transcode(
    input: &Path,
    key_hex: &str,
    output: Option<&Path>,
) -> Result<TranscodeReport, TranscodeError> {
    let key = KeyMaterial::from_hex(key_hex)?;
    let output = output.map_or_else(|| default_output_path(input), Path::to_path_buf);
    DatabaseTranscoder::new(TranscodeOptions::default())?.transcode(input, &key, &output)
}

/// `dir/name.ext` → `dir/name_decrypted.ext`.
#[must_use]
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map_or_else(|| "database".into(), |s| s.to_string_lossy().into_owned());
    let name = match input.extension() {
        Some(ext) => format!("{stem}{DEFAULT_OUTPUT_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{DEFAULT_OUTPUT_SUFFIX}"),
    };
    input.with_file_name(name)
}

// ---------------------------------------------------------------------------
// DatabaseTranscoder
// ---------------------------------------------------------------------------

/// Drives key derivation and per-page decoding for whole files.
#[derive(Debug, Clone)]
pub struct DatabaseTranscoder {
    options: TranscodeOptions,
    cancel: CancelToken,
}

impl DatabaseTranscoder {
    /// Build a transcoder with validated options.
    ///
    /// # Errors
    ///
    /// Returns [`TranscodeError::InvalidOptions`] for out-of-range options.
    pub fn new(options: TranscodeOptions) -> Result<Self, TranscodeError> {
        options.validate()?;
        Ok(Self {
            options,
            cancel: CancelToken::new(),
        })
    }

    /// Use an externally-owned cancellation token (e.g. one tripped by Ctrl-C).
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels runs of this transcoder.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Options in effect.
    #[must_use]
    pub const fn options(&self) -> &TranscodeOptions {
        &self.options
    }

    /// Parse a hex key held in a [`SecretString`] and transcode.
    ///
    /// The decoded key is zeroized when this returns, on every path.
    ///
    /// # Errors
    ///
    /// Key errors first (no I/O performed), then as [`transcode`](Self::transcode).
    pub fn transcode_hex(
        &self,
        input: &Path,
        key_hex: &SecretString,
        output: &Path,
    ) -> Result<TranscodeReport, TranscodeError> {
        let key = KeyMaterial::from_hex(key_hex.expose_secret())?;
        self.transcode(input, &key, output)
    }

    /// Decrypt `input` into `output`.
    ///
    /// # Errors
    ///
    /// - [`TranscodeError::FileNotFound`], [`TranscodeError::FileTooSmall`],
    ///   [`TranscodeError::MalformedLength`] before any decryption
    /// - [`TranscodeError::Crypto`] with `AuthenticationFailure` for the first
    ///   failing page (abort policy)
    /// - [`TranscodeError::Cancelled`] if the token was tripped
    /// - [`TranscodeError::Io`] for read/write failures
    pub fn transcode(
        &self,
        input: &Path,
        key: &KeyMaterial,
        output: &Path,
    ) -> Result<TranscodeReport, TranscodeError> {
        let params = self.options.params;
        let page_size = params.page_size;

        let (mut reader, input_len) = open_input(input)?;
        let page_count = page_count(input_len, page_size)?;
        u32::try_from(page_count).map_err(|_| {
            TranscodeError::InvalidOptions(format!(
                "{page_count} pages exceeds the 32-bit page number space"
            ))
        })?;
        tracing::info!(
            input = %input.display(),
            pages = page_count,
            page_size,
            "starting transcode"
        );

        let batch_pages = usize::try_from(page_count)
            .map_or(self.options.batch_pages, |p| p.min(self.options.batch_pages));
        let batch_bytes = batch_pages.checked_mul(page_size).ok_or_else(|| {
            TranscodeError::InvalidOptions(format!("batch of {batch_pages} pages is too large"))
        })?;
        let mut in_buf = Zeroizing::new(vec![0u8; batch_bytes]);
        let mut out_buf = Zeroizing::new(vec![0u8; batch_bytes]);

        // First batch carries the salt.
        let mut pages_read: u64 = 0;
        let mut batch_len = next_batch_len(page_count, pages_read, batch_pages);
        read_pages(
            &mut reader,
            &mut in_buf[..bytes_for(batch_len, page_size)],
            input,
            pages_read,
            page_size,
        )?;

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&in_buf[..SALT_LEN]);
        if self.cancel.is_cancelled() {
            return Err(TranscodeError::Cancelled { pages_done: 0 });
        }

        let keys = derive_with_iterations(key.expose(), &salt, params.kdf_iterations)?;
        tracing::debug!(kdf_iterations = params.kdf_iterations, "page keys derived");
        let codec = PageCodec::with_page_size(&keys, page_size)?;

        let mut staging = StagingFile::create(output)?;
        let ctx = BatchContext {
            codec: &codec,
            workers: self.options.effective_workers(),
            reserve_mode: self.options.reserve_mode,
            policy: self.options.auth_failure_policy,
            cancel: &self.cancel,
        };
        let mut failed_pages = Vec::new();

        while batch_len > 0 {
            if self.cancel.is_cancelled() {
                return Err(TranscodeError::Cancelled {
                    pages_done: pages_read,
                });
            }
            let first_index = u32::try_from(pages_read).map_err(|_| {
                TranscodeError::InvalidOptions("page index overflow".into())
            })?;
            let bytes = bytes_for(batch_len, page_size);

            let failed = decode_batch(&ctx, first_index, &in_buf[..bytes], &mut out_buf[..bytes])
                .map_err(|err| match err {
                    BatchError::Cancelled => TranscodeError::Cancelled {
                        pages_done: pages_read,
                    },
                    BatchError::Crypto(CryptoError::ShortPage { .. }) => {
                        TranscodeError::MalformedLength {
                            len: input_len,
                            page_size,
                        }
                    }
                    BatchError::Crypto(e) => TranscodeError::Crypto(e),
                })?;

            if let Some(&first) = failed.first() {
                if self.options.auth_failure_policy == AuthFailurePolicy::Abort {
                    tracing::error!(page_index = first, "page failed authentication; aborting");
                    return Err(CryptoError::AuthenticationFailure { page_index: first }.into());
                }
                for &page_index in &failed {
                    tracing::warn!(page_index, "page failed authentication; zero-filled");
                }
                failed_pages.extend_from_slice(&failed);
            }

            staging.write_all(&out_buf[..bytes])?;
            pages_read = pages_read.saturating_add(batch_len as u64);
            tracing::debug!(first_index, pages = batch_len, "batch written");

            batch_len = next_batch_len(page_count, pages_read, batch_pages);
            if batch_len > 0 {
                read_pages(
                    &mut reader,
                    &mut in_buf[..bytes_for(batch_len, page_size)],
                    input,
                    pages_read,
                    page_size,
                )?;
            }
        }

        if self.cancel.is_cancelled() {
            return Err(TranscodeError::Cancelled {
                pages_done: pages_read,
            });
        }
        let bytes_written = staging.commit()?;

        let status = if failed_pages.is_empty() {
            TranscodeStatus::Success
        } else {
            TranscodeStatus::CompletedWithFailures { failed_pages }
        };
        tracing::info!(
            output = %output.display(),
            pages = page_count,
            success = matches!(status, TranscodeStatus::Success),
            "transcode complete"
        );

        let key_fingerprints = self.options.reveal_key_fingerprints.then(|| KeyFingerprints {
            encryption_key: keys.encryption_key_fingerprint(),
            hmac_key: keys.hmac_key_fingerprint(),
        });

        Ok(TranscodeReport {
            input_path: input.to_path_buf(),
            output_path: output.to_path_buf(),
            salt: HEXLOWER.encode(&salt),
            page_count,
            bytes_written,
            status,
            key_fingerprints,
        })
    }
}

// ---------------------------------------------------------------------------
// Input helpers
// ---------------------------------------------------------------------------

fn open_input(path: &Path) -> Result<(File, u64), TranscodeError> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            TranscodeError::FileNotFound(path.to_path_buf())
        } else {
            TranscodeError::io("opening", path, e)
        }
    })?;
    let meta = file
        .metadata()
        .map_err(|e| TranscodeError::io("inspecting", path, e))?;
    if !meta.is_file() {
        return Err(TranscodeError::io(
            "opening",
            path,
            std::io::Error::other("not a regular file"),
        ));
    }
    Ok((file, meta.len()))
}

/// Whole pages in a file of `len` bytes.
fn page_count(len: u64, page_size: usize) -> Result<u64, TranscodeError> {
    let ps = page_size as u64;
    if len < ps {
        return Err(TranscodeError::FileTooSmall { len, page_size });
    }
    if len % ps != 0 {
        return Err(TranscodeError::MalformedLength { len, page_size });
    }
    Ok(len / ps)
}

fn next_batch_len(page_count: u64, pages_read: u64, batch_pages: usize) -> usize {
    let remaining = page_count.saturating_sub(pages_read);
    usize::try_from(remaining).map_or(batch_pages, |r| r.min(batch_pages))
}

const fn bytes_for(pages: usize, page_size: usize) -> usize {
    pages.saturating_mul(page_size)
}

/// Fill `buf` from the input; a short read means the file shrank under us.
fn read_pages(
    reader: &mut File,
    buf: &mut [u8],
    path: &Path,
    pages_read: u64,
    page_size: usize,
) -> Result<(), TranscodeError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            TranscodeError::MalformedLength {
                len: pages_read.saturating_mul(page_size as u64),
                page_size,
            }
        } else {
            TranscodeError::io("reading", path, e)
        }
    })
}

// ---------------------------------------------------------------------------
// Batch decoding
// ---------------------------------------------------------------------------

struct BatchContext<'a, 'k> {
    codec: &'a PageCodec<'k>,
    workers: usize,
    reserve_mode: ReserveMode,
    policy: AuthFailurePolicy,
    cancel: &'a CancelToken,
}

enum BatchError {
    Cancelled,
    Crypto(CryptoError),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn keep_first(slot: &Mutex<Option<CryptoError>>, err: CryptoError) {
    let mut slot = lock(slot);
    if slot.is_none() {
        *slot = Some(err);
    }
}

/// Decode one page into its output slot.
fn decode_into(
    codec: &PageCodec<'_>,
    src: &[u8],
    page_index: u32,
    dst: &mut [u8],
    reserve_mode: ReserveMode,
) -> Result<(), CryptoError> {
    let page = codec.decrypt_page(src, page_index)?;
    let reserve = match reserve_mode {
        ReserveMode::Zeroed => &ZERO_RESERVE[..],
        ReserveMode::Preserve => &src[codec.payload_len()..],
    };
    page.write_page(reserve, dst)
}

/// Decode every page of `input` into the matching slot of `output`.
///
/// Returns the indices of pages that failed authentication, ascending. Under
/// the abort policy workers stop taking new pages after the first failure;
/// pages are handed out in ascending order, so the smallest failing index is
/// still the first failing page of the batch.
fn decode_batch(
    ctx: &BatchContext<'_, '_>,
    first_index: u32,
    input: &[u8],
    output: &mut [u8],
) -> Result<Vec<u32>, BatchError> {
    let page_size = ctx.codec.page_size();
    let pages = input.len() / page_size;

    let jobs = Mutex::new(
        input
            .chunks_exact(page_size)
            .zip(output.chunks_exact_mut(page_size))
            .enumerate(),
    );
    let failed = Mutex::new(Vec::new());
    let fatal: Mutex<Option<CryptoError>> = Mutex::new(None);
    let stop = AtomicBool::new(false);

    let work = || {
        while !stop.load(Ordering::Relaxed) && !ctx.cancel.is_cancelled() {
            let Some((offset, (src, dst))) = lock(&jobs).next() else {
                break;
            };
            let page_index = u32::try_from(offset)
                .ok()
                .and_then(|o| first_index.checked_add(o));
            let Some(page_index) = page_index else {
                keep_first(&fatal, CryptoError::InvalidParams("page index overflow".into()));
                stop.store(true, Ordering::Relaxed);
                break;
            };
            match decode_into(ctx.codec, src, page_index, dst, ctx.reserve_mode) {
                Ok(()) => {}
                Err(CryptoError::AuthenticationFailure { page_index }) => {
                    dst.fill(0);
                    lock(&failed).push(page_index);
                    if ctx.policy == AuthFailurePolicy::Abort {
                        stop.store(true, Ordering::Relaxed);
                    }
                }
                Err(other) => {
                    keep_first(&fatal, other);
                    stop.store(true, Ordering::Relaxed);
                }
            }
        }
    };

    let workers = ctx.workers.clamp(1, pages.max(1));
    if workers == 1 {
        work();
    } else {
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(&work);
            }
        });
    }

    if let Some(err) = fatal.into_inner().unwrap_or_else(PoisonError::into_inner) {
        return Err(BatchError::Crypto(err));
    }
    let mut failed = failed.into_inner().unwrap_or_else(PoisonError::into_inner);
    failed.sort_unstable();
    if ctx.cancel.is_cancelled() {
        return Err(BatchError::Cancelled);
    }
    Ok(failed)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use wcdb_crypto_core::{DerivedKeys, DEFAULT_PAGE_SIZE};

    #[test]
    fn default_output_path_keeps_extension() {
        assert_eq!(
            default_output_path(Path::new("/wx/message_0.db")),
            PathBuf::from("/wx/message_0_decrypted.db")
        );
        assert_eq!(
            default_output_path(Path::new("contact")),
            PathBuf::from("contact_decrypted")
        );
    }

    #[test]
    fn page_count_validates_length() {
        assert_eq!(page_count(8192, 4096).unwrap(), 2);
        assert!(matches!(
            page_count(0, 4096),
            Err(TranscodeError::FileTooSmall { len: 0, .. })
        ));
        assert!(matches!(
            page_count(4095, 4096),
            Err(TranscodeError::FileTooSmall { .. })
        ));
        assert!(matches!(
            page_count(4097, 4096),
            Err(TranscodeError::MalformedLength { len: 4097, .. })
        ));
    }

    #[test]
    fn next_batch_len_caps_at_remaining() {
        assert_eq!(next_batch_len(10, 0, 4), 4);
        assert_eq!(next_batch_len(10, 8, 4), 2);
        assert_eq!(next_batch_len(10, 10, 4), 0);
    }

    fn keys() -> DerivedKeys {
        derive_with_iterations(&[7u8; 32], &[1u8; SALT_LEN], 2).unwrap()
    }

    fn encrypted_pages(codec: &PageCodec<'_>, first: u32, n: u32) -> Vec<u8> {
        let mut out = Vec::new();
        for i in first..first + n {
            let plain = vec![i as u8; DEFAULT_PAGE_SIZE];
            out.extend(codec.encrypt_page(&plain, i, &[9u8; 16], None).unwrap());
        }
        out
    }

    #[test]
    fn decode_batch_keeps_page_order_across_workers() {
        let keys = keys();
        let codec = PageCodec::new(&keys);
        let input = encrypted_pages(&codec, 1, 12);
        let cancel = CancelToken::new();
        let ctx = BatchContext {
            codec: &codec,
            workers: 4,
            reserve_mode: ReserveMode::Zeroed,
            policy: AuthFailurePolicy::Abort,
            cancel: &cancel,
        };
        let mut output = vec![0u8; input.len()];
        let failed = decode_batch(&ctx, 1, &input, &mut output).ok().unwrap();
        assert!(failed.is_empty());
        for (i, page) in output.chunks_exact(DEFAULT_PAGE_SIZE).enumerate() {
            let expected = (i + 1) as u8;
            assert!(page[..codec.payload_len()].iter().all(|&b| b == expected));
            assert!(page[codec.payload_len()..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn decode_batch_continue_collects_all_failures() {
        let keys = keys();
        let codec = PageCodec::new(&keys);
        let mut input = encrypted_pages(&codec, 1, 6);
        input[2 * DEFAULT_PAGE_SIZE + 5] ^= 1;
        input[4 * DEFAULT_PAGE_SIZE + 5] ^= 1;
        let cancel = CancelToken::new();
        let ctx = BatchContext {
            codec: &codec,
            workers: 3,
            reserve_mode: ReserveMode::Zeroed,
            policy: AuthFailurePolicy::Continue,
            cancel: &cancel,
        };
        let mut output = vec![0xEEu8; input.len()];
        let failed = decode_batch(&ctx, 1, &input, &mut output).ok().unwrap();
        assert_eq!(failed, vec![3, 5]);
        let third = &output[2 * DEFAULT_PAGE_SIZE..3 * DEFAULT_PAGE_SIZE];
        assert!(third.iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_batch_observes_cancellation() {
        let keys = keys();
        let codec = PageCodec::new(&keys);
        let input = encrypted_pages(&codec, 1, 3);
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = BatchContext {
            codec: &codec,
            workers: 2,
            reserve_mode: ReserveMode::Zeroed,
            policy: AuthFailurePolicy::Abort,
            cancel: &cancel,
        };
        let mut output = vec![0u8; input.len()];
        assert!(matches!(
            decode_batch(&ctx, 1, &input, &mut output),
            Err(BatchError::Cancelled)
        ));
    }
}
