//! SQLCipher 4 page codec: HMAC-SHA512 verification + AES-256-CBC.
//!
//! # Page layout
//!
//! ```text
//! | salt (16 B, page 0 only) | ciphertext ............ | iv (16 B) | hmac (64 B) |
//! 0                          offset           page_size - 80                page_size
//! ```
//!
//! - `offset` is 16 on page 0 (the salt occupies the SQLite header position) and 0 elsewhere.
//! - `hmac = HMAC-SHA512(hmac_key, ciphertext || iv || u32_le(page_index + 1))`.
//! - The ciphertext is AES-256-CBC without padding; its length is always a
//!   multiple of the AES block size.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::hmac;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::kdf::{DerivedKeys, SALT_LEN};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// SQLCipher 4 / WCDB default page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size SQLite accepts.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest page size SQLite accepts.
pub const MAX_PAGE_SIZE: usize = 65_536;

/// AES-CBC IV length.
pub const IV_LEN: usize = 16;

/// HMAC-SHA512 tag length.
pub const HMAC_LEN: usize = 64;

/// Reserved trailer per page: IV followed by the HMAC.
pub const RESERVE_SIZE: usize = IV_LEN + HMAC_LEN;

/// Magic that replaces the salt at the start of a plaintext database.
pub const SQLITE_HEADER: &[u8; SALT_LEN] = b"SQLite format 3\0";

const AES_BLOCK_LEN: usize = 16;

/// Constant-time comparison for MAC tags.
///
/// Tag length is public (always 64), so the early length check leaks nothing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Check that `page_size` is a power of two SQLite can use.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidParams`] otherwise.
pub fn validate_page_size(page_size: usize) -> Result<(), CryptoError> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(CryptoError::InvalidParams(format!(
            "page size {page_size} must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]"
        )));
    }
    Ok(())
}

/// Fresh IV for [`PageCodec::encrypt_page`] from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::Cipher`] if the CSPRNG fails.
pub fn random_iv() -> Result<[u8; IV_LEN], CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| CryptoError::Cipher(format!("CSPRNG fill failed: {e}")))?;
    Ok(iv)
}

// ---------------------------------------------------------------------------
// DecryptedPage
// ---------------------------------------------------------------------------

/// Plaintext of one page's ciphertext region.
///
/// For page 0 this covers bytes `[16, page_size - 80)`; the first 16 bytes of
/// the plaintext page are the SQLite magic, written by [`DecryptedPage::write_page`].
/// The plaintext is zeroized on drop.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DecryptedPage {
    page_index: u32,
    plaintext: Vec<u8>,
}

impl DecryptedPage {
    /// Zero-based page index.
    #[must_use]
    pub const fn page_index(&self) -> u32 {
        self.page_index
    }

    /// Decrypted bytes (same length as the ciphertext region).
    #[must_use]
    pub fn plaintext(&self) -> &[u8] {
        &self.plaintext
    }

    /// Lay the page out as plaintext SQLite: magic on page 0, the decrypted
    /// payload, then `reserve` (zeros or the original trailer).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::ShortPage`] if `out` is not
    /// `header + plaintext + reserve` bytes long.
    pub fn write_page(&self, reserve: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
        let offset = payload_offset(self.page_index);
        let expected = offset
            .saturating_add(self.plaintext.len())
            .saturating_add(reserve.len());
        if out.len() != expected {
            return Err(CryptoError::ShortPage {
                page_index: self.page_index,
                expected,
                actual: out.len(),
            });
        }
        let (header, rest) = out.split_at_mut(offset);
        header.copy_from_slice(&SQLITE_HEADER[..offset]);
        let (payload, tail) = rest.split_at_mut(self.plaintext.len());
        payload.copy_from_slice(&self.plaintext);
        tail.copy_from_slice(reserve);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PageCodec
// ---------------------------------------------------------------------------

/// Decrypts (and encrypts) single pages under one file's [`DerivedKeys`].
///
/// Holds no mutable state, so one codec can be shared across worker threads.
pub struct PageCodec<'k> {
    keys: &'k DerivedKeys,
    hmac_key: hmac::Key,
    page_size: usize,
}

impl std::fmt::Debug for PageCodec<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCodec")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Start of the ciphertext within a page.
const fn payload_offset(page_index: u32) -> usize {
    if page_index == 0 {
        SALT_LEN
    } else {
        0
    }
}

impl<'k> PageCodec<'k> {
    /// Codec for the default 4096-byte page.
    #[must_use]
    pub fn new(keys: &'k DerivedKeys) -> Self {
        Self {
            keys,
            hmac_key: hmac::Key::new(hmac::HMAC_SHA512, keys.hmac_key()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Codec for a non-default `cipher_page_size`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidParams`] for an unusable page size.
    pub fn with_page_size(keys: &'k DerivedKeys, page_size: usize) -> Result<Self, CryptoError> {
        validate_page_size(page_size)?;
        let mut codec = Self::new(keys);
        codec.page_size = page_size;
        Ok(codec)
    }

    /// Configured page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes of a page before the reserved trailer.
    #[must_use]
    pub const fn payload_len(&self) -> usize {
        self.page_size.saturating_sub(RESERVE_SIZE)
    }

    /// Verify and decrypt one page.
    ///
    /// The MAC is checked before any decryption happens.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::ShortPage`] if `page` is not exactly `page_size` bytes
    /// - [`CryptoError::AuthenticationFailure`] if the stored HMAC does not match
    pub fn decrypt_page(&self, page: &[u8], page_index: u32) -> Result<DecryptedPage, CryptoError> {
        self.check_len(page, page_index)?;
        let offset = payload_offset(page_index);
        let payload_end = self.payload_len();
        let iv_end = payload_end.saturating_add(IV_LEN);

        let ciphertext = &page[offset..payload_end];
        let iv = &page[payload_end..iv_end];
        let stored_mac = &page[iv_end..];

        let expected = self.page_mac(ciphertext, iv, page_index)?;
        if !constant_time_eq(expected.as_ref(), stored_mac) {
            return Err(CryptoError::AuthenticationFailure { page_index });
        }

        // Decrypt in place so the buffer is wiped on the error paths too.
        let mut decrypted = DecryptedPage {
            page_index,
            plaintext: ciphertext.to_vec(),
        };
        Aes256CbcDec::new_from_slices(self.keys.encryption_key(), iv)
            .map_err(|e| CryptoError::Cipher(format!("bad key/iv length: {e}")))?
            .decrypt_padded_mut::<NoPadding>(&mut decrypted.plaintext)
            .map_err(|e| CryptoError::Cipher(format!("page {page_index}: {e}")))?;

        Ok(decrypted)
    }

    /// Encrypt one plaintext page, producing the on-disk SQLCipher layout.
    ///
    /// `plaintext` is a full page; its reserved trailer is ignored. On page 0
    /// the first 16 bytes (the SQLite magic) are replaced by `salt`.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::ShortPage`] if `plaintext` is not exactly `page_size` bytes
    /// - [`CryptoError::InvalidParams`] if `page_index` is 0 and no salt is given
    pub fn encrypt_page(
        &self,
        plaintext: &[u8],
        page_index: u32,
        iv: &[u8; IV_LEN],
        salt: Option<&[u8; SALT_LEN]>,
    ) -> Result<Vec<u8>, CryptoError> {
        self.check_len(plaintext, page_index)?;
        let offset = payload_offset(page_index);
        let payload_end = self.payload_len();

        let mut page = vec![0u8; self.page_size];
        if page_index == 0 {
            let salt = salt.ok_or_else(|| {
                CryptoError::InvalidParams("page 0 requires the file salt".into())
            })?;
            page[..SALT_LEN].copy_from_slice(salt);
        }
        page[offset..payload_end].copy_from_slice(&plaintext[offset..payload_end]);

        let ct_len = payload_end.saturating_sub(offset);
        Aes256CbcEnc::new_from_slices(self.keys.encryption_key(), iv)
            .map_err(|e| CryptoError::Cipher(format!("bad key/iv length: {e}")))?
            .encrypt_padded_mut::<NoPadding>(&mut page[offset..payload_end], ct_len)
            .map_err(|e| CryptoError::Cipher(format!("page {page_index}: {e}")))?;

        let iv_end = payload_end.saturating_add(IV_LEN);
        page[payload_end..iv_end].copy_from_slice(iv);
        let mac = self.page_mac(&page[offset..payload_end], iv, page_index)?;
        page[iv_end..].copy_from_slice(mac.as_ref());
        Ok(page)
    }

    fn check_len(&self, page: &[u8], page_index: u32) -> Result<(), CryptoError> {
        if page.len() != self.page_size {
            return Err(CryptoError::ShortPage {
                page_index,
                expected: self.page_size,
                actual: page.len(),
            });
        }
        debug_assert_eq!(self.payload_len() % AES_BLOCK_LEN, 0);
        Ok(())
    }

    /// `HMAC-SHA512(ciphertext || iv || u32_le(page_index + 1))`.
    fn page_mac(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        page_index: u32,
    ) -> Result<hmac::Tag, CryptoError> {
        let page_number = page_index.checked_add(1).ok_or_else(|| {
            CryptoError::InvalidParams(format!("page index {page_index} overflows page number"))
        })?;
        let mut ctx = hmac::Context::with_key(&self.hmac_key);
        ctx.update(ciphertext);
        ctx.update(iv);
        ctx.update(&page_number.to_le_bytes());
        Ok(ctx.sign())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
