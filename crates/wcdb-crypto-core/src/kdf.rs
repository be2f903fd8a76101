//! SQLCipher 4 key derivation (PBKDF2-HMAC-SHA512).
//!
//! This module provides:
//! - [`KeyMaterial`] — the caller-supplied 32-byte database key
//! - [`derive`] / [`derive_with_iterations`] — salt + key material → [`DerivedKeys`]
//! - [`DerivedKeys`] — AES-256 encryption key and HMAC-SHA512 key
//!
//! # Derivation
//!
//! ```text
//! encryption_key = PBKDF2-HMAC-SHA512(key_material,   salt,        kdf_iter, 32)
//! hmac_key       = PBKDF2-HMAC-SHA512(encryption_key, salt ^ 0x3a, 2,        32)
//! ```
//!
//! The salt is the first 16 bytes of the encrypted file.
//!
//! The HMAC key's PBKDF2 password is the derived *encryption key*, not the raw
//! key material. That is what SQLCipher's `sqlcipher_cipher_ctx_key_derive`
//! does, and deriving it from the key material instead fails authentication on
//! every real database (`wcdb-transcode/tests/sqlcipher_reference.rs` checks
//! this against a SQLCipher build). Keep it that way.

use std::num::NonZeroU32;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use ring::pbkdf2;
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::memory::SecretBytes;

/// Length of key material and of each derived key (256 bits).
pub const KEY_LEN: usize = 32;

/// Length of the per-file salt stored at offset 0 of page 1.
pub const SALT_LEN: usize = 16;

/// SQLCipher 4 default `kdf_iter`.
pub const DEFAULT_KDF_ITERATIONS: u32 = 256_000;

/// SQLCipher `fast_kdf_iter` — iterations for the HMAC key.
pub const HMAC_KDF_ITERATIONS: u32 = 2;

/// Byte XORed into every salt byte to form the HMAC salt.
pub const HMAC_SALT_MASK: u8 = 0x3a;

/// Number of hash bytes kept in a key fingerprint (16 hex chars).
const FINGERPRINT_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// Raw 32-byte database key, as extracted from the host application.
///
/// Zeroized on drop; `Debug` is masked.
#[derive(Debug)]
pub struct KeyMaterial(SecretBytes<KEY_LEN>);

impl KeyMaterial {
    /// Copy key material from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless `bytes` is 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        SecretBytes::from_slice(bytes).map(Self)
    }

    /// Parse a 64-character hex string (case-insensitive, surrounding
    /// whitespace ignored).
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidKeyMaterial`] if the string is not valid hex
    /// - [`CryptoError::InvalidKeyLength`] if it does not decode to 32 bytes
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let decoded = HEXLOWER_PERMISSIVE
            .decode(hex.trim().as_bytes())
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("key is not valid hex: {e}")))?;
        Self::from_bytes(&decoded)
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub const fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose()
    }
}

// ---------------------------------------------------------------------------
// Derived keys
// ---------------------------------------------------------------------------

/// Per-file keys derived once from key material and salt.
#[derive(Debug)]
pub struct DerivedKeys {
    encryption_key: SecretBytes<KEY_LEN>,
    hmac_key: SecretBytes<KEY_LEN>,
}

impl DerivedKeys {
    /// AES-256-CBC page key.
    #[must_use]
    pub const fn encryption_key(&self) -> &[u8; KEY_LEN] {
        self.encryption_key.expose()
    }

    /// HMAC-SHA512 page authentication key.
    #[must_use]
    pub const fn hmac_key(&self) -> &[u8; KEY_LEN] {
        self.hmac_key.expose()
    }

    /// BLAKE3 fingerprint of the encryption key (first 8 bytes, hex).
    #[must_use]
    pub fn encryption_key_fingerprint(&self) -> String {
        fingerprint(self.encryption_key())
    }

    /// BLAKE3 fingerprint of the HMAC key (first 8 bytes, hex).
    #[must_use]
    pub fn hmac_key_fingerprint(&self) -> String {
        fingerprint(self.hmac_key())
    }
}

/// Truncated BLAKE3 hash of a key, in hex.
fn fingerprint(key: &[u8]) -> String {
    let hash = blake3::hash(key);
    HEXLOWER.encode(&hash.as_bytes()[..FINGERPRINT_LEN])
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derive the page keys with the SQLCipher 4 default of 256 000 iterations.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyLength`] unless `key_material` is 32 bytes.
pub fn derive(key_material: &[u8], salt: &[u8; SALT_LEN]) -> Result<DerivedKeys, CryptoError> {
    derive_with_iterations(key_material, salt, DEFAULT_KDF_ITERATIONS)
}

/// Derive the page keys with an explicit `kdf_iter`.
///
/// Pure and deterministic: identical inputs always yield identical keys.
///
/// # Errors
///
/// - [`CryptoError::InvalidKeyLength`] unless `key_material` is 32 bytes
/// - [`CryptoError::KeyDerivation`] if `kdf_iterations` is zero
pub fn derive_with_iterations(
    key_material: &[u8],
    salt: &[u8; SALT_LEN],
    kdf_iterations: u32,
) -> Result<DerivedKeys, CryptoError> {
    if key_material.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: key_material.len(),
        });
    }
    let iterations = NonZeroU32::new(kdf_iterations)
        .ok_or_else(|| CryptoError::KeyDerivation("kdf iterations must be at least 1".into()))?;
    let hmac_iterations = NonZeroU32::new(HMAC_KDF_ITERATIONS)
        .ok_or_else(|| CryptoError::KeyDerivation("hmac iterations must be at least 1".into()))?;

    let mut enc = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA512,
        iterations,
        salt,
        key_material,
        &mut enc,
    );

    let mut hmac_salt = hmac_salt(salt);
    let mut mac = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA512,
        hmac_iterations,
        &hmac_salt,
        &enc,
        &mut mac,
    );
    hmac_salt.zeroize();

    let keys = DerivedKeys {
        encryption_key: SecretBytes::new(enc),
        hmac_key: SecretBytes::new(mac),
    };
    enc.zeroize();
    mac.zeroize();
    Ok(keys)
}

/// `salt ^ 0x3a` byte-wise.
fn hmac_salt(salt: &[u8; SALT_LEN]) -> [u8; SALT_LEN] {
    let mut out = *salt;
    for b in &mut out {
        *b ^= HMAC_SALT_MASK;
    }
    out
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Low iteration count so unit tests stay fast.
    const TEST_ITER: u32 = 64;

    const TEST_SALT: &[u8; SALT_LEN] = b"0123456789abcdef";

    #[test]
    fn derive_is_deterministic() {
        let a = derive_with_iterations(&[0x11; KEY_LEN], TEST_SALT, TEST_ITER).unwrap();
        let b = derive_with_iterations(&[0x11; KEY_LEN], TEST_SALT, TEST_ITER).unwrap();
        assert_eq!(a.encryption_key(), b.encryption_key());
        assert_eq!(a.hmac_key(), b.hmac_key());
    }

    #[test]
    fn encryption_and_hmac_keys_differ() {
        let keys = derive_with_iterations(&[0x11; KEY_LEN], TEST_SALT, TEST_ITER).unwrap();
        assert_ne!(keys.encryption_key(), keys.hmac_key());
    }

    #[test]
    fn different_salts_produce_different_keys() {
        let a = derive_with_iterations(&[0x11; KEY_LEN], b"salt_aaaaaaaaaaa", TEST_ITER).unwrap();
        let b = derive_with_iterations(&[0x11; KEY_LEN], b"salt_bbbbbbbbbbb", TEST_ITER).unwrap();
        assert_ne!(a.encryption_key(), b.encryption_key());
        assert_ne!(a.hmac_key(), b.hmac_key());
    }

    #[test]
    fn iteration_count_changes_keys() {
        let a = derive_with_iterations(&[0x11; KEY_LEN], TEST_SALT, 1).unwrap();
        let b = derive_with_iterations(&[0x11; KEY_LEN], TEST_SALT, 2).unwrap();
        assert_ne!(a.encryption_key(), b.encryption_key());
    }

    #[test]
    fn rejects_wrong_key_lengths() {
        for len in [0usize, 1, 31, 33, 64] {
            let err = derive_with_iterations(&vec![0u8; len], TEST_SALT, TEST_ITER)
                .expect_err("wrong key length must fail");
            assert_eq!(
                err,
                CryptoError::InvalidKeyLength {
                    expected: KEY_LEN,
                    actual: len
                },
                "length {len}"
            );
        }
    }

    #[test]
    fn rejects_zero_iterations() {
        let err = derive_with_iterations(&[0u8; KEY_LEN], TEST_SALT, 0).unwrap_err();
        assert!(matches!(err, CryptoError::KeyDerivation(_)));
    }

    #[test]
    fn hmac_salt_masks_every_byte() {
        let salt = [0u8; SALT_LEN];
        assert_eq!(hmac_salt(&salt), [0x3a; SALT_LEN]);
        let salt = [0x3a; SALT_LEN];
        assert_eq!(hmac_salt(&salt), [0u8; SALT_LEN]);
    }

    #[test]
    fn key_material_from_hex_accepts_mixed_case_and_whitespace() {
        let hex = format!("  {}\n", "Ab".repeat(KEY_LEN));
        let key = KeyMaterial::from_hex(&hex).unwrap();
        assert_eq!(key.expose(), &[0xAB; KEY_LEN]);
    }

    #[test]
    fn key_material_from_hex_rejects_non_hex() {
        let err = KeyMaterial::from_hex(&"zz".repeat(KEY_LEN)).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn key_material_from_hex_rejects_short_key() {
        let err = KeyMaterial::from_hex(&"ab".repeat(31)).unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: 31
            }
        );
    }

    #[test]
    fn key_material_debug_is_masked() {
        let key = KeyMaterial::from_bytes(&[0x5A; KEY_LEN]).unwrap();
        assert_eq!(format!("{key:?}"), "KeyMaterial(SecretBytes<32>(***))");
    }

    #[test]
    fn fingerprints_are_16_hex_chars_and_not_the_key() {
        let keys = derive_with_iterations(&[0x11; KEY_LEN], TEST_SALT, TEST_ITER).unwrap();
        let fp = keys.encryption_key_fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!HEXLOWER.encode(keys.encryption_key()).contains(&fp));
        assert_ne!(fp, keys.hmac_key_fingerprint());
    }

    #[test]
    fn derived_keys_debug_is_masked() {
        let keys = derive_with_iterations(&[0x11; KEY_LEN], TEST_SALT, TEST_ITER).unwrap();
        let debug = format!("{keys:?}");
        assert!(debug.contains("***"));
        assert!(!debug.contains(&HEXLOWER.encode(keys.encryption_key())));
    }
}
