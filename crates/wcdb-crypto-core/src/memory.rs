//! Secure memory for key material.
//!
//! [`SecretBytes`] is the only container key material and derived keys are
//! stored in. It:
//! - zeroes its bytes on drop via [`zeroize`]
//! - tries to `mlock` them so they stay out of swap
//! - masks itself in `Debug`/`Display`
//!
//! [`disable_core_dumps`] is called once by the command-line front end before
//! any key is parsed.

use crate::error::CryptoError;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Memory locking
// ---------------------------------------------------------------------------

/// RAII guard over an `mlock`ed region; unlocks on drop.
struct LockedRegion {
    ptr: *const u8,
    len: usize,
    locked: bool,
}

// SAFETY: the pointer is only handed to mlock/munlock, which are thread-safe.
// The bytes themselves are owned and accessed through `SecretBytes`.
unsafe impl Send for LockedRegion {}
unsafe impl Sync for LockedRegion {}

impl LockedRegion {
    const fn unlocked() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
            locked: false,
        }
    }

    /// Lock `len` bytes at `ptr`. Failure is soft: the region is simply left
    /// unlocked and a one-time warning is printed.
    fn try_lock(ptr: *const u8, len: usize) -> Self {
        let locked = platform::try_mlock(ptr, len);
        if !locked && len > 0 {
            static WARNED: std::sync::Once = std::sync::Once::new();
            WARNED.call_once(|| {
                eprintln!(
                    "[wcdb-crypto-core] WARNING: mlock failed — \
                     key material may be swapped to disk. \
                     Consider increasing RLIMIT_MEMLOCK."
                );
            });
        }
        Self { ptr, len, locked }
    }
}

impl Drop for LockedRegion {
    fn drop(&mut self) {
        if self.locked {
            platform::try_munlock(self.ptr, self.len);
        }
    }
}

// ---------------------------------------------------------------------------
// SecretBytes<N>
// ---------------------------------------------------------------------------

/// Fixed-size secret: raw key material, derived encryption and HMAC keys.
///
/// Zeroized on drop. Moving the value (e.g. returning it from a function)
/// leaves the `mlock` pointing at the old address; `munlock` on a stale
/// address is a harmless no-op and zeroization does not depend on it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes<const N: usize> {
    bytes: [u8; N],
    #[zeroize(skip)]
    lock: LockedRegion,
}

impl<const N: usize> SecretBytes<N> {
    /// Take ownership of `data`.
    #[must_use]
    pub fn new(data: [u8; N]) -> Self {
        let mut s = Self {
            bytes: data,
            lock: LockedRegion::unlocked(),
        };
        s.lock = LockedRegion::try_lock(s.bytes.as_ptr(), N);
        s
    }

    /// Copy `data` into a new secret, failing if it is not exactly `N` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] on a length mismatch.
    pub fn from_slice(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() != N {
            return Err(CryptoError::InvalidKeyLength {
                expected: N,
                actual: data.len(),
            });
        }
        let mut arr = [0u8; N];
        arr.copy_from_slice(data);
        let secret = Self::new(arr);
        arr.zeroize();
        Ok(secret)
    }

    /// Borrow the raw bytes for a cryptographic operation.
    #[must_use]
    pub const fn expose(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Whether the backing memory is currently `mlock`ed.
    #[must_use]
    pub const fn is_mlocked(&self) -> bool {
        self.lock.locked
    }
}

impl<const N: usize> fmt::Debug for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

impl<const N: usize> fmt::Display for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

impl<const N: usize> From<[u8; N]> for SecretBytes<N> {
    fn from(data: [u8; N]) -> Self {
        Self::new(data)
    }
}

// ---------------------------------------------------------------------------
// Core dumps
// ---------------------------------------------------------------------------

/// Set `RLIMIT_CORE` to 0 so a crash cannot write key material to disk.
/// No-op off Unix.
///
/// # Errors
///
/// Returns [`CryptoError::SecureMemory`] if `setrlimit` fails.
pub fn disable_core_dumps() -> Result<(), CryptoError> {
    platform::disable_core_dumps_impl()
}

#[cfg(unix)]
mod platform {
    use crate::error::CryptoError;

    pub(super) fn try_mlock(ptr: *const u8, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        // SAFETY: mlock only inspects the address range; an invalid range
        // yields ENOMEM, which we treat as "not locked".
        unsafe { libc::mlock(ptr.cast(), len) == 0 }
    }

    pub(super) fn try_munlock(ptr: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: see `try_mlock`. Failure is non-critical.
        unsafe {
            libc::munlock(ptr.cast(), len);
        }
    }

    pub(super) fn disable_core_dumps_impl() -> Result<(), CryptoError> {
        let limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: plain POSIX call with a valid, initialized rlimit.
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &raw const limit) };
        if ret != 0 {
            return Err(CryptoError::SecureMemory(
                "failed to disable core dumps via RLIMIT_CORE".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod platform {
    use crate::error::CryptoError;

    pub(super) fn try_mlock(_ptr: *const u8, _len: usize) -> bool {
        false
    }

    pub(super) fn try_munlock(_ptr: *const u8, _len: usize) {}

    pub(super) fn disable_core_dumps_impl() -> Result<(), CryptoError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_and_expose_roundtrip() {
        let data: [u8; 32] = [0xAB; 32];
        let key = SecretBytes::new(data);
        assert_eq!(key.expose(), &data);
    }

    #[test]
    fn from_slice_accepts_exact_length() {
        let key = SecretBytes::<16>::from_slice(&[7u8; 16]).expect("16 bytes should fit");
        assert_eq!(key.expose(), &[7u8; 16]);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        let err = SecretBytes::<32>::from_slice(&[0u8; 31]).expect_err("31 bytes must fail");
        assert_eq!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 31
            }
        );
    }

    #[test]
    fn debug_and_display_are_masked() {
        let key = SecretBytes::<32>::new([0xFF; 32]);
        assert_eq!(format!("{key:?}"), "SecretBytes<32>(***)");
        assert_eq!(format!("{key}"), "SecretBytes<32>(***)");
        assert!(!format!("{key:?}").to_lowercase().contains("ff"));
    }

    #[test]
    fn from_array() {
        let key: SecretBytes<16> = [0x42; 16].into();
        assert_eq!(key.expose(), &[0x42; 16]);
    }

    #[cfg(unix)]
    #[test]
    fn mlock_status_is_reported() {
        let key = SecretBytes::<32>::new([1; 32]);
        let _ = key.is_mlocked();
    }

    #[cfg(unix)]
    #[test]
    fn disable_core_dumps_sets_zero_limit() {
        disable_core_dumps().expect("disable_core_dumps should succeed");

        let mut limit = libc::rlimit {
            rlim_cur: 1,
            rlim_max: 1,
        };
        let ret = unsafe { libc::getrlimit(libc::RLIMIT_CORE, &raw mut limit) };
        assert_eq!(ret, 0);
        assert_eq!(limit.rlim_cur, 0);
        assert_eq!(limit.rlim_max, 0);
    }
}
