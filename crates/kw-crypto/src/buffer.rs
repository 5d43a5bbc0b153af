//! Fixed-size, heap-pinned key buffer that is wiped on drop.

use rand::RngCore;
use zeroize::Zeroize;

use kw_core::{KwError, KwResult};

use crate::KEY_LEN;

/// Holds exactly [`KEY_LEN`] bytes of key material.
///
/// The bytes live in a single heap allocation so moving the buffer never
/// leaves stale copies on the stack. They are zeroized on drop, including
/// during unwinding (see `tests/wipe_on_drop.rs`). The type is neither
/// `Clone` nor `Copy`.
pub struct KeyBuffer {
    bytes: Box<[u8; KEY_LEN]>,
}

impl KeyBuffer {
    /// A buffer of zeroes, to be filled in place.
    pub fn zeroed() -> Self {
        Self {
            bytes: Box::new([0u8; KEY_LEN]),
        }
    }

    /// A buffer filled from the OS CSPRNG.
    pub fn random() -> Self {
        let mut key = Self::zeroed();
        rand::thread_rng().fill_bytes(key.as_mut_bytes());
        key
    }

    /// Copy key material out of `src`, which must be exactly [`KEY_LEN`]
    /// bytes. The caller remains responsible for wiping `src`.
    pub fn from_slice(src: &[u8]) -> KwResult<Self> {
        if src.len() != KEY_LEN {
            return Err(KwError::Crypto(format!(
                "key material has wrong size: {} bytes (expected {KEY_LEN})",
                src.len()
            )));
        }
        let mut key = Self::zeroed();
        key.as_mut_bytes().copy_from_slice(src);
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8; KEY_LEN] {
        &mut self.bytes
    }

    /// Copy into a fresh buffer. Each copy is wiped independently.
    pub fn duplicate(&self) -> Self {
        let mut key = Self::zeroed();
        key.as_mut_bytes().copy_from_slice(self.as_bytes());
        key
    }
}

impl Drop for KeyBuffer {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for KeyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBuffer")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
