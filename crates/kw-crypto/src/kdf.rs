//! Key derivation: Argon2id passphrase → protector key, HKDF key file →
//! protector key, and domain-separated wrapping keys.

use std::time::{Duration, Instant};

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use kw_core::{KwError, KwResult};

use crate::buffer::KeyBuffer;
use crate::{KEY_LEN, SALT_LEN};

const KEYFILE_SALT: &[u8] = b"keywarden keyfile v1";
const KEYFILE_INFO: &[u8] = b"keywarden keyfile protector key";
const KEYFILE_FINGERPRINT_CONTEXT: &str = "keywarden 2024-06 keyfile fingerprint v1";
const POLICY_IDENTIFIER_CONTEXT: &str = "keywarden 2024-06 policy key identifier v1";
const WRAPPING_KEY_PREFIX: &[u8] = b"keywarden wrapping key v1/";

/// Argon2id cost parameters, stored next to the salt of every passphrase
/// protector so the derivation can be reproduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashingCosts {
    /// Time cost / iterations
    pub time: u32,
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub parallelism: u32,
}

impl Default for HashingCosts {
    fn default() -> Self {
        Self {
            time: 3,
            memory_kib: 65536,
            parallelism: 4,
        }
    }
}

impl HashingCosts {
    /// Fast costs for tests. Never use for real protectors.
    pub const fn insecure_for_tests() -> Self {
        Self {
            time: 1,
            memory_kib: 1024,
            parallelism: 1,
        }
    }

    fn params(&self) -> KwResult<Params> {
        Params::new(self.memory_kib, self.time, self.parallelism, Some(KEY_LEN))
            .map_err(|e| KwError::Crypto(format!("invalid Argon2id costs {self:?}: {e}")))
    }
}

/// Distinguishes the classes of payload a protector key may wrap, so one
/// protector key never wraps two classes under the same derived key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapContext {
    /// Wrapping a policy key into a policy record
    PolicyKey,
    /// Wrapping a protector key (e.g. under a session secret)
    ProtectorKey,
    /// Wrapping material under the login session secret
    LoginSession,
}

impl WrapContext {
    fn label(self) -> &'static [u8] {
        match self {
            Self::PolicyKey => b"policy",
            Self::ProtectorKey => b"protector",
            Self::LoginSession => b"login-session",
        }
    }
}

/// Generate a random Argon2id salt.
pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a protector key from a passphrase using Argon2id.
///
/// Deterministic for identical inputs; deliberately slow.
pub fn derive_passphrase_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_LEN],
    costs: &HashingCosts,
) -> KwResult<KeyBuffer> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, costs.params()?);

    let started = Instant::now();
    let mut key = KeyBuffer::zeroed();
    argon2
        .hash_password_into(
            passphrase.expose_secret().as_bytes(),
            salt,
            key.as_mut_bytes(),
        )
        .map_err(|e| KwError::Crypto(format!("Argon2id KDF failed: {e}")))?;

    tracing::debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        time = costs.time,
        memory_kib = costs.memory_kib,
        "derived passphrase key"
    );
    Ok(key)
}

/// Derive a protector key from the raw bytes of a key file.
///
/// The entropy comes from the file itself, so a fast extract-and-expand is
/// enough here.
pub fn derive_file_key(file_bytes: &[u8]) -> KwResult<KeyBuffer> {
    let hkdf = Hkdf::<Sha256>::new(Some(KEYFILE_SALT), file_bytes);
    let mut key = KeyBuffer::zeroed();
    hkdf.expand(KEYFILE_INFO, key.as_mut_bytes())
        .map_err(|e| KwError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

/// One-way fingerprint of a key file, used only to recognise the right file.
pub fn keyfile_fingerprint(file_bytes: &[u8]) -> [u8; 32] {
    blake3::derive_key(KEYFILE_FINGERPRINT_CONTEXT, file_bytes)
}

/// Public identifier of a policy key, as a filesystem would assign it.
pub fn policy_key_identifier(policy_key: &KeyBuffer) -> [u8; 16] {
    let digest = blake3::derive_key(POLICY_IDENTIFIER_CONTEXT, policy_key.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id
}

/// Derive the key actually used for wrapping from a protector key and a
/// context label.
pub fn derive_wrapping_key(protector_key: &KeyBuffer, context: WrapContext) -> KwResult<KeyBuffer> {
    let mut info = Vec::with_capacity(WRAPPING_KEY_PREFIX.len() + 16);
    info.extend_from_slice(WRAPPING_KEY_PREFIX);
    info.extend_from_slice(context.label());
    hkdf_expand(protector_key, &info)
}

/// HKDF-SHA256 expand of a full-length key into a fresh buffer.
pub(crate) fn hkdf_expand(ikm: &KeyBuffer, info: &[u8]) -> KwResult<KeyBuffer> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm.as_bytes());
    let mut okm = KeyBuffer::zeroed();
    hkdf.expand(info, okm.as_mut_bytes())
        .map_err(|e| KwError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Find Argon2id costs for which one derivation takes at least `target`.
///
/// Memory is doubled first (up to `max_memory_kib`), then the time cost.
pub fn calibrate_costs(
    target: Duration,
    max_memory_kib: u32,
    parallelism: u32,
) -> KwResult<HashingCosts> {
    let passphrase = SecretString::from("keywarden calibration");
    let salt = [0u8; SALT_LEN];
    let min_memory = 8 * parallelism.max(1);

    let mut costs = HashingCosts {
        time: 1,
        memory_kib: (8 * 1024).clamp(min_memory, max_memory_kib.max(min_memory)),
        parallelism: parallelism.max(1),
    };

    loop {
        let started = Instant::now();
        derive_passphrase_key(&passphrase, &salt, &costs)?;
        let elapsed = started.elapsed();
        tracing::debug!(?costs, elapsed_ms = elapsed.as_millis() as u64, "calibration round");

        if elapsed >= target {
            return Ok(costs);
        }
        if costs.memory_kib < max_memory_kib {
            costs.memory_kib = costs.memory_kib.saturating_mul(2).min(max_memory_kib);
        } else if costs.time < 1 << 16 {
            costs.time = costs.time.saturating_mul(2);
        } else {
            return Ok(costs);
        }
    }
}
