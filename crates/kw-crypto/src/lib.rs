//! kw-crypto: key material handling for keywarden
//!
//! Key hierarchy:
//! ```text
//! Passphrase ──Argon2id(salt, costs)──┐
//! Key file   ──HKDF-SHA256────────────┼──► Protector Key (256-bit)
//! Session    ──unwrap(session secret)─┘        │
//!                                              │ HKDF(info = "policy")
//!                                              ▼
//!                                       Wrapping Key ──► wrap(Policy Key)
//!
//! wrap(K, P):  enc = HKDF(K, "enc"), mac = HKDF(K, "mac")
//!              C   = XChaCha20(enc, nonce) ⊕ P
//!              T   = HMAC-SHA256(mac, nonce || C)
//! ```

pub mod buffer;
pub mod kdf;
pub mod recovery;
pub mod wrap;

pub use buffer::KeyBuffer;
pub use kdf::{
    calibrate_costs, derive_file_key, derive_passphrase_key, derive_wrapping_key,
    keyfile_fingerprint, policy_key_identifier, random_salt, HashingCosts, WrapContext,
};
pub use recovery::{generate_recovery_passphrase, is_recovery_passphrase};
pub use wrap::{unwrap, wrap, WrappedKey};

/// Length of policy keys, protector keys, and wrapping keys (256-bit)
pub const KEY_LEN: usize = 32;

/// Size of an XChaCha20 nonce (192-bit)
pub const NONCE_LEN: usize = 24;

/// Size of an HMAC-SHA256 tag
pub const TAG_LEN: usize = 32;

/// Size of an Argon2id salt
pub const SALT_LEN: usize = 16;
