//! BIP-39 recovery passphrases
//!
//! A recovery passphrase is an ordinary passphrase protector whose secret is
//! a freshly generated 24-word mnemonic. It is shown to the user once and
//! never stored; the 256 bits of entropy make it safe to derive with the
//! same Argon2id path as typed passphrases.

use bip39::Mnemonic;
use rand::RngCore;
use secrecy::SecretString;
use zeroize::Zeroize;

use kw_core::{KwError, KwResult};

/// Generate a new 24-word recovery passphrase.
pub fn generate_recovery_passphrase() -> KwResult<SecretString> {
    let mut entropy = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut entropy);

    let mnemonic = Mnemonic::from_entropy(&entropy);
    entropy.zeroize();
    let mnemonic =
        mnemonic.map_err(|e| KwError::Crypto(format!("BIP-39 mnemonic generation failed: {e}")))?;

    Ok(SecretString::from(mnemonic.to_string()))
}

/// Whether `words` is a well-formed BIP-39 mnemonic (checksum included).
pub fn is_recovery_passphrase(words: &str) -> bool {
    words.parse::<Mnemonic>().is_ok()
}
