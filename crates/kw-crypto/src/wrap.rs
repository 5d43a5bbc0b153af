//! Authenticated key wrapping: XChaCha20 encrypt-then-HMAC-SHA256.
//!
//! Sealed blob layout:
//! ```text
//! nonce      24 bytes  random per wrap
//! ciphertext 32 bytes  XChaCha20(enc_key, nonce) ⊕ payload
//! tag        32 bytes  HMAC-SHA256(mac_key, nonce || ciphertext)
//! ```
//! `enc_key` and `mac_key` are independent HKDF expansions of the wrapping
//! key. The tag is checked in constant time before anything is decrypted.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use kw_core::{KwError, KwResult};

use crate::buffer::KeyBuffer;
use crate::kdf::hkdf_expand;
use crate::{KEY_LEN, NONCE_LEN, TAG_LEN};

type HmacSha256 = Hmac<Sha256>;

const ENC_KEY_INFO: &[u8] = b"keywarden wrap encryption key";
const MAC_KEY_INFO: &[u8] = b"keywarden wrap authentication key";

/// A key sealed under a wrapping key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "b64")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "b64")]
    pub ciphertext: [u8; KEY_LEN],
    #[serde(with = "b64")]
    pub tag: [u8; TAG_LEN],
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedKey")
            .field("nonce", &hex_prefix(&self.nonce))
            .finish_non_exhaustive()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Seal `payload` under `wrapping_key` with a fresh random nonce.
pub fn wrap(wrapping_key: &KeyBuffer, payload: &KeyBuffer) -> KwResult<WrappedKey> {
    let enc_key = hkdf_expand(wrapping_key, ENC_KEY_INFO)?;
    let mac_key = hkdf_expand(wrapping_key, MAC_KEY_INFO)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    // Encrypt in a wiped scratch buffer; only ciphertext leaves it.
    let mut scratch = payload.duplicate();
    let mut cipher = XChaCha20::new(enc_key.as_bytes().into(), (&nonce).into());
    cipher.apply_keystream(scratch.as_mut_bytes());
    let ciphertext = *scratch.as_bytes();

    let tag = compute_tag(&mac_key, &nonce, &ciphertext)?;

    Ok(WrappedKey {
        nonce,
        ciphertext,
        tag,
    })
}

/// Verify and open a sealed blob.
///
/// Fails with [`KwError::AuthenticationFailed`] if the tag does not match;
/// nothing is decrypted in that case.
pub fn unwrap(wrapping_key: &KeyBuffer, sealed: &WrappedKey) -> KwResult<KeyBuffer> {
    let mac_key = hkdf_expand(wrapping_key, MAC_KEY_INFO)?;
    let mut mac = new_mac(&mac_key)?;
    mac.update(&sealed.nonce);
    mac.update(&sealed.ciphertext);
    mac.verify_slice(&sealed.tag)
        .map_err(|_| KwError::AuthenticationFailed)?;

    let enc_key = hkdf_expand(wrapping_key, ENC_KEY_INFO)?;
    let mut payload = KeyBuffer::zeroed();
    payload.as_mut_bytes().copy_from_slice(&sealed.ciphertext);
    let mut cipher = XChaCha20::new(enc_key.as_bytes().into(), (&sealed.nonce).into());
    cipher.apply_keystream(payload.as_mut_bytes());
    Ok(payload)
}

fn new_mac(mac_key: &KeyBuffer) -> KwResult<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(mac_key.as_bytes())
        .map_err(|e| KwError::Crypto(format!("HMAC init failed: {e}")))
}

fn compute_tag(
    mac_key: &KeyBuffer,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8; KEY_LEN],
) -> KwResult<[u8; TAG_LEN]> {
    let mut mac = new_mac(mac_key)?;
    mac.update(nonce);
    mac.update(ciphertext);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// Serde helper: fixed-size byte arrays as standard base64 strings.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let decoded = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
        decoded.try_into().map_err(|v: Vec<u8>| {
            serde::de::Error::custom(format!("expected {N} bytes, got {}", v.len()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_wrapping_key() -> KeyBuffer {
        KeyBuffer::from_slice(&[42u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let wrapping_key = test_wrapping_key();
        let payload = KeyBuffer::random();

        let sealed = wrap(&wrapping_key, &payload).unwrap();
        let opened = unwrap(&wrapping_key, &sealed).unwrap();

        assert_eq!(payload.as_bytes(), opened.as_bytes());
        assert_ne!(&sealed.ciphertext, payload.as_bytes(), "ciphertext must not be plaintext");
    }

    #[test]
    fn test_wrap_leaves_payload_untouched() {
        let payload = KeyBuffer::from_slice(&[7u8; KEY_LEN]).unwrap();
        let sealed = wrap(&test_wrapping_key(), &payload).unwrap();
        assert_eq!(payload.as_bytes(), &[7u8; KEY_LEN]);
        assert!(sealed.ciphertext.iter().any(|b| *b != 7));
    }

    #[test]
    fn test_unwrap_wrong_key() {
        let payload = KeyBuffer::random();
        let sealed = wrap(&KeyBuffer::from_slice(&[1u8; KEY_LEN]).unwrap(), &payload).unwrap();
        let result = unwrap(&KeyBuffer::from_slice(&[2u8; KEY_LEN]).unwrap(), &sealed);
        assert!(matches!(result, Err(KwError::AuthenticationFailed)));
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let wrapping_key = test_wrapping_key();
        let sealed = wrap(&wrapping_key, &KeyBuffer::random()).unwrap();

        for byte in 0..KEY_LEN {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                assert!(matches!(
                    unwrap(&wrapping_key, &tampered),
                    Err(KwError::AuthenticationFailed)
                ));
            }
        }
        for byte in 0..TAG_LEN {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered.tag[byte] ^= 1 << bit;
                assert!(matches!(
                    unwrap(&wrapping_key, &tampered),
                    Err(KwError::AuthenticationFailed)
                ));
            }
        }
        for byte in 0..NONCE_LEN {
            let mut tampered = sealed.clone();
            tampered.nonce[byte] ^= 0x80;
            assert!(unwrap(&wrapping_key, &tampered).is_err());
        }
    }

    #[test]
    fn test_nonces_unique_across_10k_wraps() {
        let wrapping_key = test_wrapping_key();
        let payload = KeyBuffer::random();
        let mut seen = HashSet::with_capacity(10_000);
        for _ in 0..10_000 {
            let sealed = wrap(&wrapping_key, &payload).unwrap();
            assert!(seen.insert(sealed.nonce), "nonce reused");
        }
    }

    #[test]
    fn test_same_payload_wraps_differently() {
        let wrapping_key = test_wrapping_key();
        let payload = KeyBuffer::random();
        let a = wrap(&wrapping_key, &payload).unwrap();
        let b = wrap(&wrapping_key, &payload).unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.tag, b.tag);
    }

    #[test]
    fn test_serde_base64_fields() {
        let sealed = wrap(&test_wrapping_key(), &KeyBuffer::random()).unwrap();
        let json = serde_json::to_value(&sealed).unwrap();
        assert!(json["nonce"].is_string());
        let back: WrappedKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, sealed);
    }

    #[test]
    fn test_serde_rejects_truncated_field() {
        let json = serde_json::json!({
            "nonce": "AAAA",
            "ciphertext": "AAAA",
            "tag": "AAAA",
        });
        assert!(serde_json::from_value::<WrappedKey>(json).is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn roundtrip_any_keys(wk in any::<[u8; KEY_LEN]>(), pk in any::<[u8; KEY_LEN]>()) {
                let wrapping_key = KeyBuffer::from_slice(&wk).unwrap();
                let payload = KeyBuffer::from_slice(&pk).unwrap();
                let sealed = wrap(&wrapping_key, &payload).unwrap();
                let opened = unwrap(&wrapping_key, &sealed).unwrap();
                prop_assert_eq!(opened.as_bytes(), payload.as_bytes());
            }

            #[test]
            fn flipped_bit_never_yields_plaintext(
                pk in any::<[u8; KEY_LEN]>(),
                idx in 0usize..(KEY_LEN + TAG_LEN),
                bit in 0u8..8,
            ) {
                let wrapping_key = test_wrapping_key();
                let payload = KeyBuffer::from_slice(&pk).unwrap();
                let mut sealed = wrap(&wrapping_key, &payload).unwrap();
                if idx < KEY_LEN {
                    sealed.ciphertext[idx] ^= 1 << bit;
                } else {
                    sealed.tag[idx - KEY_LEN] ^= 1 << bit;
                }
                prop_assert!(matches!(unwrap(&wrapping_key, &sealed), Err(KwError::AuthenticationFailed)));
            }
        }
    }
}
