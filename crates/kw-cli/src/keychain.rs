//! Platform keychain as the active-key registry and the home of the login
//! session secret.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS: Keychain Services
//! - Linux: GNOME Keyring / Secret Service (D-Bus)
//! - Windows: Credential Manager (DPAPI)
//!
//! Applied policy keys never sit in the keychain in the clear: each one is
//! wrapped under the session secret before it is stored.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::{Zeroize, Zeroizing};

use kw_actions::Keyring;
use kw_core::{KeyState, KwError, KwResult, PolicyDescriptor};
use kw_crypto::{derive_wrapping_key, wrap, KeyBuffer, WrapContext};

/// Well-known keychain entry names
pub mod keys {
    /// The login session secret (base64)
    pub const SESSION_SECRET: &str = "session-secret";
    /// Prefix of applied policy keys; followed by the policy descriptor
    pub const POLICY_PREFIX: &str = "policy-";
}

pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> KwResult<keyring::Entry> {
        keyring::Entry::new(&self.service, name)
            .map_err(|e| KwError::Keyring(format!("keychain entry creation: {e}")))
    }

    fn get(&self, name: &str) -> KwResult<Option<Zeroizing<String>>> {
        match self.entry(name)?.get_password() {
            Ok(password) => Ok(Some(Zeroizing::new(password))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KwError::Keyring(format!("keychain get for '{name}': {e}"))),
        }
    }

    fn set(&self, name: &str, value: &str) -> KwResult<()> {
        self.entry(name)?
            .set_password(value)
            .map_err(|e| KwError::Keyring(format!("keychain store for '{name}': {e}")))?;
        tracing::debug!(key = name, "stored entry in platform keychain");
        Ok(())
    }

    fn delete(&self, name: &str) -> KwResult<()> {
        match self.entry(name)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(key = name, "deleted entry from platform keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KwError::Keyring(format!("keychain delete for '{name}': {e}"))),
        }
    }

    /// The login session secret, if one has been created.
    pub fn session_secret(&self) -> KwResult<Option<KeyBuffer>> {
        let Some(encoded) = self.get(keys::SESSION_SECRET)? else {
            return Ok(None);
        };
        let mut raw = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| KwError::SecretSource(format!("session secret is not base64: {e}")))?;
        let key = KeyBuffer::from_slice(&raw);
        raw.zeroize();
        key.map(Some)
    }

    /// The login session secret, created on first use.
    pub fn ensure_session_secret(&self) -> KwResult<KeyBuffer> {
        if let Some(secret) = self.session_secret()? {
            return Ok(secret);
        }
        let secret = KeyBuffer::random();
        let encoded = Zeroizing::new(STANDARD.encode(secret.as_bytes()));
        self.set(keys::SESSION_SECRET, &encoded)?;
        tracing::info!("created login session secret");
        Ok(secret)
    }
}

fn policy_entry(policy: &PolicyDescriptor) -> String {
    format!("{}{policy}", keys::POLICY_PREFIX)
}

impl Keyring for Keychain {
    fn apply_key(&self, policy: &PolicyDescriptor, key: &KeyBuffer) -> KwResult<()> {
        let session = self.ensure_session_secret()?;
        let wrapping_key = derive_wrapping_key(&session, WrapContext::LoginSession)?;
        let sealed = wrap(&wrapping_key, key)?;
        let stored = serde_json::to_string(&sealed)
            .map_err(|e| KwError::Keyring(format!("serializing applied key: {e}")))?;
        self.set(&policy_entry(policy), &stored)
    }

    // The keychain does not track mounts; eviction cannot be refused.
    fn evict_key(&self, policy: &PolicyDescriptor, _force: bool) -> KwResult<()> {
        self.delete(&policy_entry(policy))
    }

    fn detects_key_users(&self) -> bool {
        false
    }

    fn query_state(&self, policy: &PolicyDescriptor) -> KeyState {
        match self.get(&policy_entry(policy)) {
            Ok(Some(_)) => KeyState::Unlocked,
            Ok(None) => KeyState::Locked,
            Err(e) => {
                tracing::warn!(%policy, error = %e, "could not query keychain");
                KeyState::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keychain_cannot_see_key_users() {
        assert!(!Keychain::new("keywarden-test").detects_key_users());
    }

    #[test]
    fn test_policy_entry_name() {
        let policy = PolicyDescriptor::from_bytes([0xab; 16]);
        assert_eq!(
            policy_entry(&policy),
            "policy-abababababababababababababababab"
        );
    }
}
