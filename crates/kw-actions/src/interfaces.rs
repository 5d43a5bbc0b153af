//! Narrow seams to the operating system.
//!
//! The engine never talks to the kernel keyring, the terminal or the
//! encryption-policy ioctls directly; it calls these traits. The binary
//! provides real implementations, tests provide in-memory ones.

use std::path::Path;

use secrecy::SecretString;
use zeroize::Zeroizing;

use kw_core::{KeyState, KwResult, PolicyDescriptor};
use kw_crypto::KeyBuffer;

/// The OS active-key registry. It, not the engine, is authoritative for
/// whether a policy is unlocked.
pub trait Keyring {
    fn apply_key(&self, policy: &PolicyDescriptor, key: &KeyBuffer) -> KwResult<()>;

    /// Evict the key. Fails with `StillInUse` if other users of the key
    /// remain, unless `force` is set.
    fn evict_key(&self, policy: &PolicyDescriptor, force: bool) -> KwResult<()>;

    fn query_state(&self, policy: &PolicyDescriptor) -> KeyState;

    /// Whether `evict_key` can tell that a key is still in use. Registries
    /// that cannot always evict and never report `StillInUse`.
    fn detects_key_users(&self) -> bool {
        true
    }
}

/// Where secrets come from when they were not supplied up front.
pub trait SecretSource {
    /// Prompt for a passphrase. `prompt` is shown to the user verbatim.
    fn prompt_passphrase(&self, prompt: &str) -> KwResult<SecretString>;

    fn read_keyfile(&self, path: &Path) -> KwResult<Zeroizing<Vec<u8>>>;

    /// The OS-managed login session secret.
    fn session_secret(&self) -> KwResult<KeyBuffer>;
}

/// Ownership and emptiness of a directory, as far as policy creation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryInfo {
    pub owner: u32,
    pub is_empty: bool,
}

/// The OS encryption-policy subsystem.
pub trait PolicyApi {
    /// The policy a directory is encrypted with, if any.
    fn directory_policy(&self, dir: &Path) -> KwResult<Option<PolicyDescriptor>>;

    fn directory_info(&self, dir: &Path) -> KwResult<DirectoryInfo>;

    /// The descriptor the subsystem assigns to a policy key.
    fn key_descriptor(&self, key: &KeyBuffer) -> KwResult<PolicyDescriptor>;

    fn set_directory_policy(&self, dir: &Path, policy: &PolicyDescriptor) -> KwResult<()>;
}
