//! In-memory collaborators for tests.
//!
//! Together with [`kw_metadata::MemoryBackend`] these let the whole engine
//! run without a kernel keyring, a terminal or an encrypting filesystem.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use zeroize::Zeroizing;

use kw_core::{KeyState, KwError, KwResult, PolicyDescriptor};
use kw_crypto::{policy_key_identifier, KeyBuffer};

use crate::interfaces::{DirectoryInfo, Keyring, PolicyApi, SecretSource};

#[derive(Default)]
struct KeyringState {
    applied: BTreeMap<PolicyDescriptor, KeyBuffer>,
    in_use: BTreeSet<PolicyDescriptor>,
    fail_apply: bool,
    apply_calls: usize,
}

/// Active-key registry kept in a map.
#[derive(Default)]
pub struct MockKeyring {
    state: RefCell<KeyringState>,
}

impl MockKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the key currently applied for `policy`.
    pub fn applied_key(&self, policy: &PolicyDescriptor) -> Option<KeyBuffer> {
        self.state.borrow().applied.get(policy).map(KeyBuffer::duplicate)
    }

    pub fn apply_calls(&self) -> usize {
        self.state.borrow().apply_calls
    }

    /// Pretend another mount still uses the key, so eviction needs force.
    pub fn mark_in_use(&self, policy: &PolicyDescriptor) {
        self.state.borrow_mut().in_use.insert(*policy);
    }

    pub fn fail_apply(&self, fail: bool) {
        self.state.borrow_mut().fail_apply = fail;
    }

    /// Drop a key behind the engine's back, as another process would.
    pub fn evict_externally(&self, policy: &PolicyDescriptor) {
        self.state.borrow_mut().applied.remove(policy);
    }
}

impl Keyring for MockKeyring {
    fn apply_key(&self, policy: &PolicyDescriptor, key: &KeyBuffer) -> KwResult<()> {
        let mut state = self.state.borrow_mut();
        state.apply_calls += 1;
        if state.fail_apply {
            return Err(KwError::Keyring("simulated keyring failure".into()));
        }
        state.applied.insert(*policy, key.duplicate());
        Ok(())
    }

    fn evict_key(&self, policy: &PolicyDescriptor, force: bool) -> KwResult<()> {
        let mut state = self.state.borrow_mut();
        if state.in_use.contains(policy) && !force {
            return Err(KwError::StillInUse { policy: *policy });
        }
        state.in_use.remove(policy);
        state.applied.remove(policy);
        Ok(())
    }

    fn query_state(&self, policy: &PolicyDescriptor) -> KeyState {
        if self.state.borrow().applied.contains_key(policy) {
            KeyState::Unlocked
        } else {
            KeyState::Locked
        }
    }
}

/// Scripted secrets: queued passphrase answers, named key files and an
/// optional session secret.
#[derive(Default)]
pub struct MockSecrets {
    passphrases: RefCell<VecDeque<String>>,
    keyfiles: HashMap<PathBuf, Vec<u8>>,
    session: Option<KeyBuffer>,
    prompts: RefCell<Vec<String>>,
}

impl MockSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, passphrase: &str) -> Self {
        self.passphrases.borrow_mut().push_back(passphrase.to_owned());
        self
    }

    pub fn with_keyfile(mut self, path: impl Into<PathBuf>, contents: Vec<u8>) -> Self {
        self.keyfiles.insert(path.into(), contents);
        self
    }

    pub fn with_session(mut self, session: KeyBuffer) -> Self {
        self.session = Some(session);
        self
    }

    /// Prompts shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl SecretSource for MockSecrets {
    fn prompt_passphrase(&self, prompt: &str) -> KwResult<SecretString> {
        self.prompts.borrow_mut().push(prompt.to_owned());
        self.passphrases
            .borrow_mut()
            .pop_front()
            .map(SecretString::from)
            .ok_or_else(|| KwError::SecretSource("no passphrase scripted".into()))
    }

    fn read_keyfile(&self, path: &Path) -> KwResult<Zeroizing<Vec<u8>>> {
        self.keyfiles
            .get(path)
            .map(|bytes| Zeroizing::new(bytes.clone()))
            .ok_or_else(|| {
                KwError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} not found", path.display()),
                ))
            })
    }

    fn session_secret(&self) -> KwResult<KeyBuffer> {
        self.session
            .as_ref()
            .map(KeyBuffer::duplicate)
            .ok_or_else(|| KwError::SecretSource("no login session secret".into()))
    }
}

#[derive(Debug, Clone)]
struct MockDir {
    info: DirectoryInfo,
    policy: Option<PolicyDescriptor>,
}

/// Directories with an owner, an emptiness flag and maybe a policy.
#[derive(Default)]
pub struct MockPolicyApi {
    dirs: RefCell<HashMap<PathBuf, MockDir>>,
    fail_set: RefCell<bool>,
}

impl MockPolicyApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&self, dir: impl Into<PathBuf>, owner: u32, is_empty: bool) {
        self.dirs.borrow_mut().insert(
            dir.into(),
            MockDir {
                info: DirectoryInfo { owner, is_empty },
                policy: None,
            },
        );
    }

    pub fn fail_set(&self, fail: bool) {
        *self.fail_set.borrow_mut() = fail;
    }
}

impl PolicyApi for MockPolicyApi {
    fn directory_policy(&self, dir: &Path) -> KwResult<Option<PolicyDescriptor>> {
        self.dirs
            .borrow()
            .get(dir)
            .map(|d| d.policy)
            .ok_or_else(|| KwError::PolicyApi(format!("{} does not exist", dir.display())))
    }

    fn directory_info(&self, dir: &Path) -> KwResult<DirectoryInfo> {
        self.dirs
            .borrow()
            .get(dir)
            .map(|d| d.info)
            .ok_or_else(|| KwError::PolicyApi(format!("{} does not exist", dir.display())))
    }

    fn key_descriptor(&self, key: &KeyBuffer) -> KwResult<PolicyDescriptor> {
        Ok(PolicyDescriptor::from_bytes(policy_key_identifier(key)))
    }

    fn set_directory_policy(&self, dir: &Path, policy: &PolicyDescriptor) -> KwResult<()> {
        if *self.fail_set.borrow() {
            return Err(KwError::PolicyApi("simulated policy failure".into()));
        }
        let mut dirs = self.dirs.borrow_mut();
        let entry = dirs
            .get_mut(dir)
            .ok_or_else(|| KwError::PolicyApi(format!("{} does not exist", dir.display())))?;
        entry.policy = Some(*policy);
        Ok(())
    }
}
