//! Secrets read from the controlling terminal and the filesystem.

use std::io::Read;
use std::path::Path;

use secrecy::SecretString;
use zeroize::Zeroizing;

use kw_actions::{SecretSource, MAX_KEYFILE_LEN};
use kw_core::{KwError, KwResult};
use kw_crypto::KeyBuffer;

use crate::keychain::Keychain;

pub struct TerminalSecrets<'a> {
    keychain: &'a Keychain,
}

impl<'a> TerminalSecrets<'a> {
    pub fn new(keychain: &'a Keychain) -> Self {
        Self { keychain }
    }
}

impl SecretSource for TerminalSecrets<'_> {
    fn prompt_passphrase(&self, prompt: &str) -> KwResult<SecretString> {
        let passphrase = rpassword::prompt_password(prompt)
            .map_err(|e| KwError::SecretSource(format!("reading passphrase: {e}")))?;
        Ok(SecretString::from(passphrase))
    }

    fn read_keyfile(&self, path: &Path) -> KwResult<Zeroizing<Vec<u8>>> {
        read_keyfile(path)
    }

    fn session_secret(&self) -> KwResult<KeyBuffer> {
        self.keychain.session_secret()?.ok_or_else(|| {
            KwError::SecretSource("no login session secret in the keychain".into())
        })
    }
}

/// Read a whole key file, refusing anything above [`MAX_KEYFILE_LEN`].
pub fn read_keyfile(path: &Path) -> KwResult<Zeroizing<Vec<u8>>> {
    let file = std::fs::File::open(path)?;
    let mut contents = Zeroizing::new(Vec::new());
    // One byte past the limit is enough to tell an oversized file apart.
    file.take(MAX_KEYFILE_LEN as u64 + 1)
        .read_to_end(&mut contents)?;
    if contents.len() > MAX_KEYFILE_LEN {
        return Err(KwError::KeyfileTooLarge {
            path: path.to_path_buf(),
            max: MAX_KEYFILE_LEN,
        });
    }
    tracing::debug!(path = %path.display(), bytes = contents.len(), "read key file");
    Ok(contents)
}
