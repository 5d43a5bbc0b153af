//! Secrets supplied to protector operations.

use std::fmt;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use kw_core::{KwError, KwResult, ProtectorKind};
use kw_crypto::KeyBuffer;

use crate::interfaces::SecretSource;

/// Longest passphrase accepted, in bytes.
pub const MAX_PASSPHRASE_LEN: usize = 1024;

/// Largest key file accepted, in bytes.
pub const MAX_KEYFILE_LEN: usize = 1024 * 1024;

/// The secret behind one protector. Each variant matches one
/// [`ProtectorKind`]; handing the wrong variant to an operation fails with
/// `InvalidSource`.
pub enum ProtectorSecret {
    Passphrase(SecretString),
    Keyfile {
        path: PathBuf,
        contents: Zeroizing<Vec<u8>>,
    },
    /// The login session secret a session-key protector is wrapped under
    SessionKey(KeyBuffer),
}

impl ProtectorSecret {
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Self::Passphrase(SecretString::from(passphrase.into()))
    }

    pub fn keyfile(path: impl Into<PathBuf>, contents: Vec<u8>) -> Self {
        Self::Keyfile {
            path: path.into(),
            contents: Zeroizing::new(contents),
        }
    }

    /// Read a key file through `source`.
    pub fn read_keyfile(source: &impl SecretSource, path: &Path) -> KwResult<Self> {
        Ok(Self::Keyfile {
            path: path.to_path_buf(),
            contents: source.read_keyfile(path)?,
        })
    }

    pub fn kind(&self) -> ProtectorKind {
        match self {
            Self::Passphrase(_) => ProtectorKind::Passphrase,
            Self::Keyfile { .. } => ProtectorKind::Keyfile,
            Self::SessionKey(_) => ProtectorKind::SessionKey,
        }
    }

    /// Check the secret has the shape `kind` needs.
    pub fn validate_for(&self, kind: ProtectorKind) -> KwResult<()> {
        if self.kind() != kind {
            return Err(KwError::InvalidSource {
                kind,
                reason: format!("a {} secret was supplied", self.kind()),
            });
        }
        match self {
            Self::Passphrase(passphrase) => {
                let len = passphrase.expose_secret().len();
                if len == 0 {
                    return Err(KwError::InvalidSource {
                        kind,
                        reason: "passphrase is empty".into(),
                    });
                }
                if len > MAX_PASSPHRASE_LEN {
                    return Err(KwError::PassphraseTooLong {
                        max: MAX_PASSPHRASE_LEN,
                    });
                }
            }
            Self::Keyfile { path, contents } => {
                if contents.is_empty() {
                    return Err(KwError::KeyfileEmpty { path: path.clone() });
                }
                if contents.len() > MAX_KEYFILE_LEN {
                    return Err(KwError::KeyfileTooLarge {
                        path: path.clone(),
                        max: MAX_KEYFILE_LEN,
                    });
                }
            }
            Self::SessionKey(_) => {}
        }
        Ok(())
    }
}

impl fmt::Debug for ProtectorSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("ProtectorSecret::Passphrase([REDACTED])"),
            Self::Keyfile { path, .. } => {
                write!(f, "ProtectorSecret::Keyfile({}, [REDACTED])", path.display())
            }
            Self::SessionKey(_) => f.write_str("ProtectorSecret::SessionKey([REDACTED])"),
        }
    }
}

/// Prompt for a new passphrase twice and require both entries to match.
pub fn read_new_passphrase(source: &impl SecretSource, name: &str) -> KwResult<ProtectorSecret> {
    let first = source.prompt_passphrase(&format!("Enter passphrase for protector {name:?}: "))?;
    let second = source.prompt_passphrase("Confirm passphrase: ")?;
    if first.expose_secret() != second.expose_secret() {
        return Err(KwError::PassphraseMismatch);
    }
    let secret = ProtectorSecret::Passphrase(first);
    secret.validate_for(ProtectorKind::Passphrase)?;
    Ok(secret)
}
