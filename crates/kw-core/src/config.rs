use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::durable;
use crate::error::{KwError, KwResult};
use crate::types::FilesystemId;

/// Top-level configuration (loaded from keywarden.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KwConfig {
    pub kdf: KdfConfig,
    pub store: StoreConfig,
    pub keyring: KeyringConfig,
    pub logging: LoggingConfig,
    /// Filesystems whose metadata stores keywarden knows about
    pub filesystems: Vec<FilesystemConfig>,
}

/// Argon2id costs recorded on new passphrase protectors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
    /// Target duration of one derivation when calibrating, in milliseconds
    pub target_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the metadata directory created at each filesystem root
    pub dir_name: String,
    /// Whether a writer waits for the store lock or fails with "busy"
    pub lock_mode: LockMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Blocking,
    Nonblocking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyringConfig {
    /// Platform keychain service name
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: warn)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemConfig {
    pub id: FilesystemId,
    /// Root directory of the filesystem; the metadata store lives beneath it
    pub root: PathBuf,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
            target_ms: 1000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir_name: ".keywarden".into(),
            lock_mode: LockMode::Blocking,
        }
    }
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            service: "keywarden".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            format: "text".into(),
        }
    }
}

impl KwConfig {
    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> KwResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| KwError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Write the config file crash-safely (see [`crate::durable`]).
    pub fn save(&self, path: &Path) -> KwResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| KwError::Config(format!("serializing config: {e}")))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("toml.tmp");
        durable::replace(path, &tmp_path, content.as_bytes(), 0o644)?;
        tracing::info!(path = %path.display(), "config written");
        Ok(())
    }

    /// Look up a configured filesystem by id.
    pub fn filesystem(&self, id: &FilesystemId) -> Option<&FilesystemConfig> {
        self.filesystems.iter().find(|fs| &fs.id == id)
    }

    /// Find the filesystem whose root is the longest prefix of `path`.
    pub fn filesystem_for_path(&self, path: &Path) -> Option<&FilesystemConfig> {
        self.filesystems
            .iter()
            .filter(|fs| path.starts_with(&fs.root))
            .max_by_key(|fs| fs.root.components().count())
    }
}
