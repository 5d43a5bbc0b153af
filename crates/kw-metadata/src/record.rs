//! Store document format
//!
//! A store is a single JSON document:
//! ```text
//! {
//!   "version": 1,
//!   "filesystem": "home",
//!   "protectors": { "<descriptor>": { "descriptor", "name", "owner", "source": { "kind", ... } } },
//!   "policies":   { "<descriptor>": { "descriptor", "entries": [ { "protector", "wrapped_key": { nonce, ciphertext, tag } } ] } },
//!   "links":      { "<protector descriptor>": "<home filesystem>" }
//! }
//! ```
//! The version is checked before anything else is parsed.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use kw_core::{FilesystemId, KwError, KwResult, PolicyDescriptor, ProtectorDescriptor, ProtectorKind};
use kw_crypto::{HashingCosts, WrappedKey, SALT_LEN};

/// Store document format version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Where a protector's key comes from, with the parameters needed to
/// reproduce or unwrap it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtectorSource {
    Passphrase {
        #[serde(with = "hex_array")]
        salt: [u8; SALT_LEN],
        costs: HashingCosts,
    },
    Keyfile {
        /// One-way fingerprint of the key file contents
        #[serde(with = "hex_array")]
        fingerprint: [u8; 32],
    },
    SessionKey {
        /// The protector key, wrapped under the login session secret
        wrapped_key: WrappedKey,
    },
}

impl ProtectorSource {
    pub fn kind(&self) -> ProtectorKind {
        match self {
            Self::Passphrase { .. } => ProtectorKind::Passphrase,
            Self::Keyfile { .. } => ProtectorKind::Keyfile,
            Self::SessionKey { .. } => ProtectorKind::SessionKey,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectorRecord {
    pub descriptor: ProtectorDescriptor,
    /// Human-readable name ("Recovery passphrase for /home/alice/vault")
    #[serde(default)]
    pub name: Option<String>,
    /// uid of the user that created the protector
    #[serde(default)]
    pub owner: Option<u32>,
    pub source: ProtectorSource,
    /// Unix timestamp of creation
    #[serde(default)]
    pub created_at: u64,
}

impl ProtectorRecord {
    pub fn kind(&self) -> ProtectorKind {
        self.source.kind()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed)")
    }
}

/// One independently unwrappable copy of a policy key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapEntry {
    pub protector: ProtectorDescriptor,
    pub wrapped_key: WrappedKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub descriptor: PolicyDescriptor,
    /// Wrap entries in insertion order; unlock attempts follow this order
    #[serde(default)]
    pub entries: Vec<WrapEntry>,
    #[serde(default)]
    pub created_at: u64,
}

impl PolicyRecord {
    pub fn new(descriptor: PolicyDescriptor) -> Self {
        Self {
            descriptor,
            entries: Vec::new(),
            created_at: now_epoch(),
        }
    }

    pub fn entry(&self, protector: &ProtectorDescriptor) -> Option<&WrapEntry> {
        self.entries.iter().find(|e| &e.protector == protector)
    }

    pub fn protectors(&self) -> impl Iterator<Item = &ProtectorDescriptor> {
        self.entries.iter().map(|e| &e.protector)
    }

    pub fn is_protected_by(&self, protector: &ProtectorDescriptor) -> bool {
        self.entry(protector).is_some()
    }
}

/// Everything one filesystem's store holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDocument {
    pub version: u32,
    pub filesystem: FilesystemId,
    #[serde(default)]
    pub protectors: BTreeMap<ProtectorDescriptor, ProtectorRecord>,
    #[serde(default)]
    pub policies: BTreeMap<PolicyDescriptor, PolicyRecord>,
    /// Protectors stored on other filesystems that local policies use
    #[serde(default)]
    pub links: BTreeMap<ProtectorDescriptor, FilesystemId>,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl StoreDocument {
    pub fn empty(filesystem: FilesystemId) -> Self {
        Self {
            version: FORMAT_VERSION,
            filesystem,
            protectors: BTreeMap::new(),
            policies: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }

    /// Policies on this filesystem whose wrap list names `protector`.
    pub fn policies_using(&self, protector: &ProtectorDescriptor) -> Vec<PolicyDescriptor> {
        self.policies
            .values()
            .filter(|p| p.is_protected_by(protector))
            .map(|p| p.descriptor)
            .collect()
    }

    /// Drop links that no local policy needs any more.
    pub fn prune_links(&mut self) {
        let policies = &self.policies;
        self.links
            .retain(|desc, _| policies.values().any(|p| p.is_protected_by(desc)));
    }

    pub fn to_bytes(&self) -> KwResult<Vec<u8>> {
        self.validate()?;
        serde_json::to_vec_pretty(self).map_err(|e| KwError::Corrupt {
            filesystem: self.filesystem.clone(),
            reason: format!("serialization failed: {e}"),
        })
    }

    /// Parse and structurally validate a stored document.
    pub fn from_bytes(filesystem: &FilesystemId, data: &[u8]) -> KwResult<Self> {
        let corrupt = |reason: String| KwError::Corrupt {
            filesystem: filesystem.clone(),
            reason,
        };

        let probe: VersionProbe = serde_json::from_slice(data)
            .map_err(|e| corrupt(format!("missing or unreadable version tag: {e}")))?;
        if probe.version != FORMAT_VERSION {
            return Err(KwError::UnsupportedVersion {
                filesystem: filesystem.clone(),
                found: probe.version,
                supported: FORMAT_VERSION,
            });
        }

        let doc: StoreDocument =
            serde_json::from_slice(data).map_err(|e| corrupt(format!("parse error: {e}")))?;
        if &doc.filesystem != filesystem {
            return Err(corrupt(format!(
                "document belongs to filesystem {}",
                doc.filesystem
            )));
        }
        doc.validate()?;
        Ok(doc)
    }

    fn validate(&self) -> KwResult<()> {
        let corrupt = |reason: String| KwError::Corrupt {
            filesystem: self.filesystem.clone(),
            reason,
        };

        for (key, record) in &self.protectors {
            if key != &record.descriptor {
                return Err(corrupt(format!(
                    "protector stored under {key} has descriptor {}",
                    record.descriptor
                )));
            }
        }
        for (key, record) in &self.policies {
            if key != &record.descriptor {
                return Err(corrupt(format!(
                    "policy stored under {key} has descriptor {}",
                    record.descriptor
                )));
            }
            for (i, entry) in record.entries.iter().enumerate() {
                if record.entries[..i].iter().any(|e| e.protector == entry.protector) {
                    return Err(corrupt(format!(
                        "policy {key} lists protector {} twice",
                        entry.protector
                    )));
                }
            }
        }
        for (desc, home) in &self.links {
            if home == &self.filesystem {
                return Err(corrupt(format!("protector {desc} is linked to its own filesystem")));
            }
        }
        Ok(())
    }
}

/// Seconds since the Unix epoch, for `created_at` fields.
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Serde helper: fixed-size byte arrays as lowercase hex strings.
mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut out = [0u8; N];
        hex::decode_to_slice(&s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}
