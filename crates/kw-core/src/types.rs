use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a protector descriptor in bytes (16 hex characters).
pub const PROTECTOR_DESCRIPTOR_LEN: usize = 8;

/// Length of a policy descriptor in bytes (32 hex characters).
pub const POLICY_DESCRIPTOR_LEN: usize = 16;

macro_rules! descriptor {
    ($(#[$meta:meta])* $name:ident, $len:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s.trim(), &mut bytes).map_err(|e| {
                    format!(
                        "invalid {} {s:?}: expected {} hex characters ({e})",
                        $label,
                        $len * 2
                    )
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

descriptor!(
    /// Identifier of a protector, unique within one filesystem's store.
    ///
    /// Sampled at random on creation so it reveals nothing about the
    /// protector's kind or secret.
    ProtectorDescriptor,
    PROTECTOR_DESCRIPTOR_LEN,
    "protector descriptor"
);

descriptor!(
    /// Identifier of a directory's encryption context, assigned by the
    /// OS encryption subsystem. Opaque to keywarden.
    PolicyDescriptor,
    POLICY_DESCRIPTOR_LEN,
    "policy descriptor"
);

impl ProtectorDescriptor {
    /// Sample a fresh random descriptor.
    pub fn random() -> Self {
        let mut bytes = [0u8; PROTECTOR_DESCRIPTOR_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// Name of one filesystem's metadata store (e.g. "home", "data").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilesystemId(String);

impl FilesystemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FilesystemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of secret a protector is built from. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectorKind {
    /// Key re-derived from a typed passphrase with Argon2id.
    Passphrase,
    /// Key derived from the raw bytes of a key file.
    Keyfile,
    /// Key stored wrapped under the login session secret.
    SessionKey,
}

impl fmt::Display for ProtectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Passphrase => "passphrase",
            Self::Keyfile => "keyfile",
            Self::SessionKey => "session-key",
        };
        f.write_str(s)
    }
}

impl FromStr for ProtectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passphrase" | "custom_passphrase" => Ok(Self::Passphrase),
            "keyfile" | "raw_key" => Ok(Self::Keyfile),
            "session-key" | "session_key" | "login" => Ok(Self::SessionKey),
            other => Err(format!(
                "unknown protector kind {other:?} (expected passphrase, keyfile, or session-key)"
            )),
        }
    }
}

/// Whether a policy key is present in the OS active-key registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    Locked,
    Unlocked,
    /// Not yet queried, or the OS subsystem could not say.
    Unknown,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
