use std::path::PathBuf;

use thiserror::Error;

use crate::types::{FilesystemId, PolicyDescriptor, ProtectorDescriptor, ProtectorKind};

pub type KwResult<T> = Result<T, KwError>;

/// Broad category of a [`KwError`], for callers that branch on the taxonomy
/// rather than on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing input from the caller. Never retried.
    UserInput,
    /// Authentication failure or wrong key material.
    Crypto,
    /// Metadata does not line up (missing records, orphaning, mismatch).
    Consistency,
    /// Lock contention, unreadable or corrupt stores, I/O.
    Resource,
    /// Privilege or ownership preconditions not met.
    Precondition,
    /// A collaborator outside the core (keyring, policy API) failed.
    External,
    Config,
}

#[derive(Debug, Error)]
pub enum KwError {
    // ── user input ───────────────────────────────────────────────────────────
    #[error("invalid source for {kind} protector: {reason}")]
    InvalidSource { kind: ProtectorKind, reason: String },

    #[error("entered passphrases do not match")]
    PassphraseMismatch,

    #[error("passphrase exceeds maximum length of {max} bytes")]
    PassphraseTooLong { max: usize },

    #[error("multiple protectors available for policy {policy}")]
    SpecifyProtector {
        policy: PolicyDescriptor,
        candidates: Vec<ProtectorDescriptor>,
    },

    #[error("no key file specified")]
    SpecifyKeyfile,

    #[error("key file {} is empty", path.display())]
    KeyfileEmpty { path: PathBuf },

    #[error("key file {} exceeds maximum size of {max} bytes", path.display())]
    KeyfileTooLarge { path: PathBuf, max: usize },

    #[error("protector {descriptor} does not use a passphrase")]
    NotPassphrase { descriptor: ProtectorDescriptor },

    #[error("{kind} protectors require a name")]
    MissingProtectorName { kind: ProtectorKind },

    #[error("{operation} would be destructive")]
    Destructive { operation: String },

    // ── cryptographic ────────────────────────────────────────────────────────
    #[error("authentication failed: wrapped key was tampered with or the wrong key was used")]
    AuthenticationFailed,

    #[error("incorrect key provided for protector {descriptor}")]
    WrongKey { descriptor: ProtectorDescriptor },

    #[error("could not load any protectors for policy {policy}")]
    AllLoadsFailed { policy: PolicyDescriptor },

    // ── consistency ──────────────────────────────────────────────────────────
    #[error("filesystem {filesystem} is not set up for keywarden")]
    NotSetup { filesystem: FilesystemId },

    #[error("filesystem {filesystem} is already set up for keywarden")]
    AlreadySetup { filesystem: FilesystemId },

    #[error("protector {descriptor} not found on filesystem {filesystem}")]
    ProtectorNotFound {
        descriptor: ProtectorDescriptor,
        filesystem: FilesystemId,
    },

    #[error("policy {descriptor} not found on filesystem {filesystem}")]
    PolicyNotFound {
        descriptor: PolicyDescriptor,
        filesystem: FilesystemId,
    },

    #[error("directory {} is encrypted with policy {descriptor} but has no metadata", dir.display())]
    MissingPolicyMetadata {
        dir: PathBuf,
        descriptor: PolicyDescriptor,
    },

    #[error("policy {policy} references protectors that cannot be found: {missing:?}")]
    PolicyMetadataMismatch {
        policy: PolicyDescriptor,
        missing: Vec<ProtectorDescriptor>,
    },

    #[error("destroying protector {protector} would orphan policies {policies:?}")]
    WouldOrphanPolicy {
        protector: ProtectorDescriptor,
        policies: Vec<PolicyDescriptor>,
    },

    #[error("protector {protector} is the last one protecting policy {policy}")]
    LastProtector {
        policy: PolicyDescriptor,
        protector: ProtectorDescriptor,
    },

    #[error("policy {policy} is already protected by protector {protector}")]
    DuplicateProtector {
        policy: PolicyDescriptor,
        protector: ProtectorDescriptor,
    },

    #[error("policy {policy} is not protected by protector {protector}")]
    ProtectorNotOnPolicy {
        policy: PolicyDescriptor,
        protector: ProtectorDescriptor,
    },

    #[error("directory {} is already encrypted with policy {descriptor}", dir.display())]
    PolicyAlreadyConfigured {
        dir: PathBuf,
        descriptor: PolicyDescriptor,
    },

    #[error("policy {policy} is already unlocked")]
    PolicyUnlocked { policy: PolicyDescriptor },

    // ── concurrency / resources ──────────────────────────────────────────────
    #[error("metadata store for {filesystem} is locked by another process")]
    Busy { filesystem: FilesystemId },

    #[error("metadata store for {filesystem} is corrupt: {reason}")]
    Corrupt {
        filesystem: FilesystemId,
        reason: String,
    },

    #[error("metadata store for {filesystem} has unsupported format version {found} (supported: {supported})")]
    UnsupportedVersion {
        filesystem: FilesystemId,
        found: u32,
        supported: u32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── preconditions ────────────────────────────────────────────────────────
    #[error("this operation must be run as root")]
    MustBeRoot,

    #[error("directory {} is owned by uid {owner}, not uid {uid}", dir.display())]
    BadOwner { dir: PathBuf, owner: u32, uid: u32 },

    #[error("directory {} is not empty", dir.display())]
    NotEmptyDir { dir: PathBuf },

    // ── external collaborators ───────────────────────────────────────────────
    #[error("key for policy {policy} is still in use")]
    StillInUse { policy: PolicyDescriptor },

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("encryption policy error: {0}")]
    PolicyApi(String),

    #[error("secret source error: {0}")]
    SecretSource(String),

    #[error("crypto backend error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),
}

impl KwError {
    pub fn kind(&self) -> ErrorKind {
        use KwError::*;
        match self {
            InvalidSource { .. }
            | PassphraseMismatch
            | PassphraseTooLong { .. }
            | SpecifyProtector { .. }
            | SpecifyKeyfile
            | KeyfileEmpty { .. }
            | KeyfileTooLarge { .. }
            | NotPassphrase { .. }
            | MissingProtectorName { .. }
            | Destructive { .. } => ErrorKind::UserInput,
            AuthenticationFailed | WrongKey { .. } | AllLoadsFailed { .. } | Crypto(_) => {
                ErrorKind::Crypto
            }
            NotSetup { .. }
            | AlreadySetup { .. }
            | ProtectorNotFound { .. }
            | PolicyNotFound { .. }
            | MissingPolicyMetadata { .. }
            | PolicyMetadataMismatch { .. }
            | WouldOrphanPolicy { .. }
            | LastProtector { .. }
            | DuplicateProtector { .. }
            | ProtectorNotOnPolicy { .. }
            | PolicyAlreadyConfigured { .. }
            | PolicyUnlocked { .. } => ErrorKind::Consistency,
            Busy { .. } | Corrupt { .. } | UnsupportedVersion { .. } | Io(_) => {
                ErrorKind::Resource
            }
            MustBeRoot | BadOwner { .. } | NotEmptyDir { .. } => ErrorKind::Precondition,
            StillInUse { .. } | Keyring(_) | PolicyApi(_) | SecretSource(_) => {
                ErrorKind::External
            }
            Config(_) => ErrorKind::Config,
        }
    }
}
