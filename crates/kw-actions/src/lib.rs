//! kw-actions: the operations users actually run
//!
//! Everything here is synchronous and takes its collaborators explicitly:
//! a [`Context`] for who is acting and how, a [`StoreSet`] for metadata, and
//! the OS-facing traits in [`interfaces`] for keyring, secrets and directory
//! policies. Nothing holds global state.
//!
//! [`StoreSet`]: kw_metadata::StoreSet

pub mod context;
pub mod interfaces;
pub mod mock;
pub mod orchestrator;
pub mod policy;
pub mod protector;
pub mod recovery;
pub mod secret;
pub mod setup;

pub use context::{Context, UserContext};
pub use interfaces::{DirectoryInfo, Keyring, PolicyApi, SecretSource};
pub use orchestrator::{
    Orchestrator, PolicyStatus, ProtectorSummary, UnlockOutcome, UnlockRequest,
};
pub use policy::{
    add_protector, create_policy, destroy_policy, remove_protector, unwrap_policy_key,
};
pub use protector::{
    change_secret, create_protector, destroy_protector, unwrap_protector_key, verify_passphrase,
    ProtectorRef,
};
pub use recovery::add_recovery_passphrase;
pub use secret::{read_new_passphrase, ProtectorSecret, MAX_KEYFILE_LEN, MAX_PASSPHRASE_LEN};
pub use setup::{calibrate, setup_filesystem};
