//! kw-metadata: per-filesystem persistence of protector and policy records
//!
//! Each filesystem has one store document holding every protector created on
//! it, every policy for directories on it, and links to protectors that live
//! on other filesystems. Mutations run as lock → load → mutate → save under
//! an exclusive advisory lock; saves go through a temp file and an atomic
//! rename.

pub mod backend;
pub mod consistency;
pub mod fs;
pub mod record;
pub mod store;

pub use backend::{MemoryBackend, PersistenceBackend};
pub use consistency::{check_consistency, ConsistencyReport, ProtectorLookup};
pub use fs::FsBackend;
pub use record::{
    now_epoch, PolicyRecord, ProtectorRecord, ProtectorSource, StoreDocument, WrapEntry,
    FORMAT_VERSION,
};
pub use store::{MetadataStore, StoreGuard, StoreSet};
