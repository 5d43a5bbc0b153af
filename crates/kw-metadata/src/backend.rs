//! Persistence backends: where store bytes live and how writers are serialized.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use kw_core::{FilesystemId, KwError, KwResult};

/// Raw storage for one store document per filesystem.
///
/// Implementations must make `write_store_bytes_atomic` all-or-nothing and
/// must make `acquire_exclusive_lock` exclusive across processes for the
/// same filesystem. The lock is released when the handle is dropped.
pub trait PersistenceBackend {
    type Lock;

    /// Create whatever container the store needs (directory, bucket, ...).
    fn initialize(&self, filesystem: &FilesystemId) -> KwResult<()>;

    /// Current store bytes, or `None` if the store was never written.
    fn read_store_bytes(&self, filesystem: &FilesystemId) -> KwResult<Option<Vec<u8>>>;

    fn write_store_bytes_atomic(&self, filesystem: &FilesystemId, bytes: &[u8]) -> KwResult<()>;

    fn acquire_exclusive_lock(&self, filesystem: &FilesystemId) -> KwResult<Self::Lock>;
}

#[derive(Default)]
struct MemoryState {
    initialized: HashSet<FilesystemId>,
    stores: HashMap<FilesystemId, Vec<u8>>,
    locked: HashSet<FilesystemId>,
    failing_writes: HashSet<FilesystemId>,
}

/// In-memory backend. Clones share state, so two clones behave like two
/// processes looking at the same disk. Lock contention is reported as
/// [`KwError::Busy`] rather than blocking.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent write to `filesystem` fail with an I/O error.
    pub fn fail_writes(&self, filesystem: &FilesystemId, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_writes.insert(filesystem.clone());
        } else {
            state.failing_writes.remove(filesystem);
        }
    }

    /// Overwrite the raw bytes of a store, bypassing validation.
    pub fn put_raw(&self, filesystem: &FilesystemId, bytes: Vec<u8>) {
        let mut state = self.state();
        state.initialized.insert(filesystem.clone());
        state.stores.insert(filesystem.clone(), bytes);
    }

    pub fn is_locked(&self, filesystem: &FilesystemId) -> bool {
        self.state().locked.contains(filesystem)
    }
}

impl PersistenceBackend for MemoryBackend {
    type Lock = MemoryLock;

    fn initialize(&self, filesystem: &FilesystemId) -> KwResult<()> {
        self.state().initialized.insert(filesystem.clone());
        Ok(())
    }

    fn read_store_bytes(&self, filesystem: &FilesystemId) -> KwResult<Option<Vec<u8>>> {
        Ok(self.state().stores.get(filesystem).cloned())
    }

    fn write_store_bytes_atomic(&self, filesystem: &FilesystemId, bytes: &[u8]) -> KwResult<()> {
        let mut state = self.state();
        if state.failing_writes.contains(filesystem) {
            return Err(KwError::Io(std::io::Error::other(format!(
                "simulated write failure on {filesystem}"
            ))));
        }
        state.stores.insert(filesystem.clone(), bytes.to_vec());
        Ok(())
    }

    fn acquire_exclusive_lock(&self, filesystem: &FilesystemId) -> KwResult<MemoryLock> {
        let mut state = self.state();
        if !state.initialized.contains(filesystem) {
            return Err(KwError::NotSetup {
                filesystem: filesystem.clone(),
            });
        }
        if !state.locked.insert(filesystem.clone()) {
            return Err(KwError::Busy {
                filesystem: filesystem.clone(),
            });
        }
        Ok(MemoryLock {
            state: Arc::clone(&self.state),
            filesystem: filesystem.clone(),
        })
    }
}

/// Held lock on an in-memory store; released on drop.
pub struct MemoryLock {
    state: Arc<Mutex<MemoryState>>,
    filesystem: FilesystemId,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.locked.remove(&self.filesystem);
    }
}
