//! Per-filesystem metadata store with lock → load → mutate → save.

use std::collections::BTreeMap;

use kw_core::{FilesystemId, KwError, KwResult, PolicyDescriptor, ProtectorDescriptor};

use crate::backend::PersistenceBackend;
use crate::consistency::ProtectorLookup;
use crate::record::{PolicyRecord, ProtectorRecord, StoreDocument};

/// The store for one filesystem.
#[derive(Clone)]
pub struct MetadataStore<B> {
    backend: B,
    filesystem: FilesystemId,
}

impl<B: PersistenceBackend> MetadataStore<B> {
    pub fn new(backend: B, filesystem: FilesystemId) -> Self {
        Self {
            backend,
            filesystem,
        }
    }

    pub fn filesystem(&self) -> &FilesystemId {
        &self.filesystem
    }

    /// Create an empty store. Fails if one already exists.
    pub fn setup(&self) -> KwResult<()> {
        self.backend.initialize(&self.filesystem)?;
        let guard = self.lock()?;
        if guard.read_raw()?.is_some() {
            return Err(KwError::AlreadySetup {
                filesystem: self.filesystem.clone(),
            });
        }
        guard.save(&StoreDocument::empty(self.filesystem.clone()))?;
        tracing::info!(filesystem = %self.filesystem, "metadata store created");
        Ok(())
    }

    /// Read the current document without taking the lock.
    ///
    /// Saves are atomic renames, so an unlocked read always sees a whole
    /// document; it may be stale by the time the caller acts on it.
    pub fn load(&self) -> KwResult<StoreDocument> {
        decode(&self.filesystem, self.backend.read_store_bytes(&self.filesystem)?)
    }

    /// Take the exclusive lock. Blocks or fails with `Busy` depending on the
    /// backend.
    pub fn lock(&self) -> KwResult<StoreGuard<'_, B>> {
        let lock = self.backend.acquire_exclusive_lock(&self.filesystem)?;
        Ok(StoreGuard {
            store: self,
            _lock: lock,
        })
    }

    /// Run `f` against the locked, freshly loaded document and save the
    /// result. Nothing is written if `f` fails.
    pub fn update<T>(&self, f: impl FnOnce(&mut StoreDocument) -> KwResult<T>) -> KwResult<T> {
        let guard = self.lock()?;
        let mut doc = guard.load()?;
        let out = f(&mut doc)?;
        guard.save(&doc)?;
        Ok(out)
    }

    pub fn protector(&self, descriptor: &ProtectorDescriptor) -> KwResult<ProtectorRecord> {
        self.load()?
            .protectors
            .remove(descriptor)
            .ok_or_else(|| KwError::ProtectorNotFound {
                descriptor: *descriptor,
                filesystem: self.filesystem.clone(),
            })
    }

    pub fn policy(&self, descriptor: &PolicyDescriptor) -> KwResult<PolicyRecord> {
        self.load()?
            .policies
            .remove(descriptor)
            .ok_or_else(|| KwError::PolicyNotFound {
                descriptor: *descriptor,
                filesystem: self.filesystem.clone(),
            })
    }
}

fn decode(filesystem: &FilesystemId, bytes: Option<Vec<u8>>) -> KwResult<StoreDocument> {
    match bytes {
        Some(bytes) => StoreDocument::from_bytes(filesystem, &bytes),
        None => Err(KwError::NotSetup {
            filesystem: filesystem.clone(),
        }),
    }
}

/// Exclusive access to one store; the lock is released on drop.
pub struct StoreGuard<'a, B: PersistenceBackend> {
    store: &'a MetadataStore<B>,
    _lock: B::Lock,
}

impl<B: PersistenceBackend> StoreGuard<'_, B> {
    pub fn filesystem(&self) -> &FilesystemId {
        &self.store.filesystem
    }

    pub fn load(&self) -> KwResult<StoreDocument> {
        decode(&self.store.filesystem, self.read_raw()?)
    }

    pub fn read_raw(&self) -> KwResult<Option<Vec<u8>>> {
        self.store.backend.read_store_bytes(&self.store.filesystem)
    }

    pub fn save(&self, doc: &StoreDocument) -> KwResult<()> {
        if doc.filesystem != self.store.filesystem {
            return Err(KwError::Corrupt {
                filesystem: self.store.filesystem.clone(),
                reason: format!("refusing to save document of filesystem {}", doc.filesystem),
            });
        }
        let bytes = doc.to_bytes()?;
        self.write_raw(&bytes)
    }

    /// Write previously read bytes back verbatim (used to roll back).
    pub fn write_raw(&self, bytes: &[u8]) -> KwResult<()> {
        self.store
            .backend
            .write_store_bytes_atomic(&self.store.filesystem, bytes)
    }
}

/// The stores a caller knows about, keyed by filesystem id.
///
/// Built by the caller from its configuration and passed into operations
/// that cross filesystems; there is no global registry.
#[derive(Clone)]
pub struct StoreSet<B> {
    stores: BTreeMap<FilesystemId, MetadataStore<B>>,
}

impl<B: PersistenceBackend + Clone> StoreSet<B> {
    pub fn new(backend: B, filesystems: impl IntoIterator<Item = FilesystemId>) -> Self {
        let stores = filesystems
            .into_iter()
            .map(|fs| (fs.clone(), MetadataStore::new(backend.clone(), fs)))
            .collect();
        Self { stores }
    }
}

impl<B: PersistenceBackend> StoreSet<B> {
    pub fn get(&self, filesystem: &FilesystemId) -> KwResult<&MetadataStore<B>> {
        self.stores.get(filesystem).ok_or_else(|| {
            KwError::Config(format!("filesystem {filesystem} is not configured"))
        })
    }

    pub fn filesystems(&self) -> impl Iterator<Item = &FilesystemId> {
        self.stores.keys()
    }

    pub fn stores(&self) -> impl Iterator<Item = &MetadataStore<B>> {
        self.stores.values()
    }

    /// Search every store that is set up for a protector. Stores that are
    /// not set up are skipped; corrupt stores fail the search.
    pub fn find_protector(
        &self,
        descriptor: &ProtectorDescriptor,
    ) -> KwResult<Option<(FilesystemId, ProtectorRecord)>> {
        for store in self.stores.values() {
            match store.load() {
                Ok(mut doc) => {
                    if let Some(record) = doc.protectors.remove(descriptor) {
                        return Ok(Some((store.filesystem.clone(), record)));
                    }
                }
                Err(KwError::NotSetup { filesystem }) => {
                    tracing::debug!(%filesystem, "skipping store that is not set up");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Find the filesystem whose store holds `descriptor`'s policy.
    pub fn find_policy(
        &self,
        descriptor: &PolicyDescriptor,
    ) -> KwResult<Option<(FilesystemId, PolicyRecord)>> {
        for store in self.stores.values() {
            match store.load() {
                Ok(mut doc) => {
                    if let Some(record) = doc.policies.remove(descriptor) {
                        return Ok(Some((store.filesystem.clone(), record)));
                    }
                }
                Err(KwError::NotSetup { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// A single store only knows its own protectors.
impl<B: PersistenceBackend> ProtectorLookup for MetadataStore<B> {
    fn lookup_protector(
        &self,
        filesystem: &FilesystemId,
        descriptor: &ProtectorDescriptor,
    ) -> KwResult<Option<ProtectorRecord>> {
        if *filesystem != self.filesystem {
            return Ok(None);
        }
        match self.load() {
            Ok(mut doc) => Ok(doc.protectors.remove(descriptor)),
            Err(KwError::NotSetup { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<B: PersistenceBackend> ProtectorLookup for StoreSet<B> {
    fn lookup_protector(
        &self,
        filesystem: &FilesystemId,
        descriptor: &ProtectorDescriptor,
    ) -> KwResult<Option<ProtectorRecord>> {
        let Some(store) = self.stores.get(filesystem) else {
            return Ok(None);
        };
        match store.load() {
            Ok(mut doc) => Ok(doc.protectors.remove(descriptor)),
            Err(KwError::NotSetup { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::record::{ProtectorSource, WrapEntry};
    use kw_crypto::{wrap, KeyBuffer};

    fn store() -> MetadataStore<MemoryBackend> {
        MetadataStore::new(MemoryBackend::new(), FilesystemId::new("home"))
    }

    fn keyfile_protector(byte: u8) -> ProtectorRecord {
        ProtectorRecord {
            descriptor: ProtectorDescriptor::from_bytes([byte; 8]),
            name: Some(format!("key-{byte}")),
            owner: None,
            source: ProtectorSource::Keyfile {
                fingerprint: [byte; 32],
            },
            created_at: 0,
        }
    }

    #[test]
    fn test_load_before_setup_is_not_setup() {
        assert!(matches!(store().load(), Err(KwError::NotSetup { .. })));
    }

    #[test]
    fn test_setup_twice_fails() {
        let store = store();
        store.setup().unwrap();
        assert!(store.load().unwrap().protectors.is_empty());
        assert!(matches!(store.setup(), Err(KwError::AlreadySetup { .. })));
    }

    #[test]
    fn test_update_persists() {
        let store = store();
        store.setup().unwrap();
        let record = keyfile_protector(1);
        store
            .update(|doc| {
                doc.protectors.insert(record.descriptor, record.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(store.protector(&record.descriptor).unwrap(), record);
    }

    #[test]
    fn test_failed_mutation_writes_nothing() {
        let store = store();
        store.setup().unwrap();
        let before = store.load().unwrap();
        let result: KwResult<()> = store.update(|doc| {
            doc.protectors.insert(ProtectorDescriptor::from_bytes([1; 8]), keyfile_protector(1));
            Err(KwError::MustBeRoot)
        });
        assert!(result.is_err());
        assert_eq!(store.load().unwrap(), before);
    }

    #[test]
    fn test_concurrent_writer_sees_busy() {
        let backend = MemoryBackend::new();
        let fs = FilesystemId::new("home");
        let process_a = MetadataStore::new(backend.clone(), fs.clone());
        let process_b = MetadataStore::new(backend, fs);
        process_a.setup().unwrap();

        let guard = process_a.lock().unwrap();
        let result = process_b.update(|doc| {
            doc.protectors.insert(ProtectorDescriptor::from_bytes([2; 8]), keyfile_protector(2));
            Ok(())
        });
        assert!(matches!(result, Err(KwError::Busy { .. })));

        let mut doc = guard.load().unwrap();
        doc.protectors.insert(ProtectorDescriptor::from_bytes([1; 8]), keyfile_protector(1));
        guard.save(&doc).unwrap();
        drop(guard);

        let doc = process_b.load().unwrap();
        assert_eq!(doc.protectors.len(), 1, "only the lock holder's change may land");
    }

    #[test]
    fn test_corrupt_store_is_not_overwritten_by_update() {
        let backend = MemoryBackend::new();
        let fs = FilesystemId::new("home");
        backend.put_raw(&fs, b"{ broken".to_vec());
        let store = MetadataStore::new(backend.clone(), fs.clone());

        let result = store.update(|_| Ok(()));
        assert!(matches!(result, Err(KwError::Corrupt { .. })));
        assert_eq!(backend.read_store_bytes(&fs).unwrap().unwrap(), b"{ broken");
    }

    #[test]
    fn test_single_store_lookup_stays_on_its_filesystem() {
        let store = store();
        let home = FilesystemId::new("home");
        let record = keyfile_protector(5);
        assert!(store.lookup_protector(&home, &record.descriptor).unwrap().is_none());

        store.setup().unwrap();
        store
            .update(|doc| {
                doc.protectors.insert(record.descriptor, record.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(
            store.lookup_protector(&home, &record.descriptor).unwrap(),
            Some(record.clone())
        );
        assert!(store
            .lookup_protector(&FilesystemId::new("usb"), &record.descriptor)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_store_set_finds_records_across_filesystems() {
        let backend = MemoryBackend::new();
        let set = StoreSet::new(
            backend,
            [FilesystemId::new("home"), FilesystemId::new("data"), FilesystemId::new("usb")],
        );
        set.get(&FilesystemId::new("home")).unwrap().setup().unwrap();
        set.get(&FilesystemId::new("data")).unwrap().setup().unwrap();

        let record = keyfile_protector(3);
        let policy_desc = PolicyDescriptor::from_bytes([4; 16]);
        set.get(&FilesystemId::new("data"))
            .unwrap()
            .update(|doc| {
                doc.protectors.insert(record.descriptor, record.clone());
                let mut policy = PolicyRecord::new(policy_desc);
                policy.entries.push(WrapEntry {
                    protector: record.descriptor,
                    wrapped_key: wrap(&KeyBuffer::random(), &KeyBuffer::random())?,
                });
                doc.policies.insert(policy_desc, policy);
                Ok(())
            })
            .unwrap();

        let (fs, found) = set.find_protector(&record.descriptor).unwrap().unwrap();
        assert_eq!(fs, FilesystemId::new("data"));
        assert_eq!(found, record);
        let (fs, _) = set.find_policy(&policy_desc).unwrap().unwrap();
        assert_eq!(fs, FilesystemId::new("data"));
        assert!(set
            .find_protector(&ProtectorDescriptor::from_bytes([9; 8]))
            .unwrap()
            .is_none());
    }
}
