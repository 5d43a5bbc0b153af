//! Protector lifecycle: create, unwrap, change secret, verify, destroy.

use kw_core::{
    FilesystemId, KwError, KwResult, PolicyDescriptor, ProtectorDescriptor, ProtectorKind,
};
use kw_crypto::{
    derive_file_key, derive_passphrase_key, derive_wrapping_key, keyfile_fingerprint,
    random_salt, unwrap, wrap, KeyBuffer, WrapContext,
};
use kw_metadata::{
    now_epoch, MetadataStore, PersistenceBackend, ProtectorRecord, ProtectorSource,
    StoreDocument, StoreSet,
};
use secrecy::SecretString;

use crate::context::Context;
use crate::secret::ProtectorSecret;

/// A protector together with the filesystem whose store holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectorRef {
    pub filesystem: FilesystemId,
    pub descriptor: ProtectorDescriptor,
}

impl ProtectorRef {
    pub fn new(filesystem: FilesystemId, descriptor: ProtectorDescriptor) -> Self {
        Self {
            filesystem,
            descriptor,
        }
    }
}

/// Create a protector on `store` and return its record together with the
/// freshly derived protector key, so the caller can immediately protect a
/// policy with it.
pub fn create_protector<B: PersistenceBackend>(
    ctx: &Context,
    store: &MetadataStore<B>,
    name: Option<&str>,
    secret: &ProtectorSecret,
) -> KwResult<(ProtectorRecord, KeyBuffer)> {
    let kind = secret.kind();
    secret.validate_for(kind)?;

    let name = name.map(str::trim).filter(|n| !n.is_empty());
    if name.is_none() && kind != ProtectorKind::SessionKey {
        return Err(KwError::MissingProtectorName { kind });
    }

    let (source, key) = derive_source(ctx, secret, None)?;
    let mut record = ProtectorRecord {
        descriptor: ProtectorDescriptor::random(),
        name: name.map(str::to_owned),
        owner: Some(ctx.user.uid),
        source,
        created_at: now_epoch(),
    };

    let record = store.update(|doc| {
        // Descriptors are random; re-roll on the off chance of a collision.
        while doc.protectors.contains_key(&record.descriptor)
            || doc.links.contains_key(&record.descriptor)
        {
            record.descriptor = ProtectorDescriptor::random();
        }
        doc.protectors.insert(record.descriptor, record.clone());
        Ok(record)
    })?;

    tracing::info!(
        protector = %record.descriptor,
        kind = %kind,
        filesystem = %store.filesystem(),
        "protector created"
    );
    Ok((record, key))
}

/// Build the source parameters and protector key for `secret`.
///
/// `existing_key` is only used for session-key protectors, whose protector
/// key is random and survives a change of session secret.
fn derive_source(
    ctx: &Context,
    secret: &ProtectorSecret,
    existing_key: Option<&KeyBuffer>,
) -> KwResult<(ProtectorSource, KeyBuffer)> {
    match secret {
        ProtectorSecret::Passphrase(passphrase) => {
            let salt = random_salt();
            let key = derive_passphrase_key(passphrase, &salt, &ctx.costs)?;
            Ok((
                ProtectorSource::Passphrase {
                    salt,
                    costs: ctx.costs,
                },
                key,
            ))
        }
        ProtectorSecret::Keyfile { contents, .. } => Ok((
            ProtectorSource::Keyfile {
                fingerprint: keyfile_fingerprint(contents),
            },
            derive_file_key(contents)?,
        )),
        ProtectorSecret::SessionKey(session) => {
            let key = match existing_key {
                Some(key) => key.duplicate(),
                None => KeyBuffer::random(),
            };
            let wrapping = derive_wrapping_key(session, WrapContext::ProtectorKey)?;
            let wrapped_key = wrap(&wrapping, &key)?;
            Ok((ProtectorSource::SessionKey { wrapped_key }, key))
        }
    }
}

/// Recover a protector's key from the secret behind it.
///
/// Key files are checked against the stored fingerprint and session keys
/// are authenticated, so both report `WrongKey` here. A wrong passphrase
/// still derives *a* key; it is only caught when that key fails to unwrap
/// a policy entry.
pub fn unwrap_protector_key(
    record: &ProtectorRecord,
    secret: &ProtectorSecret,
) -> KwResult<KeyBuffer> {
    match (&record.source, secret) {
        (ProtectorSource::Passphrase { salt, costs }, ProtectorSecret::Passphrase(passphrase)) => {
            derive_passphrase_key(passphrase, salt, costs)
        }
        (ProtectorSource::Keyfile { fingerprint }, ProtectorSecret::Keyfile { contents, .. }) => {
            if keyfile_fingerprint(contents) != *fingerprint {
                return Err(KwError::WrongKey {
                    descriptor: record.descriptor,
                });
            }
            derive_file_key(contents)
        }
        (ProtectorSource::SessionKey { wrapped_key }, ProtectorSecret::SessionKey(session)) => {
            let wrapping = derive_wrapping_key(session, WrapContext::ProtectorKey)?;
            unwrap(&wrapping, wrapped_key).map_err(|e| match e {
                KwError::AuthenticationFailed => KwError::WrongKey {
                    descriptor: record.descriptor,
                },
                other => other,
            })
        }
        (source, secret) => Err(KwError::InvalidSource {
            kind: source.kind(),
            reason: format!("a {} secret was supplied", secret.kind()),
        }),
    }
}

/// Unwrap the policy key stored in `doc` for (`policy`, `protector`).
fn unwrap_entry(
    doc: &StoreDocument,
    policy: &PolicyDescriptor,
    protector: &ProtectorDescriptor,
    protector_key: &KeyBuffer,
) -> KwResult<KeyBuffer> {
    let entry = doc
        .policies
        .get(policy)
        .and_then(|p| p.entry(protector))
        .ok_or_else(|| KwError::ProtectorNotOnPolicy {
            policy: *policy,
            protector: *protector,
        })?;
    let wrapping = derive_wrapping_key(protector_key, WrapContext::PolicyKey)?;
    unwrap(&wrapping, &entry.wrapped_key).map_err(|e| match e {
        KwError::AuthenticationFailed => KwError::WrongKey {
            descriptor: *protector,
        },
        other => other,
    })
}

/// Every policy, in any set-up store, that has a wrap entry for `protector`.
fn dependent_policies<B: PersistenceBackend>(
    stores: &StoreSet<B>,
    protector: &ProtectorDescriptor,
) -> KwResult<Vec<(FilesystemId, PolicyDescriptor)>> {
    let mut found = Vec::new();
    for store in stores.stores() {
        match store.load() {
            Ok(doc) => found.extend(
                doc.policies_using(protector)
                    .into_iter()
                    .map(|p| (store.filesystem().clone(), p)),
            ),
            Err(KwError::NotSetup { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(found)
}

/// Check a passphrase against a passphrase protector.
///
/// Returns `Ok(true)` once a policy entry unwraps with the derived key and
/// `Ok(false)` when no policy uses the protector, so there is nothing to
/// check against. A wrong passphrase fails with `WrongKey`.
pub fn verify_passphrase<B: PersistenceBackend>(
    stores: &StoreSet<B>,
    protector: &ProtectorRef,
    passphrase: &SecretString,
) -> KwResult<bool> {
    let record = stores.get(&protector.filesystem)?.protector(&protector.descriptor)?;
    if record.kind() != ProtectorKind::Passphrase {
        return Err(KwError::NotPassphrase {
            descriptor: record.descriptor,
        });
    }
    let key = unwrap_protector_key(&record, &ProtectorSecret::Passphrase(passphrase.clone()))?;

    let Some((fs, policy)) = dependent_policies(stores, &record.descriptor)?.into_iter().next()
    else {
        tracing::warn!(protector = %record.descriptor, "no policy uses this protector; passphrase cannot be verified");
        return Ok(false);
    };
    let doc = stores.get(&fs)?.load()?;
    unwrap_entry(&doc, &policy, &record.descriptor, &key)?;
    Ok(true)
}

/// A locked store's state at the start of a multi-store change.
struct Snapshot<'a, B: PersistenceBackend> {
    guard: kw_metadata::StoreGuard<'a, B>,
    original: Vec<u8>,
    doc: StoreDocument,
    dirty: bool,
}

/// Replace the secret behind a protector, keeping its descriptor.
///
/// Every store that is set up is locked (in filesystem order, so two
/// concurrent changes cannot deadlock), every policy entry wrapped under
/// the old protector key is re-wrapped under the new one, and all affected
/// stores are written. If any write fails, stores already written are put
/// back to their original bytes.
pub fn change_secret<B: PersistenceBackend>(
    ctx: &Context,
    stores: &StoreSet<B>,
    protector: &ProtectorRef,
    old_secret: &ProtectorSecret,
    new_secret: &ProtectorSecret,
) -> KwResult<ProtectorRecord> {
    let mut snapshots: Vec<Snapshot<'_, B>> = Vec::new();
    for store in stores.stores() {
        let guard = match store.lock() {
            Ok(guard) => guard,
            Err(KwError::NotSetup { .. }) => continue,
            Err(e) => return Err(e),
        };
        let Some(original) = guard.read_raw()? else {
            continue;
        };
        let doc = StoreDocument::from_bytes(store.filesystem(), &original)?;
        snapshots.push(Snapshot {
            guard,
            original,
            doc,
            dirty: false,
        });
    }

    let home = snapshots
        .iter()
        .position(|s| s.guard.filesystem() == &protector.filesystem)
        .ok_or_else(|| KwError::NotSetup {
            filesystem: protector.filesystem.clone(),
        })?;
    let record = snapshots[home]
        .doc
        .protectors
        .get(&protector.descriptor)
        .cloned()
        .ok_or_else(|| KwError::ProtectorNotFound {
            descriptor: protector.descriptor,
            filesystem: protector.filesystem.clone(),
        })?;
    new_secret.validate_for(record.kind())?;

    let old_key = unwrap_protector_key(&record, old_secret)?;

    // Unwrap every dependent policy key first; this is also what proves
    // the old passphrase was right.
    let mut policy_keys = Vec::new();
    for (i, snapshot) in snapshots.iter().enumerate() {
        for policy in snapshot.doc.policies_using(&record.descriptor) {
            let key = unwrap_entry(&snapshot.doc, &policy, &record.descriptor, &old_key)?;
            policy_keys.push((i, policy, key));
        }
    }

    let (source, new_key) = derive_source(ctx, new_secret, Some(&old_key))?;
    let updated = ProtectorRecord {
        source,
        ..record.clone()
    };

    if new_key.as_bytes() != old_key.as_bytes() {
        let wrapping = derive_wrapping_key(&new_key, WrapContext::PolicyKey)?;
        for (i, policy, key) in &policy_keys {
            let snapshot = &mut snapshots[*i];
            if let Some(entry) = snapshot
                .doc
                .policies
                .get_mut(policy)
                .and_then(|p| p.entries.iter_mut().find(|e| e.protector == record.descriptor))
            {
                entry.wrapped_key = wrap(&wrapping, key)?;
                snapshot.dirty = true;
            }
        }
    }
    snapshots[home]
        .doc
        .protectors
        .insert(updated.descriptor, updated.clone());
    snapshots[home].dirty = true;

    // Serialize everything before the first write so validation failures
    // cannot leave a partial change behind.
    let mut pending = Vec::new();
    for (i, snapshot) in snapshots.iter().enumerate() {
        if snapshot.dirty {
            pending.push((i, snapshot.doc.to_bytes()?));
        }
    }

    for (n, (i, bytes)) in pending.iter().enumerate() {
        if let Err(err) = snapshots[*i].guard.write_raw(bytes) {
            tracing::error!(
                filesystem = %snapshots[*i].guard.filesystem(),
                error = %err,
                "write failed during protector change; rolling back"
            );
            for (j, _) in &pending[..n] {
                let snapshot = &snapshots[*j];
                if let Err(rollback) = snapshot.guard.write_raw(&snapshot.original) {
                    tracing::error!(
                        filesystem = %snapshot.guard.filesystem(),
                        error = %rollback,
                        "rollback failed; store may reference the new protector secret"
                    );
                }
            }
            return Err(err);
        }
    }

    tracing::info!(
        protector = %updated.descriptor,
        rewrapped = policy_keys.len(),
        stores = pending.len(),
        "protector secret changed"
    );
    Ok(updated)
}

/// Delete a protector record.
///
/// Fails with `WouldOrphanPolicy` while any policy still has a wrap entry
/// for it, unless `ctx.force` is set; those policies are then left
/// referencing a protector that no longer exists and are returned.
pub fn destroy_protector<B: PersistenceBackend>(
    ctx: &Context,
    stores: &StoreSet<B>,
    protector: &ProtectorRef,
) -> KwResult<Vec<PolicyDescriptor>> {
    let home = stores.get(&protector.filesystem)?;
    let elsewhere: Vec<PolicyDescriptor> = dependent_policies(stores, &protector.descriptor)?
        .into_iter()
        .filter(|(fs, _)| fs != &protector.filesystem)
        .map(|(_, p)| p)
        .collect();

    let orphaned = home.update(|doc| {
        if !doc.protectors.contains_key(&protector.descriptor) {
            return Err(KwError::ProtectorNotFound {
                descriptor: protector.descriptor,
                filesystem: protector.filesystem.clone(),
            });
        }
        let mut orphaned = doc.policies_using(&protector.descriptor);
        orphaned.extend(elsewhere.iter().copied());
        if !orphaned.is_empty() && !ctx.force {
            return Err(KwError::WouldOrphanPolicy {
                protector: protector.descriptor,
                policies: orphaned,
            });
        }
        doc.protectors.remove(&protector.descriptor);
        Ok(orphaned)
    })?;

    if orphaned.is_empty() {
        tracing::info!(protector = %protector.descriptor, "protector destroyed");
    } else {
        tracing::warn!(
            protector = %protector.descriptor,
            policies = ?orphaned,
            "protector destroyed while still in use; policies are now mismatched"
        );
    }
    Ok(orphaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UserContext;
    use kw_crypto::HashingCosts;
    use kw_metadata::{MemoryBackend, PolicyRecord, WrapEntry};

    fn ctx() -> Context {
        Context::new(UserContext::new(1000), HashingCosts::insecure_for_tests())
    }

    fn stores() -> (MemoryBackend, StoreSet<MemoryBackend>) {
        let backend = MemoryBackend::new();
        let set = StoreSet::new(
            backend.clone(),
            [FilesystemId::new("data"), FilesystemId::new("home")],
        );
        for fs in ["data", "home"] {
            set.get(&FilesystemId::new(fs)).unwrap().setup().unwrap();
        }
        (backend, set)
    }

    fn home() -> FilesystemId {
        FilesystemId::new("home")
    }

    /// Store a policy on `fs` protected by `protector`, returning its key.
    fn protect(
        set: &StoreSet<MemoryBackend>,
        fs: &str,
        byte: u8,
        protector: &ProtectorDescriptor,
        protector_key: &KeyBuffer,
    ) -> (PolicyDescriptor, KeyBuffer) {
        let policy_key = KeyBuffer::random();
        let desc = PolicyDescriptor::from_bytes([byte; 16]);
        let wrapping = derive_wrapping_key(protector_key, WrapContext::PolicyKey).unwrap();
        let wrapped_key = wrap(&wrapping, &policy_key).unwrap();
        set.get(&FilesystemId::new(fs))
            .unwrap()
            .update(|doc| {
                let mut policy = PolicyRecord::new(desc);
                policy.entries.push(WrapEntry {
                    protector: *protector,
                    wrapped_key: wrapped_key.clone(),
                });
                doc.policies.insert(desc, policy);
                if fs != "home" {
                    doc.links.insert(*protector, home());
                }
                Ok(())
            })
            .unwrap();
        (desc, policy_key)
    }

    #[test]
    fn test_create_each_kind() {
        let (_, set) = stores();
        let store = set.get(&home()).unwrap();

        let (pass, _) = create_protector(
            &ctx(),
            store,
            Some("laptop"),
            &ProtectorSecret::passphrase("correct horse"),
        )
        .unwrap();
        assert_eq!(pass.kind(), ProtectorKind::Passphrase);
        assert_eq!(pass.owner, Some(1000));

        let (file, _) = create_protector(
            &ctx(),
            store,
            Some("usb key"),
            &ProtectorSecret::keyfile("/media/key", vec![7; 64]),
        )
        .unwrap();
        assert_eq!(file.kind(), ProtectorKind::Keyfile);

        let (session, _) = create_protector(
            &ctx(),
            store,
            None,
            &ProtectorSecret::SessionKey(KeyBuffer::random()),
        )
        .unwrap();
        assert_eq!(session.kind(), ProtectorKind::SessionKey);

        let doc = store.load().unwrap();
        assert_eq!(doc.protectors.len(), 3);
        assert_ne!(pass.descriptor, file.descriptor);
    }

    #[test]
    fn test_create_requires_name_and_valid_source() {
        let (_, set) = stores();
        let store = set.get(&home()).unwrap();
        assert!(matches!(
            create_protector(&ctx(), store, Some("  "), &ProtectorSecret::passphrase("pw")),
            Err(KwError::MissingProtectorName { .. })
        ));
        assert!(matches!(
            create_protector(&ctx(), store, Some("empty"), &ProtectorSecret::passphrase("")),
            Err(KwError::InvalidSource { .. })
        ));
        assert!(store.load().unwrap().protectors.is_empty());
    }

    #[test]
    fn test_unwrap_rederives_same_key() {
        let (_, set) = stores();
        let store = set.get(&home()).unwrap();
        let secret = ProtectorSecret::passphrase("correct horse");
        let (record, key) = create_protector(&ctx(), store, Some("p"), &secret).unwrap();
        assert_eq!(
            unwrap_protector_key(&record, &secret).unwrap().as_bytes(),
            key.as_bytes()
        );

        let session = KeyBuffer::random();
        let (record, key) = create_protector(
            &ctx(),
            store,
            None,
            &ProtectorSecret::SessionKey(session.duplicate()),
        )
        .unwrap();
        let again = unwrap_protector_key(&record, &ProtectorSecret::SessionKey(session)).unwrap();
        assert_eq!(again.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_unwrap_detects_wrong_keyfile_and_session() {
        let (_, set) = stores();
        let store = set.get(&home()).unwrap();
        let (file, _) = create_protector(
            &ctx(),
            store,
            Some("k"),
            &ProtectorSecret::keyfile("/k", vec![1; 32]),
        )
        .unwrap();
        assert!(matches!(
            unwrap_protector_key(&file, &ProtectorSecret::keyfile("/k", vec![2; 32])),
            Err(KwError::WrongKey { .. })
        ));

        let (session, _) = create_protector(
            &ctx(),
            store,
            None,
            &ProtectorSecret::SessionKey(KeyBuffer::random()),
        )
        .unwrap();
        assert!(matches!(
            unwrap_protector_key(&session, &ProtectorSecret::SessionKey(KeyBuffer::random())),
            Err(KwError::WrongKey { .. })
        ));
        assert!(matches!(
            unwrap_protector_key(&session, &ProtectorSecret::passphrase("pw")),
            Err(KwError::InvalidSource { .. })
        ));
    }

    #[test]
    fn test_verify_passphrase() {
        let (_, set) = stores();
        let (record, key) = create_protector(
            &ctx(),
            set.get(&home()).unwrap(),
            Some("p"),
            &ProtectorSecret::passphrase("correct horse"),
        )
        .unwrap();
        let target = ProtectorRef::new(home(), record.descriptor);

        // Nothing to check against yet.
        assert!(!verify_passphrase(&set, &target, &SecretString::from("anything")).unwrap());

        protect(&set, "home", 1, &record.descriptor, &key);
        assert!(verify_passphrase(&set, &target, &SecretString::from("correct horse")).unwrap());
        assert!(matches!(
            verify_passphrase(&set, &target, &SecretString::from("wrong password")),
            Err(KwError::WrongKey { .. })
        ));
    }

    #[test]
    fn test_change_secret_rewraps_across_stores() {
        let (_, set) = stores();
        let (record, key) = create_protector(
            &ctx(),
            set.get(&home()).unwrap(),
            Some("p"),
            &ProtectorSecret::passphrase("old"),
        )
        .unwrap();
        let (local, local_key) = protect(&set, "home", 1, &record.descriptor, &key);
        let (linked, linked_key) = protect(&set, "data", 2, &record.descriptor, &key);
        let target = ProtectorRef::new(home(), record.descriptor);

        let updated = change_secret(
            &ctx(),
            &set,
            &target,
            &ProtectorSecret::passphrase("old"),
            &ProtectorSecret::passphrase("new"),
        )
        .unwrap();
        assert_eq!(updated.descriptor, record.descriptor);
        assert_ne!(updated.source, record.source);

        let new_key =
            unwrap_protector_key(&updated, &ProtectorSecret::passphrase("new")).unwrap();
        for (fs, policy, expected) in [("home", local, local_key), ("data", linked, linked_key)] {
            let doc = set.get(&FilesystemId::new(fs)).unwrap().load().unwrap();
            let got = unwrap_entry(&doc, &policy, &record.descriptor, &new_key).unwrap();
            assert_eq!(got.as_bytes(), expected.as_bytes());
        }
    }

    #[test]
    fn test_change_secret_with_wrong_old_secret_changes_nothing() {
        let (backend, set) = stores();
        let (record, key) = create_protector(
            &ctx(),
            set.get(&home()).unwrap(),
            Some("p"),
            &ProtectorSecret::passphrase("old"),
        )
        .unwrap();
        protect(&set, "home", 1, &record.descriptor, &key);
        let before = backend.read_store_bytes(&home()).unwrap();

        let result = change_secret(
            &ctx(),
            &set,
            &ProtectorRef::new(home(), record.descriptor),
            &ProtectorSecret::passphrase("guess"),
            &ProtectorSecret::passphrase("new"),
        );
        assert!(matches!(result, Err(KwError::WrongKey { .. })));
        assert_eq!(backend.read_store_bytes(&home()).unwrap(), before);
    }

    #[test]
    fn test_change_secret_rolls_back_on_partial_write() {
        let (backend, set) = stores();
        let (record, key) = create_protector(
            &ctx(),
            set.get(&home()).unwrap(),
            Some("p"),
            &ProtectorSecret::passphrase("old"),
        )
        .unwrap();
        protect(&set, "data", 2, &record.descriptor, &key);
        let data_before = backend.read_store_bytes(&FilesystemId::new("data")).unwrap();
        let home_before = backend.read_store_bytes(&home()).unwrap();

        // "data" sorts first and is written first; "home" then fails.
        backend.fail_writes(&home(), true);
        let result = change_secret(
            &ctx(),
            &set,
            &ProtectorRef::new(home(), record.descriptor),
            &ProtectorSecret::passphrase("old"),
            &ProtectorSecret::passphrase("new"),
        );
        assert!(matches!(result, Err(KwError::Io(_))));
        backend.fail_writes(&home(), false);

        assert_eq!(
            backend.read_store_bytes(&FilesystemId::new("data")).unwrap(),
            data_before
        );
        assert_eq!(backend.read_store_bytes(&home()).unwrap(), home_before);
        let old = unwrap_protector_key(
            &set.get(&home()).unwrap().protector(&record.descriptor).unwrap(),
            &ProtectorSecret::passphrase("old"),
        );
        assert!(old.is_ok());
    }

    #[test]
    fn test_change_session_secret_keeps_protector_key() {
        let (_, set) = stores();
        let old_session = KeyBuffer::random();
        let (record, key) = create_protector(
            &ctx(),
            set.get(&home()).unwrap(),
            None,
            &ProtectorSecret::SessionKey(old_session.duplicate()),
        )
        .unwrap();
        let (policy, policy_key) = protect(&set, "home", 1, &record.descriptor, &key);
        let before = set.get(&home()).unwrap().policy(&policy).unwrap();

        let new_session = KeyBuffer::random();
        let updated = change_secret(
            &ctx(),
            &set,
            &ProtectorRef::new(home(), record.descriptor),
            &ProtectorSecret::SessionKey(old_session),
            &ProtectorSecret::SessionKey(new_session.duplicate()),
        )
        .unwrap();

        let again = unwrap_protector_key(&updated, &ProtectorSecret::SessionKey(new_session)).unwrap();
        assert_eq!(again.as_bytes(), key.as_bytes());
        assert_eq!(set.get(&home()).unwrap().policy(&policy).unwrap(), before);
        let doc = set.get(&home()).unwrap().load().unwrap();
        let got = unwrap_entry(&doc, &policy, &record.descriptor, &again).unwrap();
        assert_eq!(got.as_bytes(), policy_key.as_bytes());
    }

    #[test]
    fn test_destroy_refuses_to_orphan_without_force() {
        let (_, set) = stores();
        let (record, key) = create_protector(
            &ctx(),
            set.get(&home()).unwrap(),
            Some("p"),
            &ProtectorSecret::passphrase("pw"),
        )
        .unwrap();
        let (linked, _) = protect(&set, "data", 2, &record.descriptor, &key);
        let target = ProtectorRef::new(home(), record.descriptor);

        match destroy_protector(&ctx(), &set, &target) {
            Err(KwError::WouldOrphanPolicy { policies, .. }) => assert_eq!(policies, vec![linked]),
            other => panic!("expected WouldOrphanPolicy, got {other:?}"),
        }
        assert!(set.get(&home()).unwrap().protector(&record.descriptor).is_ok());

        let orphaned = destroy_protector(&ctx().with_force(true), &set, &target).unwrap();
        assert_eq!(orphaned, vec![linked]);
        assert!(matches!(
            set.get(&home()).unwrap().protector(&record.descriptor),
            Err(KwError::ProtectorNotFound { .. })
        ));
    }

    #[test]
    fn test_destroy_unused_and_missing() {
        let (_, set) = stores();
        let (record, _) = create_protector(
            &ctx(),
            set.get(&home()).unwrap(),
            Some("p"),
            &ProtectorSecret::keyfile("/k", vec![3; 16]),
        )
        .unwrap();
        let target = ProtectorRef::new(home(), record.descriptor);
        assert!(destroy_protector(&ctx(), &set, &target).unwrap().is_empty());
        assert!(matches!(
            destroy_protector(&ctx(), &set, &target),
            Err(KwError::ProtectorNotFound { .. })
        ));
    }
}
