//! Recovery passphrases for policies.

use std::path::Path;

use secrecy::SecretString;

use kw_core::{KwResult, PolicyDescriptor};
use kw_crypto::{generate_recovery_passphrase, KeyBuffer};
use kw_metadata::{MetadataStore, PersistenceBackend, ProtectorRecord};

use crate::context::Context;
use crate::policy::add_protector;
use crate::protector::{create_protector, ProtectorRef};
use crate::secret::ProtectorSecret;

/// Generate a recovery passphrase, store it as a new passphrase protector
/// on the policy's filesystem and add it to the policy.
///
/// The passphrase is returned once for the user to write down; it is not
/// kept anywhere.
pub fn add_recovery_passphrase<B: PersistenceBackend>(
    ctx: &Context,
    store: &MetadataStore<B>,
    policy: &PolicyDescriptor,
    policy_key: &KeyBuffer,
    dir: &Path,
) -> KwResult<(SecretString, ProtectorRecord)> {
    let passphrase = generate_recovery_passphrase()?;
    let name = format!("Recovery passphrase for {}", dir.display());
    let (record, protector_key) = create_protector(
        ctx,
        store,
        Some(&name),
        &ProtectorSecret::Passphrase(passphrase.clone()),
    )?;

    let target = ProtectorRef::new(store.filesystem().clone(), record.descriptor);
    if let Err(err) = add_protector(store, store, policy, &target, &protector_key, policy_key) {
        let cleanup = store.update(|doc| {
            doc.protectors.remove(&record.descriptor);
            Ok(())
        });
        if let Err(cleanup) = cleanup {
            tracing::warn!(protector = %record.descriptor, error = %cleanup, "could not remove unused recovery protector");
        }
        return Err(err);
    }

    tracing::info!(%policy, protector = %record.descriptor, "recovery passphrase added");
    Ok((passphrase, record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::context::UserContext;
    use crate::policy::unwrap_policy_key;
    use crate::protector::unwrap_protector_key;
    use kw_core::{FilesystemId, KwError};
    use kw_crypto::{is_recovery_passphrase, HashingCosts};
    use kw_metadata::{MemoryBackend, PolicyRecord};
    use secrecy::ExposeSecret;

    fn setup() -> (Context, MetadataStore<MemoryBackend>, PolicyDescriptor) {
        let store = MetadataStore::new(MemoryBackend::new(), FilesystemId::new("home"));
        store.setup().unwrap();
        let policy = PolicyDescriptor::from_bytes([3; 16]);
        store
            .update(|doc| {
                doc.policies.insert(policy, PolicyRecord::new(policy));
                Ok(())
            })
            .unwrap();
        let ctx = Context::new(UserContext::new(1000), HashingCosts::insecure_for_tests());
        (ctx, store, policy)
    }

    #[test]
    fn test_recovery_passphrase_unlocks_policy() {
        let (ctx, store, policy) = setup();
        let policy_key = KeyBuffer::random();
        let (words, record) =
            add_recovery_passphrase(&ctx, &store, &policy, &policy_key, Path::new("/home/alice/vault"))
                .unwrap();

        assert!(is_recovery_passphrase(words.expose_secret()));
        assert_eq!(
            record.name.as_deref(),
            Some("Recovery passphrase for /home/alice/vault")
        );

        let key = unwrap_protector_key(&record, &ProtectorSecret::Passphrase(words)).unwrap();
        let stored = store.policy(&policy).unwrap();
        let got = unwrap_policy_key(&stored, &BTreeMap::from([(record.descriptor, key)])).unwrap();
        assert_eq!(got.as_bytes(), policy_key.as_bytes());
    }

    #[test]
    fn test_failed_add_leaves_no_protector_behind() {
        let (ctx, store, _) = setup();
        let missing = PolicyDescriptor::from_bytes([4; 16]);
        let result = add_recovery_passphrase(&ctx, &store, &missing, &KeyBuffer::random(), Path::new("/x"));
        assert!(matches!(result, Err(KwError::PolicyNotFound { .. })));
        assert!(store.load().unwrap().protectors.is_empty());
    }
}
