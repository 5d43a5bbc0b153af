//! Policy lifecycle and the policy-key unwrap loop.

use std::collections::BTreeMap;
use std::path::Path;

use kw_core::{KeyState, KwError, KwResult, PolicyDescriptor, ProtectorDescriptor};
use kw_crypto::{derive_wrapping_key, unwrap, wrap, KeyBuffer, WrapContext};
use kw_metadata::{MetadataStore, PersistenceBackend, PolicyRecord, ProtectorLookup, WrapEntry};

use crate::context::Context;
use crate::interfaces::{Keyring, PolicyApi};
use crate::protector::ProtectorRef;

/// Generate a policy key, record an (empty) policy for it in `store`, and
/// apply the policy to `dir`.
///
/// The metadata is written before the directory is touched; if applying the
/// policy fails the record is removed again. The returned key is the only
/// copy: add a protector with it before dropping it.
pub fn create_policy<B: PersistenceBackend>(
    ctx: &Context,
    store: &MetadataStore<B>,
    api: &impl PolicyApi,
    dir: &Path,
) -> KwResult<(PolicyRecord, KeyBuffer)> {
    if let Some(descriptor) = api.directory_policy(dir)? {
        return Err(KwError::PolicyAlreadyConfigured {
            dir: dir.to_path_buf(),
            descriptor,
        });
    }
    let info = api.directory_info(dir)?;
    if info.owner != ctx.user.uid && !ctx.user.privileged {
        return Err(KwError::BadOwner {
            dir: dir.to_path_buf(),
            owner: info.owner,
            uid: ctx.user.uid,
        });
    }
    if !info.is_empty && !ctx.force {
        return Err(KwError::NotEmptyDir {
            dir: dir.to_path_buf(),
        });
    }

    let policy_key = KeyBuffer::random();
    let descriptor = api.key_descriptor(&policy_key)?;
    let record = store.update(|doc| {
        if doc.policies.contains_key(&descriptor) {
            return Err(KwError::PolicyAlreadyConfigured {
                dir: dir.to_path_buf(),
                descriptor,
            });
        }
        let record = PolicyRecord::new(descriptor);
        doc.policies.insert(descriptor, record.clone());
        Ok(record)
    })?;

    if let Err(err) = api.set_directory_policy(dir, &descriptor) {
        tracing::warn!(policy = %descriptor, dir = %dir.display(), error = %err, "applying policy failed; removing its metadata");
        let cleanup = store.update(|doc| {
            doc.policies.remove(&descriptor);
            Ok(())
        });
        if let Err(cleanup) = cleanup {
            tracing::error!(policy = %descriptor, error = %cleanup, "could not remove metadata of unapplied policy");
        }
        return Err(err);
    }

    tracing::info!(
        policy = %descriptor,
        dir = %dir.display(),
        filesystem = %store.filesystem(),
        "policy created"
    );
    Ok((record, policy_key))
}

/// Wrap `policy_key` under `protector_key` and append the entry to the
/// policy's wrap list. A protector from another filesystem must be found
/// through `lookup`; it then gets a link recorded next to the policy.
pub fn add_protector<B: PersistenceBackend>(
    store: &MetadataStore<B>,
    lookup: &impl ProtectorLookup,
    policy: &PolicyDescriptor,
    protector: &ProtectorRef,
    protector_key: &KeyBuffer,
    policy_key: &KeyBuffer,
) -> KwResult<PolicyRecord> {
    let local = protector.filesystem == *store.filesystem();
    if !local
        && lookup
            .lookup_protector(&protector.filesystem, &protector.descriptor)?
            .is_none()
    {
        return Err(KwError::ProtectorNotFound {
            descriptor: protector.descriptor,
            filesystem: protector.filesystem.clone(),
        });
    }
    let wrapping = derive_wrapping_key(protector_key, WrapContext::PolicyKey)?;
    let wrapped_key = wrap(&wrapping, policy_key)?;

    let updated = store.update(|doc| {
        if local && !doc.protectors.contains_key(&protector.descriptor) {
            return Err(KwError::ProtectorNotFound {
                descriptor: protector.descriptor,
                filesystem: protector.filesystem.clone(),
            });
        }
        let record = doc
            .policies
            .get_mut(policy)
            .ok_or_else(|| KwError::PolicyNotFound {
                descriptor: *policy,
                filesystem: store.filesystem().clone(),
            })?;
        if record.is_protected_by(&protector.descriptor) {
            return Err(KwError::DuplicateProtector {
                policy: *policy,
                protector: protector.descriptor,
            });
        }
        record.entries.push(WrapEntry {
            protector: protector.descriptor,
            wrapped_key,
        });
        let updated = record.clone();
        if !local {
            doc.links
                .insert(protector.descriptor, protector.filesystem.clone());
        }
        Ok(updated)
    })?;

    tracing::info!(
        %policy,
        protector = %protector.descriptor,
        linked = !local,
        "protector added to policy"
    );
    Ok(updated)
}

/// Drop one protector's wrap entry. The last entry cannot be removed; use
/// [`destroy_policy`] to get rid of the policy altogether.
pub fn remove_protector<B: PersistenceBackend>(
    store: &MetadataStore<B>,
    policy: &PolicyDescriptor,
    protector: &ProtectorDescriptor,
) -> KwResult<PolicyRecord> {
    let updated = store.update(|doc| {
        let record = doc
            .policies
            .get_mut(policy)
            .ok_or_else(|| KwError::PolicyNotFound {
                descriptor: *policy,
                filesystem: store.filesystem().clone(),
            })?;
        if !record.is_protected_by(protector) {
            return Err(KwError::ProtectorNotOnPolicy {
                policy: *policy,
                protector: *protector,
            });
        }
        if record.entries.len() == 1 {
            return Err(KwError::LastProtector {
                policy: *policy,
                protector: *protector,
            });
        }
        record.entries.retain(|e| &e.protector != protector);
        let updated = record.clone();
        doc.prune_links();
        Ok(updated)
    })?;

    tracing::info!(%policy, %protector, "protector removed from policy");
    Ok(updated)
}

/// Try each wrap entry, in list order, whose protector key is available.
/// The first one that authenticates wins.
pub fn unwrap_policy_key(
    policy: &PolicyRecord,
    available: &BTreeMap<ProtectorDescriptor, KeyBuffer>,
) -> KwResult<KeyBuffer> {
    for entry in &policy.entries {
        let Some(protector_key) = available.get(&entry.protector) else {
            continue;
        };
        let wrapping = derive_wrapping_key(protector_key, WrapContext::PolicyKey)?;
        match unwrap(&wrapping, &entry.wrapped_key) {
            Ok(key) => {
                tracing::debug!(policy = %policy.descriptor, protector = %entry.protector, "policy key unwrapped");
                return Ok(key);
            }
            Err(KwError::AuthenticationFailed) => {
                tracing::debug!(policy = %policy.descriptor, protector = %entry.protector, "wrong key for wrap entry");
            }
            Err(e) => return Err(e),
        }
    }
    Err(KwError::AllLoadsFailed {
        policy: policy.descriptor,
    })
}

/// Remove a policy record entirely, evicting its key first if it is
/// loaded. Requires `ctx.force`.
pub fn destroy_policy<B: PersistenceBackend>(
    ctx: &Context,
    store: &MetadataStore<B>,
    keyring: &impl Keyring,
    policy: &PolicyDescriptor,
) -> KwResult<()> {
    ctx.confirm_destructive(format!("destroying policy {policy}"))?;

    // Make sure it exists before touching the keyring.
    store.policy(policy)?;
    if keyring.query_state(policy) == KeyState::Unlocked {
        keyring.evict_key(policy, ctx.force)?;
    }

    store.update(|doc| {
        doc.policies
            .remove(policy)
            .ok_or_else(|| KwError::PolicyNotFound {
                descriptor: *policy,
                filesystem: store.filesystem().clone(),
            })?;
        doc.prune_links();
        Ok(())
    })?;

    tracing::warn!(%policy, filesystem = %store.filesystem(), "policy destroyed");
    Ok(())
}
