//! Referential-integrity check between policies and the protectors they name.

use kw_core::{FilesystemId, KwError, KwResult, PolicyDescriptor, ProtectorDescriptor};

use crate::record::{ProtectorRecord, StoreDocument};

/// Resolves a protector descriptor inside one filesystem's store.
pub trait ProtectorLookup {
    fn lookup_protector(
        &self,
        filesystem: &FilesystemId,
        descriptor: &ProtectorDescriptor,
    ) -> KwResult<Option<ProtectorRecord>>;
}

/// Outcome of [`check_consistency`]. A mismatch is reported, not raised;
/// callers decide whether it is fatal via [`ConsistencyReport::into_result`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub policy: PolicyDescriptor,
    pub filesystem: FilesystemId,
    /// Protectors found, with the filesystem each one lives on
    pub resolved: Vec<(ProtectorDescriptor, FilesystemId)>,
    /// Protectors the policy names that no known store holds
    pub missing: Vec<ProtectorDescriptor>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
    }

    /// A policy with no wrap entries cannot be unlocked by anything.
    pub fn is_unprotected(&self) -> bool {
        self.resolved.is_empty() && self.missing.is_empty()
    }

    pub fn into_result(self) -> KwResult<Self> {
        if self.is_consistent() {
            Ok(self)
        } else {
            Err(KwError::PolicyMetadataMismatch {
                policy: self.policy,
                missing: self.missing,
            })
        }
    }
}

/// Resolve every protector named by `policy` in `home`: first in `home`
/// itself, then in the filesystem `home` links it to.
pub fn check_consistency(
    home: &StoreDocument,
    policy: &PolicyDescriptor,
    lookup: &impl ProtectorLookup,
) -> KwResult<ConsistencyReport> {
    let record = home.policies.get(policy).ok_or_else(|| KwError::PolicyNotFound {
        descriptor: *policy,
        filesystem: home.filesystem.clone(),
    })?;

    let mut report = ConsistencyReport {
        policy: *policy,
        filesystem: home.filesystem.clone(),
        resolved: Vec::new(),
        missing: Vec::new(),
    };

    for protector in record.protectors() {
        if home.protectors.contains_key(protector) {
            report.resolved.push((*protector, home.filesystem.clone()));
            continue;
        }
        let linked = match home.links.get(protector) {
            Some(target) => lookup
                .lookup_protector(target, protector)?
                .map(|_| target.clone()),
            None => None,
        };
        match linked {
            Some(target) => report.resolved.push((*protector, target)),
            None => {
                tracing::warn!(
                    %policy,
                    %protector,
                    filesystem = %home.filesystem,
                    link = ?home.links.get(protector),
                    "policy references a protector that cannot be found"
                );
                report.missing.push(*protector);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PolicyRecord, ProtectorSource, WrapEntry};
    use std::collections::HashMap;
    use kw_crypto::{wrap, KeyBuffer};

    #[derive(Default)]
    struct Lookup(HashMap<(FilesystemId, ProtectorDescriptor), ProtectorRecord>);

    impl ProtectorLookup for Lookup {
        fn lookup_protector(
            &self,
            filesystem: &FilesystemId,
            descriptor: &ProtectorDescriptor,
        ) -> KwResult<Option<ProtectorRecord>> {
            Ok(self.0.get(&(filesystem.clone(), *descriptor)).cloned())
        }
    }

    fn protector(byte: u8) -> ProtectorRecord {
        ProtectorRecord {
            descriptor: ProtectorDescriptor::from_bytes([byte; 8]),
            name: None,
            owner: None,
            source: ProtectorSource::Keyfile { fingerprint: [0; 32] },
            created_at: 0,
        }
    }

    fn policy_with(protectors: &[u8]) -> PolicyRecord {
        let mut policy = PolicyRecord::new(PolicyDescriptor::from_bytes([0xAA; 16]));
        for byte in protectors {
            policy.entries.push(WrapEntry {
                protector: ProtectorDescriptor::from_bytes([*byte; 8]),
                wrapped_key: wrap(&KeyBuffer::random(), &KeyBuffer::random()).unwrap(),
            });
        }
        policy
    }

    #[test]
    fn test_local_and_linked_protectors_resolve() {
        let home = FilesystemId::new("home");
        let data = FilesystemId::new("data");
        let mut doc = StoreDocument::empty(home.clone());
        doc.protectors.insert(protector(1).descriptor, protector(1));
        doc.links.insert(protector(2).descriptor, data.clone());
        let policy = policy_with(&[1, 2]);
        let policy_desc = policy.descriptor;
        doc.policies.insert(policy_desc, policy);

        let mut lookup = Lookup::default();
        lookup.0.insert((data.clone(), protector(2).descriptor), protector(2));

        let report = check_consistency(&doc, &policy_desc, &lookup).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.resolved[1], (protector(2).descriptor, data));
    }

    #[test]
    fn test_missing_protector_is_reported_not_raised() {
        let home = FilesystemId::new("home");
        let mut doc = StoreDocument::empty(home.clone());
        doc.protectors.insert(protector(1).descriptor, protector(1));
        doc.links.insert(protector(3).descriptor, FilesystemId::new("usb"));
        let policy = policy_with(&[1, 2, 3]);
        let policy_desc = policy.descriptor;
        doc.policies.insert(policy_desc, policy);

        let report = check_consistency(&doc, &policy_desc, &Lookup::default()).unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.missing, vec![protector(2).descriptor, protector(3).descriptor]);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, KwError::PolicyMetadataMismatch { .. }));
    }

    #[test]
    fn test_unprotected_policy() {
        let mut doc = StoreDocument::empty(FilesystemId::new("home"));
        let policy = policy_with(&[]);
        let desc = policy.descriptor;
        doc.policies.insert(desc, policy);
        let report = check_consistency(&doc, &desc, &Lookup::default()).unwrap();
        assert!(report.is_consistent());
        assert!(report.is_unprotected());
    }

    #[test]
    fn test_unknown_policy() {
        let doc = StoreDocument::empty(FilesystemId::new("home"));
        let result = check_consistency(&doc, &PolicyDescriptor::from_bytes([1; 16]), &Lookup::default());
        assert!(matches!(result, Err(KwError::PolicyNotFound { .. })));
    }
}
