//! Lock/unlock state machine.
//!
//! The keyring is authoritative for whether a policy is unlocked. The
//! orchestrator remembers what it last saw, but every action re-queries the
//! keyring first and treats its own record as a hint only.

use std::collections::BTreeMap;
use std::path::PathBuf;

use kw_core::{
    FilesystemId, KeyState, KwError, KwResult, PolicyDescriptor, ProtectorDescriptor,
    ProtectorKind,
};
use kw_crypto::KeyBuffer;
use kw_metadata::{
    check_consistency, ConsistencyReport, PersistenceBackend, PolicyRecord, ProtectorLookup,
    ProtectorRecord, StoreDocument, StoreSet,
};

use crate::context::Context;
use crate::interfaces::{Keyring, SecretSource};
use crate::policy::unwrap_policy_key;
use crate::protector::unwrap_protector_key;
use crate::secret::ProtectorSecret;

/// What the caller brings to an unlock.
#[derive(Debug, Default)]
pub struct UnlockRequest {
    /// Secrets supplied up front, by protector
    pub secrets: BTreeMap<ProtectorDescriptor, ProtectorSecret>,
    /// Only try this protector
    pub protector: Option<ProtectorDescriptor>,
    /// Key file to try against key-file protectors
    pub keyfile: Option<PathBuf>,
    /// Whether passphrases may be prompted for
    pub interactive: bool,
}

impl UnlockRequest {
    pub fn interactive() -> Self {
        Self {
            interactive: true,
            ..Self::default()
        }
    }

    pub fn with_secret(mut self, protector: ProtectorDescriptor, secret: ProtectorSecret) -> Self {
        self.secrets.insert(protector, secret);
        self
    }

    pub fn only(mut self, protector: ProtectorDescriptor) -> Self {
        self.protector = Some(protector);
        self
    }

    pub fn keyfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.keyfile = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockOutcome {
    pub policy: PolicyDescriptor,
    /// The protector whose key unwrapped the policy key
    pub protector: ProtectorDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectorSummary {
    pub descriptor: ProtectorDescriptor,
    /// Where the record was found; `None` if it is missing
    pub filesystem: Option<FilesystemId>,
    pub kind: Option<ProtectorKind>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PolicyStatus {
    pub policy: PolicyDescriptor,
    pub filesystem: FilesystemId,
    pub state: KeyState,
    pub protectors: Vec<ProtectorSummary>,
    pub consistency: ConsistencyReport,
}

struct Candidate {
    record: ProtectorRecord,
    filesystem: FilesystemId,
}

pub struct Orchestrator<'a, B, K, S> {
    ctx: &'a Context,
    stores: &'a StoreSet<B>,
    keyring: &'a K,
    secrets: &'a S,
    observed: BTreeMap<PolicyDescriptor, KeyState>,
}

impl<'a, B, K, S> Orchestrator<'a, B, K, S>
where
    B: PersistenceBackend,
    K: Keyring,
    S: SecretSource,
{
    pub fn new(ctx: &'a Context, stores: &'a StoreSet<B>, keyring: &'a K, secrets: &'a S) -> Self {
        Self {
            ctx,
            stores,
            keyring,
            secrets,
            observed: BTreeMap::new(),
        }
    }

    /// Last state seen for `policy`, without asking the keyring.
    pub fn last_observed(&self, policy: &PolicyDescriptor) -> KeyState {
        self.observed
            .get(policy)
            .copied()
            .unwrap_or(KeyState::Unknown)
    }

    /// Ask the keyring for the current state and remember it.
    pub fn refresh(&mut self, policy: &PolicyDescriptor) -> KeyState {
        let state = self.keyring.query_state(policy);
        let previous = self.observed.insert(*policy, state);
        if let Some(previous) = previous {
            if previous != state {
                tracing::debug!(%policy, %previous, current = %state, "key state changed externally");
            }
        }
        state
    }

    /// Unwrap the policy key with the first protector the request can
    /// satisfy and hand it to the keyring.
    ///
    /// Supplied secrets, the login session secret and a supplied key file
    /// are tried in wrap-list order. Passphrases are only prompted for when
    /// the request is interactive and exactly one passphrase protector is
    /// left to try. Nothing in the metadata stores is changed.
    pub fn unlock(
        &mut self,
        policy: &PolicyDescriptor,
        request: &UnlockRequest,
    ) -> KwResult<UnlockOutcome> {
        if self.refresh(policy) == KeyState::Unlocked {
            return Err(KwError::PolicyUnlocked { policy: *policy });
        }

        let home = self.locate(policy)?;
        let record = home
            .policies
            .get(policy)
            .ok_or_else(|| KwError::PolicyNotFound {
                descriptor: *policy,
                filesystem: home.filesystem.clone(),
            })?;
        let candidates = self.candidates(&home, record, request.protector.as_ref())?;

        let mut keyfile: Option<ProtectorSecret> = None;
        let mut needs_prompt: Vec<&Candidate> = Vec::new();
        for candidate in &candidates {
            let descriptor = candidate.record.descriptor;
            let attempt = if let Some(secret) = request.secrets.get(&descriptor) {
                self.try_candidate(record, candidate, secret)?
            } else {
                match candidate.record.kind() {
                    ProtectorKind::SessionKey => match self.secrets.session_secret() {
                        Ok(session) => self.try_candidate(
                            record,
                            candidate,
                            &ProtectorSecret::SessionKey(session),
                        )?,
                        Err(err) => {
                            tracing::debug!(protector = %descriptor, error = %err, "no login session secret");
                            None
                        }
                    },
                    ProtectorKind::Keyfile => match &request.keyfile {
                        Some(path) => {
                            if keyfile.is_none() {
                                keyfile = Some(ProtectorSecret::read_keyfile(self.secrets, path)?);
                            }
                            match &keyfile {
                                Some(secret) => self.try_candidate(record, candidate, secret)?,
                                None => None,
                            }
                        }
                        None if request.protector == Some(descriptor) => {
                            return Err(KwError::SpecifyKeyfile)
                        }
                        None => None,
                    },
                    ProtectorKind::Passphrase => {
                        needs_prompt.push(candidate);
                        None
                    }
                }
            };
            if let Some(key) = attempt {
                return self.apply(policy, candidate, key);
            }
        }

        if request.interactive {
            match needs_prompt.as_slice() {
                [] => {}
                [candidate] => {
                    let passphrase = self.secrets.prompt_passphrase(&format!(
                        "Enter passphrase for protector {:?}: ",
                        candidate.record.display_name()
                    ))?;
                    let secret = ProtectorSecret::Passphrase(passphrase);
                    if let Some(key) = self.try_candidate(record, candidate, &secret)? {
                        return self.apply(policy, candidate, key);
                    }
                }
                several => {
                    return Err(KwError::SpecifyProtector {
                        policy: *policy,
                        candidates: several.iter().map(|c| c.record.descriptor).collect(),
                    })
                }
            }
        }

        tracing::warn!(%policy, tried = candidates.len(), "no protector could unlock policy");
        Err(KwError::AllLoadsFailed { policy: *policy })
    }

    /// Evict the policy key. Refused with `StillInUse` while other users of
    /// the key remain, unless the context forces it.
    pub fn lock(&mut self, policy: &PolicyDescriptor) -> KwResult<()> {
        if self.refresh(policy) == KeyState::Locked {
            tracing::info!(%policy, "policy already locked");
            return Ok(());
        }
        self.keyring.evict_key(policy, self.ctx.force)?;
        self.observed.insert(*policy, KeyState::Locked);
        tracing::info!(%policy, "policy locked");
        Ok(())
    }

    pub fn status(&mut self, policy: &PolicyDescriptor) -> KwResult<PolicyStatus> {
        let home = self.locate(policy)?;
        let consistency = check_consistency(&home, policy, self.stores)?;
        let mut protectors = Vec::new();
        if let Some(record) = home.policies.get(policy) {
            for descriptor in record.protectors() {
                let found = self.resolve(&home, descriptor)?;
                protectors.push(ProtectorSummary {
                    descriptor: *descriptor,
                    kind: found.as_ref().map(|c| c.record.kind()),
                    name: found.as_ref().and_then(|c| c.record.name.clone()),
                    filesystem: found.map(|c| c.filesystem),
                });
            }
        }
        Ok(PolicyStatus {
            policy: *policy,
            filesystem: home.filesystem.clone(),
            state: self.refresh(policy),
            protectors,
            consistency,
        })
    }

    /// The store document that holds `policy`.
    fn locate(&self, policy: &PolicyDescriptor) -> KwResult<StoreDocument> {
        for store in self.stores.stores() {
            match store.load() {
                Ok(doc) if doc.policies.contains_key(policy) => return Ok(doc),
                Ok(_) | Err(KwError::NotSetup { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        let searched: Vec<&str> = self.stores.filesystems().map(|f| f.as_str()).collect();
        Err(KwError::PolicyNotFound {
            descriptor: *policy,
            filesystem: FilesystemId::new(searched.join(",")),
        })
    }

    /// Find a protector record locally or through the link recorded for it.
    fn resolve(
        &self,
        home: &StoreDocument,
        descriptor: &ProtectorDescriptor,
    ) -> KwResult<Option<Candidate>> {
        if let Some(record) = home.protectors.get(descriptor) {
            return Ok(Some(Candidate {
                record: record.clone(),
                filesystem: home.filesystem.clone(),
            }));
        }
        let Some(target) = home.links.get(descriptor) else {
            return Ok(None);
        };
        Ok(self
            .stores
            .lookup_protector(target, descriptor)?
            .map(|record| Candidate {
                record,
                filesystem: target.clone(),
            }))
    }

    /// Resolvable protectors of `record`, in wrap-list order.
    fn candidates(
        &self,
        home: &StoreDocument,
        record: &PolicyRecord,
        only: Option<&ProtectorDescriptor>,
    ) -> KwResult<Vec<Candidate>> {
        if let Some(only) = only {
            if !record.is_protected_by(only) {
                return Err(KwError::ProtectorNotOnPolicy {
                    policy: record.descriptor,
                    protector: *only,
                });
            }
        }
        let mut candidates = Vec::new();
        for descriptor in record.protectors() {
            if only.is_some_and(|o| o != descriptor) {
                continue;
            }
            match self.resolve(home, descriptor)? {
                Some(candidate) => candidates.push(candidate),
                None if only.is_some() => {
                    return Err(KwError::PolicyMetadataMismatch {
                        policy: record.descriptor,
                        missing: vec![*descriptor],
                    })
                }
                None => {
                    tracing::warn!(policy = %record.descriptor, protector = %descriptor, "skipping protector that cannot be found");
                }
            }
        }
        Ok(candidates)
    }

    /// `Ok(None)` when the secret is simply wrong for this protector. A
    /// secret of the wrong kind is a usage error and is returned as such.
    fn try_candidate(
        &self,
        policy: &PolicyRecord,
        candidate: &Candidate,
        secret: &ProtectorSecret,
    ) -> KwResult<Option<KeyBuffer>> {
        let descriptor = candidate.record.descriptor;
        let protector_key = match unwrap_protector_key(&candidate.record, secret) {
            Ok(key) => key,
            Err(err @ KwError::WrongKey { .. }) => {
                tracing::debug!(protector = %descriptor, error = %err, "protector key unavailable");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let available = BTreeMap::from([(descriptor, protector_key)]);
        match unwrap_policy_key(policy, &available) {
            Ok(key) => Ok(Some(key)),
            Err(KwError::AllLoadsFailed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn apply(
        &mut self,
        policy: &PolicyDescriptor,
        candidate: &Candidate,
        policy_key: KeyBuffer,
    ) -> KwResult<UnlockOutcome> {
        self.keyring.apply_key(policy, &policy_key)?;
        drop(policy_key);
        self.observed.insert(*policy, KeyState::Unlocked);
        tracing::info!(
            %policy,
            protector = %candidate.record.descriptor,
            protector_filesystem = %candidate.filesystem,
            "policy unlocked"
        );
        Ok(UnlockOutcome {
            policy: *policy,
            protector: candidate.record.descriptor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UserContext;
    use crate::mock::{MockKeyring, MockSecrets};
    use crate::policy::add_protector;
    use crate::protector::{create_protector, ProtectorRef};
    use kw_crypto::HashingCosts;
    use kw_metadata::{MemoryBackend, MetadataStore};

    struct Fixture {
        ctx: Context,
        stores: StoreSet<MemoryBackend>,
        keyring: MockKeyring,
        policy: PolicyDescriptor,
        policy_key: KeyBuffer,
    }

    fn home() -> FilesystemId {
        FilesystemId::new("home")
    }

    impl Fixture {
        fn new() -> Self {
            let stores = StoreSet::new(MemoryBackend::new(), [home(), FilesystemId::new("usb")]);
            stores.get(&home()).unwrap().setup().unwrap();
            stores.get(&FilesystemId::new("usb")).unwrap().setup().unwrap();
            let policy = PolicyDescriptor::from_bytes([0xD1; 16]);
            stores
                .get(&home())
                .unwrap()
                .update(|doc| {
                    doc.policies.insert(policy, PolicyRecord::new(policy));
                    Ok(())
                })
                .unwrap();
            Self {
                ctx: Context::new(UserContext::new(1000), HashingCosts::insecure_for_tests()),
                stores,
                keyring: MockKeyring::new(),
                policy,
                policy_key: KeyBuffer::random(),
            }
        }

        fn store(&self, fs: &str) -> &MetadataStore<MemoryBackend> {
            self.stores.get(&FilesystemId::new(fs)).unwrap()
        }

        fn protect(&self, fs: &str, name: Option<&str>, secret: &ProtectorSecret) -> ProtectorDescriptor {
            let (record, key) = create_protector(&self.ctx, self.store(fs), name, secret).unwrap();
            add_protector(
                self.store("home"),
                &self.stores,
                &self.policy,
                &ProtectorRef::new(FilesystemId::new(fs), record.descriptor),
                &key,
                &self.policy_key,
            )
            .unwrap();
            record.descriptor
        }

        fn orchestrator<'a>(&'a self, secrets: &'a MockSecrets) -> Orchestrator<'a, MemoryBackend, MockKeyring, MockSecrets> {
            Orchestrator::new(&self.ctx, &self.stores, &self.keyring, secrets)
        }

        fn applied(&self) -> Option<[u8; 32]> {
            self.keyring.applied_key(&self.policy).map(|k| *k.as_bytes())
        }
    }

    #[test]
    fn test_interactive_single_passphrase_is_prompted() {
        let fx = Fixture::new();
        let p1 = fx.protect("home", Some("laptop"), &ProtectorSecret::passphrase("correct horse"));
        let secrets = MockSecrets::new().answer("correct horse");
        let mut orch = fx.orchestrator(&secrets);

        assert_eq!(orch.last_observed(&fx.policy), KeyState::Unknown);
        let outcome = orch.unlock(&fx.policy, &UnlockRequest::interactive()).unwrap();
        assert_eq!(outcome.protector, p1);
        assert_eq!(fx.applied(), Some(*fx.policy_key.as_bytes()));
        assert_eq!(secrets.prompts().len(), 1);
        assert!(secrets.prompts()[0].contains("laptop"));
        assert_eq!(orch.last_observed(&fx.policy), KeyState::Unlocked);
    }

    #[test]
    fn test_non_interactive_never_prompts() {
        let fx = Fixture::new();
        fx.protect("home", Some("laptop"), &ProtectorSecret::passphrase("correct horse"));
        let secrets = MockSecrets::new().answer("correct horse");
        let mut orch = fx.orchestrator(&secrets);
        assert!(matches!(
            orch.unlock(&fx.policy, &UnlockRequest::default()),
            Err(KwError::AllLoadsFailed { .. })
        ));
        assert!(secrets.prompts().is_empty());
    }

    #[test]
    fn test_session_key_unlocks_without_interaction() {
        let fx = Fixture::new();
        let session = KeyBuffer::random();
        fx.protect("home", Some("laptop"), &ProtectorSecret::passphrase("pw"));
        let login = fx.protect("home", None, &ProtectorSecret::SessionKey(session.duplicate()));
        let secrets = MockSecrets::new().with_session(session);
        let mut orch = fx.orchestrator(&secrets);

        let outcome = orch.unlock(&fx.policy, &UnlockRequest::interactive()).unwrap();
        assert_eq!(outcome.protector, login);
        assert!(secrets.prompts().is_empty());
    }

    #[test]
    fn test_linked_keyfile_protector() {
        let fx = Fixture::new();
        let usb = fx.protect("usb", Some("usb key"), &ProtectorSecret::keyfile("/media/key", vec![5; 128]));
        let secrets = MockSecrets::new()
            .with_keyfile("/media/key", vec![5; 128])
            .with_keyfile("/media/other", vec![6; 128]);

        let mut orch = fx.orchestrator(&secrets);
        assert!(matches!(
            orch.unlock(&fx.policy, &UnlockRequest::default().keyfile("/media/other")),
            Err(KwError::AllLoadsFailed { .. })
        ));
        assert!(matches!(
            orch.unlock(&fx.policy, &UnlockRequest::default().only(usb)),
            Err(KwError::SpecifyKeyfile)
        ));
        let outcome = orch
            .unlock(&fx.policy, &UnlockRequest::default().keyfile("/media/key"))
            .unwrap();
        assert_eq!(outcome.protector, usb);
    }

    #[test]
    fn test_secret_of_wrong_kind_is_reported() {
        let fx = Fixture::new();
        let usb = fx.protect("usb", Some("usb key"), &ProtectorSecret::keyfile("/media/key", vec![5; 128]));
        let secrets = MockSecrets::new();
        let mut orch = fx.orchestrator(&secrets);

        let request = UnlockRequest::default().with_secret(usb, ProtectorSecret::passphrase("pw"));
        assert!(matches!(
            orch.unlock(&fx.policy, &request),
            Err(KwError::InvalidSource { kind: ProtectorKind::Keyfile, .. })
        ));
        assert_eq!(fx.keyring.apply_calls(), 0);
    }

    #[test]
    fn test_several_passphrases_need_a_choice() {
        let fx = Fixture::new();
        let a = fx.protect("home", Some("a"), &ProtectorSecret::passphrase("alpha"));
        let b = fx.protect("home", Some("b"), &ProtectorSecret::passphrase("bravo"));
        let secrets = MockSecrets::new().answer("bravo");
        let mut orch = fx.orchestrator(&secrets);

        match orch.unlock(&fx.policy, &UnlockRequest::interactive()) {
            Err(KwError::SpecifyProtector { candidates, .. }) => assert_eq!(candidates, vec![a, b]),
            other => panic!("expected SpecifyProtector, got {other:?}"),
        }
        let outcome = orch
            .unlock(&fx.policy, &UnlockRequest::interactive().only(b))
            .unwrap();
        assert_eq!(outcome.protector, b);
    }

    #[test]
    fn test_already_unlocked_is_reported() {
        let fx = Fixture::new();
        let p = fx.protect("home", Some("p"), &ProtectorSecret::passphrase("pw"));
        let secrets = MockSecrets::new();
        let mut orch = fx.orchestrator(&secrets);
        let request = UnlockRequest::default().with_secret(p, ProtectorSecret::passphrase("pw"));
        orch.unlock(&fx.policy, &request).unwrap();
        assert!(matches!(
            orch.unlock(&fx.policy, &request),
            Err(KwError::PolicyUnlocked { .. })
        ));
    }

    #[test]
    fn test_state_is_reverified_against_keyring() {
        let fx = Fixture::new();
        let p = fx.protect("home", Some("p"), &ProtectorSecret::passphrase("pw"));
        let secrets = MockSecrets::new();
        let mut orch = fx.orchestrator(&secrets);
        let request = UnlockRequest::default().with_secret(p, ProtectorSecret::passphrase("pw"));
        orch.unlock(&fx.policy, &request).unwrap();

        // Someone else locks it; the stale observation must not block us.
        fx.keyring.evict_externally(&fx.policy);
        assert_eq!(orch.last_observed(&fx.policy), KeyState::Unlocked);
        orch.unlock(&fx.policy, &request).unwrap();
        assert_eq!(fx.keyring.apply_calls(), 2);
    }

    #[test]
    fn test_keyring_failure_leaves_metadata_untouched() {
        let fx = Fixture::new();
        let p = fx.protect("home", Some("p"), &ProtectorSecret::passphrase("pw"));
        let before = fx.store("home").load().unwrap();
        fx.keyring.fail_apply(true);
        let secrets = MockSecrets::new();
        let mut orch = fx.orchestrator(&secrets);

        let request = UnlockRequest::default().with_secret(p, ProtectorSecret::passphrase("pw"));
        assert!(matches!(orch.unlock(&fx.policy, &request), Err(KwError::Keyring(_))));
        assert_eq!(fx.store("home").load().unwrap(), before);
        assert_eq!(orch.refresh(&fx.policy), KeyState::Locked);
    }

    #[test]
    fn test_lock_refuses_key_still_in_use() {
        let fx = Fixture::new();
        let p = fx.protect("home", Some("p"), &ProtectorSecret::passphrase("pw"));
        let secrets = MockSecrets::new();
        let mut orch = fx.orchestrator(&secrets);
        orch.unlock(
            &fx.policy,
            &UnlockRequest::default().with_secret(p, ProtectorSecret::passphrase("pw")),
        )
        .unwrap();
        fx.keyring.mark_in_use(&fx.policy);

        assert!(matches!(orch.lock(&fx.policy), Err(KwError::StillInUse { .. })));
        assert_eq!(orch.refresh(&fx.policy), KeyState::Unlocked);

        let forced = fx.ctx.clone().with_force(true);
        let mut orch = Orchestrator::new(&forced, &fx.stores, &fx.keyring, &secrets);
        orch.lock(&fx.policy).unwrap();
        assert_eq!(orch.refresh(&fx.policy), KeyState::Locked);
        // Locking again is a no-op.
        orch.lock(&fx.policy).unwrap();
    }

    #[test]
    fn test_status_lists_protectors_and_mismatch() {
        let fx = Fixture::new();
        let local = fx.protect("home", Some("laptop"), &ProtectorSecret::passphrase("pw"));
        let linked = fx.protect("usb", Some("usb key"), &ProtectorSecret::keyfile("/k", vec![1; 8]));
        let secrets = MockSecrets::new();
        let mut orch = fx.orchestrator(&secrets);

        let status = orch.status(&fx.policy).unwrap();
        assert_eq!(status.state, KeyState::Locked);
        assert!(status.consistency.is_consistent());
        assert_eq!(status.protectors[0].name.as_deref(), Some("laptop"));
        assert_eq!(status.protectors[1].filesystem, Some(FilesystemId::new("usb")));

        fx.store("usb")
            .update(|doc| {
                doc.protectors.remove(&linked);
                Ok(())
            })
            .unwrap();
        let status = orch.status(&fx.policy).unwrap();
        assert_eq!(status.consistency.missing, vec![linked]);
        assert_eq!(status.protectors[1].kind, None);
        assert_eq!(status.protectors[0].descriptor, local);
    }

    #[test]
    fn test_unknown_policy() {
        let fx = Fixture::new();
        let secrets = MockSecrets::new();
        let mut orch = fx.orchestrator(&secrets);
        assert!(matches!(
            orch.unlock(&PolicyDescriptor::from_bytes([0xEE; 16]), &UnlockRequest::default()),
            Err(KwError::PolicyNotFound { .. })
        ));
    }
}
