//! Who is acting, and with which knobs.

use kw_core::config::KwConfig;
use kw_core::{KwError, KwResult};
use kw_crypto::HashingCosts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub uid: u32,
    /// Whether the caller may act on other users' directories and stores
    pub privileged: bool,
}

impl UserContext {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            privileged: uid == 0,
        }
    }
}

/// Passed by reference into every operation that needs to know the acting
/// user, the Argon2id costs for new passphrase protectors, or whether
/// destructive steps were confirmed.
#[derive(Debug, Clone)]
pub struct Context {
    pub user: UserContext,
    pub costs: HashingCosts,
    /// Confirmation for destructive operations and overrides
    pub force: bool,
}

impl Context {
    pub fn new(user: UserContext, costs: HashingCosts) -> Self {
        Self {
            user,
            costs,
            force: false,
        }
    }

    pub fn from_config(config: &KwConfig, user: UserContext) -> Self {
        let costs = HashingCosts {
            time: config.kdf.time_cost,
            memory_kib: config.kdf.mem_cost_kib,
            parallelism: config.kdf.parallelism,
        };
        Self::new(user, costs)
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn require_privileged(&self) -> KwResult<()> {
        if self.user.privileged {
            Ok(())
        } else {
            Err(KwError::MustBeRoot)
        }
    }

    /// Fail with `Destructive` unless the caller confirmed with `force`.
    pub fn confirm_destructive(&self, operation: impl Into<String>) -> KwResult<()> {
        if self.force {
            Ok(())
        } else {
            Err(KwError::Destructive {
                operation: operation.into(),
            })
        }
    }
}
