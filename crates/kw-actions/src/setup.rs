//! One-time filesystem setup and KDF cost calibration.

use std::time::Duration;

use kw_core::config::KwConfig;
use kw_core::KwResult;
use kw_crypto::{calibrate_costs, HashingCosts};
use kw_metadata::{MetadataStore, PersistenceBackend};

use crate::context::Context;

/// Create the metadata store for one filesystem. Requires privilege.
pub fn setup_filesystem<B: PersistenceBackend>(
    ctx: &Context,
    store: &MetadataStore<B>,
) -> KwResult<()> {
    ctx.require_privileged()?;
    store.setup()
}

/// Measure Argon2id on this host and record costs that hit the configured
/// target time in `config.kdf`.
pub fn calibrate(config: &mut KwConfig) -> KwResult<HashingCosts> {
    let target = Duration::from_millis(config.kdf.target_ms);
    let costs = calibrate_costs(target, config.kdf.mem_cost_kib, config.kdf.parallelism)?;
    config.kdf.time_cost = costs.time;
    config.kdf.mem_cost_kib = costs.memory_kib;
    config.kdf.parallelism = costs.parallelism;
    tracing::info!(
        time = costs.time,
        memory_kib = costs.memory_kib,
        parallelism = costs.parallelism,
        target_ms = config.kdf.target_ms,
        "calibrated passphrase hashing costs"
    );
    Ok(costs)
}
