//! keywarden: key management for natively encrypted directories
//!
//! Commands:
//!   setup                         - create metadata stores, calibrate hashing
//!   protector create|list|verify|change|destroy
//!   encrypt <dir>                 - put an empty directory under a new policy
//!   policy add|remove|recovery|destroy <dir>
//!   unlock <dir> / lock <dir>     - load or evict a directory's policy key
//!   status [<dir>]                - show stores, or one directory's policy

mod keychain;
mod marker;
mod suggest;
mod terminal;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::ExposeSecret;

use kw_actions::{
    add_protector, add_recovery_passphrase, calibrate, change_secret, create_policy,
    create_protector, destroy_policy, destroy_protector, read_new_passphrase, remove_protector,
    setup_filesystem, unwrap_policy_key, unwrap_protector_key, verify_passphrase, Context,
    Keyring, Orchestrator, PolicyApi, ProtectorRef, ProtectorSecret, SecretSource,
    UnlockRequest, UserContext,
};
use kw_core::config::KwConfig;
use kw_core::{FilesystemId, KwError, ProtectorDescriptor, ProtectorKind};
use kw_crypto::KeyBuffer;
use kw_metadata::{FsBackend, PolicyRecord, ProtectorRecord, StoreSet};

use keychain::Keychain;
use marker::MarkerPolicyApi;
use terminal::TerminalSecrets;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "keywarden",
    version,
    about = "Manage keys for encrypted directories",
    long_about = "keywarden: protectors, policies, and unlocking of natively encrypted directories"
)]
struct Cli {
    /// Path to keywarden.toml configuration file
    #[arg(long, short = 'c', env = "KEYWARDEN_CONFIG", default_value = "/etc/keywarden.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, env = "KEYWARDEN_LOG")]
    log: Option<String>,

    /// Log format
    #[arg(long, value_enum, env = "KEYWARDEN_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Go ahead with destructive operations instead of refusing
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_config(value: &str) -> Self {
        match value {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the metadata store on configured filesystems (requires root)
    Setup {
        /// Only set up this filesystem
        #[arg(long)]
        filesystem: Option<String>,
        /// Measure passphrase hashing on this host and save the costs
        #[arg(long)]
        calibrate: bool,
    },

    /// Protector management
    Protector {
        #[command(subcommand)]
        action: ProtectorAction,
    },

    /// Encrypt an empty directory under a new policy
    ///
    /// Uses an existing protector when --protector is given, otherwise
    /// creates one on the directory's filesystem.
    Encrypt {
        dir: PathBuf,
        /// Existing protector, as FILESYSTEM:DESCRIPTOR or DESCRIPTOR
        #[arg(long, short = 'p')]
        protector: Option<String>,
        /// Kind of the new protector
        #[arg(long, default_value = "passphrase")]
        kind: ProtectorKind,
        /// Name of the new protector
        #[arg(long, short = 'n')]
        name: Option<String>,
        /// Key file for a keyfile protector
        #[arg(long, short = 'k')]
        keyfile: Option<PathBuf>,
        /// Also add a generated recovery passphrase
        #[arg(long)]
        recovery: bool,
    },

    /// Policy management for an encrypted directory
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Unlock an encrypted directory
    Unlock {
        dir: PathBuf,
        /// Only try this protector
        #[arg(long, short = 'p')]
        protector: Option<String>,
        /// Key file to try against keyfile protectors
        #[arg(long, short = 'k')]
        keyfile: Option<PathBuf>,
    },

    /// Lock an encrypted directory
    ///
    /// The platform keychain cannot see open files, so the key is removed
    /// even if other processes still use the directory.
    Lock { dir: PathBuf },

    /// Show configured filesystems, or the policy of one directory
    Status { dir: Option<PathBuf> },
}

#[derive(Subcommand, Debug)]
enum ProtectorAction {
    /// Create a protector on a filesystem
    Create {
        #[arg(long, short = 'f')]
        filesystem: String,
        #[arg(long, default_value = "passphrase")]
        kind: ProtectorKind,
        #[arg(long, short = 'n')]
        name: Option<String>,
        #[arg(long, short = 'k')]
        keyfile: Option<PathBuf>,
    },

    /// List protectors and links in each store
    List {
        #[arg(long, short = 'f')]
        filesystem: Option<String>,
    },

    /// Check a passphrase against a protector
    Verify { protector: String },

    /// Change the secret behind a protector
    Change {
        protector: String,
        /// Current key file
        #[arg(long, short = 'k')]
        keyfile: Option<PathBuf>,
        /// Replacement key file
        #[arg(long)]
        new_keyfile: Option<PathBuf>,
    },

    /// Destroy a protector (needs --force if policies depend on it)
    Destroy { protector: String },
}

#[derive(Subcommand, Debug)]
enum PolicyAction {
    /// Add a protector to a directory's policy
    Add {
        dir: PathBuf,
        #[arg(long, short = 'p')]
        protector: String,
        /// Key file of the protector being added
        #[arg(long, short = 'k')]
        keyfile: Option<PathBuf>,
        #[command(flatten)]
        unlock: UnlockWith,
    },

    /// Remove a protector from a directory's policy
    Remove {
        dir: PathBuf,
        #[arg(long, short = 'p')]
        protector: String,
    },

    /// Add a generated recovery passphrase to a directory's policy
    Recovery {
        dir: PathBuf,
        #[command(flatten)]
        unlock: UnlockWith,
    },

    /// Destroy a directory's policy metadata (needs --force)
    Destroy { dir: PathBuf },
}

/// Which existing protector proves access to the policy key.
#[derive(clap::Args, Debug)]
struct UnlockWith {
    /// Existing protector on the policy
    #[arg(long)]
    unlock_with: Option<String>,
    /// Key file for --unlock-with
    #[arg(long)]
    unlock_keyfile: Option<PathBuf>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("keywarden: {err:#}");
            if let Some(hint) = err.downcast_ref::<KwError>().and_then(suggest::suggestion) {
                eprintln!();
                eprintln!("{hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = KwConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| LogFormat::from_config(&config.logging.format));
    init_logging(&level, &format);

    let mut env = Env::new(config, cli.force);
    let keychain = Keychain::new(env.config.keyring.service.clone());
    let secrets = TerminalSecrets::new(&keychain);

    match cli.command {
        Commands::Setup { filesystem, calibrate } => {
            cmd_setup(&mut env, &cli.config, filesystem.as_deref(), calibrate)
        }
        Commands::Protector { action } => match action {
            ProtectorAction::Create {
                filesystem,
                kind,
                name,
                keyfile,
            } => cmd_protector_create(
                &env,
                &keychain,
                &secrets,
                &FilesystemId::new(filesystem),
                kind,
                name.as_deref(),
                keyfile.as_deref(),
            ),
            ProtectorAction::List { filesystem } => cmd_protector_list(&env, filesystem.as_deref()),
            ProtectorAction::Verify { protector } => cmd_protector_verify(&env, &secrets, &protector),
            ProtectorAction::Change {
                protector,
                keyfile,
                new_keyfile,
            } => cmd_protector_change(
                &env,
                &secrets,
                &protector,
                keyfile.as_deref(),
                new_keyfile.as_deref(),
            ),
            ProtectorAction::Destroy { protector } => cmd_protector_destroy(&env, &protector),
        },
        Commands::Encrypt {
            dir,
            protector,
            kind,
            name,
            keyfile,
            recovery,
        } => cmd_encrypt(
            &env,
            &keychain,
            &secrets,
            &dir,
            protector.as_deref(),
            kind,
            name.as_deref(),
            keyfile.as_deref(),
            recovery,
        ),
        Commands::Policy { action } => match action {
            PolicyAction::Add {
                dir,
                protector,
                keyfile,
                unlock,
            } => cmd_policy_add(&env, &secrets, &dir, &protector, keyfile.as_deref(), &unlock),
            PolicyAction::Remove { dir, protector } => cmd_policy_remove(&env, &dir, &protector),
            PolicyAction::Recovery { dir, unlock } => {
                cmd_policy_recovery(&env, &secrets, &dir, &unlock)
            }
            PolicyAction::Destroy { dir } => cmd_policy_destroy(&env, &keychain, &dir),
        },
        Commands::Unlock {
            dir,
            protector,
            keyfile,
        } => cmd_unlock(&env, &keychain, &secrets, &dir, protector.as_deref(), keyfile),
        Commands::Lock { dir } => cmd_lock(&env, &keychain, &secrets, &dir),
        Commands::Status { dir } => cmd_status(&env, &keychain, &secrets, dir.as_deref()),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Shared state and lookups ──────────────────────────────────────────────────

struct Env {
    config: KwConfig,
    ctx: Context,
    stores: StoreSet<FsBackend>,
}

impl Env {
    fn new(config: KwConfig, force: bool) -> Self {
        let ctx = Context::from_config(&config, current_user()).with_force(force);
        let stores = StoreSet::new(
            FsBackend::from_config(&config),
            config.filesystems.iter().map(|fs| fs.id.clone()),
        );
        Self {
            config,
            ctx,
            stores,
        }
    }

    /// The configured filesystem `dir` lives on, with `dir` made absolute.
    fn locate(&self, dir: &Path) -> Result<(PathBuf, FilesystemId)> {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("resolving {}", dir.display()))?;
        let fs = self
            .config
            .filesystem_for_path(&dir)
            .map(|fs| fs.id.clone())
            .ok_or_else(|| {
                KwError::Config(format!("{} is not on any configured filesystem", dir.display()))
            })?;
        Ok((dir, fs))
    }

    /// The policy on an encrypted directory, which must have metadata.
    fn directory_policy(&self, dir: &Path) -> Result<(PathBuf, FilesystemId, PolicyRecord)> {
        let (dir, fs) = self.locate(dir)?;
        let descriptor = MarkerPolicyApi
            .directory_policy(&dir)?
            .ok_or_else(|| anyhow!("{} is not encrypted", dir.display()))?;
        match self.stores.get(&fs)?.policy(&descriptor) {
            Ok(record) => Ok((dir, fs, record)),
            Err(KwError::PolicyNotFound { .. }) => {
                Err(KwError::MissingPolicyMetadata { dir, descriptor }.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn current_user() -> UserContext {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let uid = unsafe { libc::geteuid() };
    UserContext::new(uid)
}

/// The descriptor part of `FILESYSTEM:DESCRIPTOR` or a bare `DESCRIPTOR`.
fn parse_descriptor(selector: &str) -> Result<ProtectorDescriptor> {
    let raw = selector.rsplit_once(':').map_or(selector, |(_, d)| d);
    raw.parse().map_err(anyhow::Error::msg)
}

/// Find a protector record; a bare descriptor is searched for in every store.
fn resolve_protector(
    stores: &StoreSet<FsBackend>,
    selector: &str,
) -> Result<(ProtectorRef, ProtectorRecord)> {
    let descriptor = parse_descriptor(selector)?;
    if let Some((fs, _)) = selector.rsplit_once(':') {
        let filesystem = FilesystemId::new(fs);
        let record = stores.get(&filesystem)?.protector(&descriptor)?;
        return Ok((ProtectorRef::new(filesystem, descriptor), record));
    }
    let (filesystem, record) = stores
        .find_protector(&descriptor)?
        .ok_or_else(|| anyhow!("protector {descriptor} not found in any configured store"))?;
    Ok((ProtectorRef::new(filesystem, descriptor), record))
}

/// Gather the secret for an existing protector and re-derive its key.
fn protector_key(
    env: &Env,
    secrets: &TerminalSecrets<'_>,
    target: &ProtectorRef,
    record: &ProtectorRecord,
    keyfile: Option<&Path>,
) -> Result<KeyBuffer> {
    let secret = match record.kind() {
        ProtectorKind::Passphrase => {
            let passphrase = secrets.prompt_passphrase(&format!(
                "Enter passphrase for protector {:?}: ",
                record.display_name()
            ))?;
            if !verify_passphrase(&env.stores, target, &passphrase)? {
                // No policy to check against yet, so catch typos by asking twice.
                let again = secrets.prompt_passphrase("Confirm passphrase: ")?;
                if again.expose_secret() != passphrase.expose_secret() {
                    return Err(KwError::PassphraseMismatch.into());
                }
            }
            ProtectorSecret::Passphrase(passphrase)
        }
        ProtectorKind::Keyfile => {
            ProtectorSecret::read_keyfile(secrets, keyfile.ok_or(KwError::SpecifyKeyfile)?)?
        }
        ProtectorKind::SessionKey => ProtectorSecret::SessionKey(secrets.session_secret()?),
    };
    Ok(unwrap_protector_key(record, &secret)?)
}

/// Recover a policy key through one of its protectors.
fn policy_key(
    env: &Env,
    secrets: &TerminalSecrets<'_>,
    policy: &PolicyRecord,
    unlock: &UnlockWith,
) -> Result<KeyBuffer> {
    let (target, record) = match unlock.unlock_with.as_deref() {
        Some(selector) => resolve_protector(&env.stores, selector)?,
        None => match policy.entries.as_slice() {
            [only] => resolve_protector(&env.stores, &only.protector.to_string())?,
            entries => {
                return Err(KwError::SpecifyProtector {
                    policy: policy.descriptor,
                    candidates: entries.iter().map(|e| e.protector).collect(),
                }
                .into())
            }
        },
    };
    if !policy.is_protected_by(&target.descriptor) {
        return Err(KwError::ProtectorNotOnPolicy {
            policy: policy.descriptor,
            protector: target.descriptor,
        }
        .into());
    }
    let key = protector_key(env, secrets, &target, &record, unlock.unlock_keyfile.as_deref())?;
    Ok(unwrap_policy_key(
        policy,
        &BTreeMap::from([(target.descriptor, key)]),
    )?)
}

/// Create a protector from a freshly supplied secret.
fn new_protector(
    env: &Env,
    keychain: &Keychain,
    secrets: &TerminalSecrets<'_>,
    filesystem: &FilesystemId,
    kind: ProtectorKind,
    name: Option<&str>,
    keyfile: Option<&Path>,
) -> Result<(ProtectorRecord, KeyBuffer)> {
    let store = env.stores.get(filesystem)?;
    let secret = match (kind, name) {
        (ProtectorKind::SessionKey, _) => {
            ProtectorSecret::SessionKey(keychain.ensure_session_secret()?)
        }
        (_, None) => return Err(KwError::MissingProtectorName { kind }.into()),
        (ProtectorKind::Passphrase, Some(name)) => read_new_passphrase(secrets, name)?,
        (ProtectorKind::Keyfile, Some(_)) => {
            ProtectorSecret::read_keyfile(secrets, keyfile.ok_or(KwError::SpecifyKeyfile)?)?
        }
    };
    Ok(create_protector(&env.ctx, store, name, &secret)?)
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_setup(
    env: &mut Env,
    config_path: &Path,
    filesystem: Option<&str>,
    calibrate_costs: bool,
) -> Result<()> {
    env.ctx.require_privileged()?;

    if calibrate_costs {
        println!("Measuring passphrase hashing (target {} ms)...", env.config.kdf.target_ms);
        let costs = calibrate(&mut env.config)?;
        env.config
            .save(config_path)
            .with_context(|| format!("writing config: {}", config_path.display()))?;
        println!(
            "  time cost {}, memory {} KiB, parallelism {}",
            costs.time, costs.memory_kib, costs.parallelism
        );
        println!("  saved to {}", config_path.display());
    }

    if let Some(fs) = filesystem {
        let fs = FilesystemId::new(fs);
        setup_filesystem(&env.ctx, env.stores.get(&fs)?)?;
        println!("Metadata store created on {fs}.");
        return Ok(());
    }

    if env.config.filesystems.is_empty() {
        anyhow::bail!(
            "no filesystems configured\n\
             Add [[filesystems]] entries to {}",
            config_path.display()
        );
    }
    for store in env.stores.stores() {
        match setup_filesystem(&env.ctx, store) {
            Ok(()) => println!("{:<16} created", store.filesystem()),
            Err(KwError::AlreadySetup { .. }) => {
                println!("{:<16} already set up", store.filesystem())
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn cmd_protector_create(
    env: &Env,
    keychain: &Keychain,
    secrets: &TerminalSecrets<'_>,
    filesystem: &FilesystemId,
    kind: ProtectorKind,
    name: Option<&str>,
    keyfile: Option<&Path>,
) -> Result<()> {
    let (record, _key) = new_protector(env, keychain, secrets, filesystem, kind, name, keyfile)?;
    println!(
        "Created {} protector {filesystem}:{} ({})",
        record.kind(),
        record.descriptor,
        record.display_name()
    );
    Ok(())
}

fn cmd_protector_list(env: &Env, filesystem: Option<&str>) -> Result<()> {
    let wanted = filesystem.map(FilesystemId::new);
    if let Some(fs) = &wanted {
        env.stores.get(fs)?;
    }
    for store in env.stores.stores() {
        if wanted.as_ref().is_some_and(|fs| fs != store.filesystem()) {
            continue;
        }
        let doc = match store.load() {
            Ok(doc) => doc,
            Err(KwError::NotSetup { filesystem }) => {
                println!("{filesystem}: not set up");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        println!("{} ({} protectors)", doc.filesystem, doc.protectors.len());
        for record in doc.protectors.values() {
            let owner = record
                .owner
                .map_or_else(|| "-".to_string(), |uid| format!("uid {uid}"));
            println!(
                "  {}  {:<12} {:<10} {}",
                record.descriptor,
                record.kind().to_string(),
                owner,
                record.display_name()
            );
        }
        for (descriptor, home) in &doc.links {
            println!("  {descriptor}  linked from {home}");
        }
    }
    Ok(())
}

fn cmd_protector_verify(env: &Env, secrets: &TerminalSecrets<'_>, selector: &str) -> Result<()> {
    let (target, record) = resolve_protector(&env.stores, selector)?;
    if record.kind() != ProtectorKind::Passphrase {
        return Err(KwError::NotPassphrase {
            descriptor: record.descriptor,
        }
        .into());
    }
    let passphrase = secrets.prompt_passphrase(&format!(
        "Enter passphrase for protector {:?}: ",
        record.display_name()
    ))?;
    if verify_passphrase(&env.stores, &target, &passphrase)? {
        println!("Passphrase is correct.");
    } else {
        println!("Protector {} protects no policies; nothing to check against.", target.descriptor);
    }
    Ok(())
}

fn cmd_protector_change(
    env: &Env,
    secrets: &TerminalSecrets<'_>,
    selector: &str,
    keyfile: Option<&Path>,
    new_keyfile: Option<&Path>,
) -> Result<()> {
    let (target, record) = resolve_protector(&env.stores, selector)?;
    let (old, new) = match record.kind() {
        ProtectorKind::Passphrase => {
            let old = secrets.prompt_passphrase(&format!(
                "Enter current passphrase for protector {:?}: ",
                record.display_name()
            ))?;
            let new = read_new_passphrase(secrets, record.display_name())?;
            (ProtectorSecret::Passphrase(old), new)
        }
        ProtectorKind::Keyfile => (
            ProtectorSecret::read_keyfile(secrets, keyfile.ok_or(KwError::SpecifyKeyfile)?)?,
            ProtectorSecret::read_keyfile(secrets, new_keyfile.ok_or(KwError::SpecifyKeyfile)?)?,
        ),
        ProtectorKind::SessionKey => {
            anyhow::bail!("session-key protectors follow the login session secret; there is nothing to change")
        }
    };
    change_secret(&env.ctx, &env.stores, &target, &old, &new)?;
    println!("Changed the secret of protector {}:{}.", target.filesystem, target.descriptor);
    Ok(())
}

fn cmd_protector_destroy(env: &Env, selector: &str) -> Result<()> {
    let (target, _) = resolve_protector(&env.stores, selector)?;
    let orphaned = destroy_protector(&env.ctx, &env.stores, &target)?;
    println!("Destroyed protector {}:{}.", target.filesystem, target.descriptor);
    for policy in orphaned {
        println!("  warning: policy {policy} no longer has this protector's metadata");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_encrypt(
    env: &Env,
    keychain: &Keychain,
    secrets: &TerminalSecrets<'_>,
    dir: &Path,
    protector: Option<&str>,
    kind: ProtectorKind,
    name: Option<&str>,
    keyfile: Option<&Path>,
    recovery: bool,
) -> Result<()> {
    let (dir, fs) = env.locate(dir)?;
    let store = env.stores.get(&fs)?;

    // Settle the protector first so a bad secret leaves the directory alone.
    let (target, protector_key) = match protector {
        Some(selector) => {
            let (target, record) = resolve_protector(&env.stores, selector)?;
            let key = protector_key(env, secrets, &target, &record, keyfile)?;
            (target, key)
        }
        None => {
            let (record, key) = new_protector(env, keychain, secrets, &fs, kind, name, keyfile)?;
            (ProtectorRef::new(fs.clone(), record.descriptor), key)
        }
    };

    let (policy, policy_key) = create_policy(&env.ctx, store, &MarkerPolicyApi, &dir)?;
    add_protector(store, &env.stores, &policy.descriptor, &target, &protector_key, &policy_key)?;
    keychain.apply_key(&policy.descriptor, &policy_key)?;
    println!(
        "{} is now encrypted with policy {} (protector {}:{}).",
        dir.display(),
        policy.descriptor,
        target.filesystem,
        target.descriptor
    );

    if recovery {
        let (words, record) =
            add_recovery_passphrase(&env.ctx, store, &policy.descriptor, &policy_key, &dir)?;
        print_recovery(&words, &record);
    }
    Ok(())
}

fn cmd_policy_add(
    env: &Env,
    secrets: &TerminalSecrets<'_>,
    dir: &Path,
    selector: &str,
    keyfile: Option<&Path>,
    unlock: &UnlockWith,
) -> Result<()> {
    let (_, fs, policy) = env.directory_policy(dir)?;
    let (target, record) = resolve_protector(&env.stores, selector)?;
    if policy.is_protected_by(&target.descriptor) {
        return Err(KwError::DuplicateProtector {
            policy: policy.descriptor,
            protector: target.descriptor,
        }
        .into());
    }
    let policy_key = policy_key(env, secrets, &policy, unlock)?;
    let protector_key = protector_key(env, secrets, &target, &record, keyfile)?;
    add_protector(env.stores.get(&fs)?, &env.stores, &policy.descriptor, &target, &protector_key, &policy_key)?;
    println!(
        "Protector {}:{} added to policy {}.",
        target.filesystem, target.descriptor, policy.descriptor
    );
    Ok(())
}

fn cmd_policy_remove(env: &Env, dir: &Path, selector: &str) -> Result<()> {
    let (_, fs, policy) = env.directory_policy(dir)?;
    let protector = parse_descriptor(selector)?;
    remove_protector(env.stores.get(&fs)?, &policy.descriptor, &protector)?;
    println!("Protector {protector} removed from policy {}.", policy.descriptor);
    Ok(())
}

fn cmd_policy_recovery(
    env: &Env,
    secrets: &TerminalSecrets<'_>,
    dir: &Path,
    unlock: &UnlockWith,
) -> Result<()> {
    let (dir, fs, policy) = env.directory_policy(dir)?;
    let policy_key = policy_key(env, secrets, &policy, unlock)?;
    let (words, record) = add_recovery_passphrase(
        &env.ctx,
        env.stores.get(&fs)?,
        &policy.descriptor,
        &policy_key,
        &dir,
    )?;
    print_recovery(&words, &record);
    Ok(())
}

fn cmd_policy_destroy(env: &Env, keychain: &Keychain, dir: &Path) -> Result<()> {
    let (dir, fs, policy) = env.directory_policy(dir)?;
    destroy_policy(&env.ctx, env.stores.get(&fs)?, keychain, &policy.descriptor)?;
    println!(
        "Policy {} destroyed; the contents of {} can no longer be unlocked.",
        policy.descriptor,
        dir.display()
    );
    Ok(())
}

fn cmd_unlock(
    env: &Env,
    keychain: &Keychain,
    secrets: &TerminalSecrets<'_>,
    dir: &Path,
    protector: Option<&str>,
    keyfile: Option<PathBuf>,
) -> Result<()> {
    let (dir, _, policy) = env.directory_policy(dir)?;
    let mut request = UnlockRequest::interactive();
    if let Some(selector) = protector {
        request = request.only(parse_descriptor(selector)?);
    }
    if let Some(path) = keyfile {
        request = request.keyfile(path);
    }
    let mut orch = Orchestrator::new(&env.ctx, &env.stores, keychain, secrets);
    let outcome = orch.unlock(&policy.descriptor, &request)?;
    println!("{} unlocked with protector {}.", dir.display(), outcome.protector);
    Ok(())
}

fn cmd_lock(
    env: &Env,
    keychain: &Keychain,
    secrets: &TerminalSecrets<'_>,
    dir: &Path,
) -> Result<()> {
    let (dir, _, policy) = env.directory_policy(dir)?;
    let mut orch = Orchestrator::new(&env.ctx, &env.stores, keychain, secrets);
    orch.lock(&policy.descriptor)?;
    println!("{} locked.", dir.display());
    if !keychain.detects_key_users() {
        println!("  note: the keychain cannot tell whether other processes still use this key");
    }
    Ok(())
}

fn cmd_status(
    env: &Env,
    keychain: &Keychain,
    secrets: &TerminalSecrets<'_>,
    dir: Option<&Path>,
) -> Result<()> {
    let Some(dir) = dir else {
        return print_filesystems(env);
    };
    let (dir, _, policy) = env.directory_policy(dir)?;
    let mut orch = Orchestrator::new(&env.ctx, &env.stores, keychain, secrets);
    let status = orch.status(&policy.descriptor)?;

    println!("{}", dir.display());
    println!("  policy:      {}", status.policy);
    println!("  filesystem:  {}", status.filesystem);
    println!("  state:       {}", status.state);
    println!("  protectors:");
    for p in &status.protectors {
        match (&p.filesystem, p.kind) {
            (Some(fs), Some(kind)) => println!(
                "    {}  {:<12} {:<12} {}",
                p.descriptor,
                kind.to_string(),
                fs.as_str(),
                p.name.as_deref().unwrap_or("(unnamed)")
            ),
            _ => println!("    {}  MISSING", p.descriptor),
        }
    }
    if !status.consistency.is_consistent() {
        println!(
            "  warning: {} protector(s) cannot be found in any configured store",
            status.consistency.missing.len()
        );
    }
    Ok(())
}

fn print_filesystems(env: &Env) -> Result<()> {
    if env.config.filesystems.is_empty() {
        println!("No filesystems configured.");
        return Ok(());
    }
    println!("{:<16} {:<10} {:>10} {:>9}  root", "filesystem", "store", "protectors", "policies");
    for fs in &env.config.filesystems {
        match env.stores.get(&fs.id)?.load() {
            Ok(doc) => println!(
                "{:<16} {:<10} {:>10} {:>9}  {}",
                fs.id.as_str(),
                "ready",
                doc.protectors.len(),
                doc.policies.len(),
                fs.root.display()
            ),
            Err(KwError::NotSetup { .. }) => println!(
                "{:<16} {:<10} {:>10} {:>9}  {}",
                fs.id.as_str(),
                "not setup",
                "-",
                "-",
                fs.root.display()
            ),
            Err(e) => println!("{:<16} error: {e}", fs.id.as_str()),
        }
    }
    Ok(())
}

fn print_recovery(words: &secrecy::SecretString, record: &ProtectorRecord) {
    println!();
    println!("Recovery passphrase (protector {}):", record.descriptor);
    println!();
    println!("    {}", words.expose_secret());
    println!();
    println!("Write it down and keep it somewhere safe. It is not stored anywhere.");
}
