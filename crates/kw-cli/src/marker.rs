//! Encryption policy attachment recorded as a marker file in the directory.
//!
//! Stands in for the kernel's per-directory policy ioctls: the policy
//! descriptor is written once to `.keywarden-policy` and never changed.

use std::io::{ErrorKind as IoErrorKind, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use kw_actions::{DirectoryInfo, PolicyApi};
use kw_core::{KwError, KwResult, PolicyDescriptor};
use kw_crypto::{policy_key_identifier, KeyBuffer};

pub const MARKER_FILE: &str = ".keywarden-policy";

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerPolicyApi;

fn marker_path(dir: &Path) -> PathBuf {
    dir.join(MARKER_FILE)
}

impl PolicyApi for MarkerPolicyApi {
    fn directory_policy(&self, dir: &Path) -> KwResult<Option<PolicyDescriptor>> {
        let content = match std::fs::read_to_string(marker_path(dir)) {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                if !dir.is_dir() {
                    return Err(KwError::PolicyApi(format!(
                        "{} is not a directory",
                        dir.display()
                    )));
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        content.trim().parse().map(Some).map_err(|e| {
            KwError::PolicyApi(format!("bad policy marker in {}: {e}", dir.display()))
        })
    }

    fn directory_info(&self, dir: &Path) -> KwResult<DirectoryInfo> {
        let meta = std::fs::metadata(dir)?;
        if !meta.is_dir() {
            return Err(KwError::PolicyApi(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let is_empty = std::fs::read_dir(dir)?.next().is_none();
        Ok(DirectoryInfo {
            owner: meta.uid(),
            is_empty,
        })
    }

    fn key_descriptor(&self, key: &KeyBuffer) -> KwResult<PolicyDescriptor> {
        Ok(PolicyDescriptor::from_bytes(policy_key_identifier(key)))
    }

    fn set_directory_policy(&self, dir: &Path, policy: &PolicyDescriptor) -> KwResult<()> {
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(marker_path(dir))
        {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                return Err(KwError::PolicyApi(format!(
                    "{} already has an encryption policy",
                    dir.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{policy}")?;
        file.sync_all()?;
        tracing::debug!(dir = %dir.display(), %policy, "policy marker written");
        Ok(())
    }
}
