//! On-disk backend: `<root>/<dir_name>/store.json`, guarded by `flock(2)` on
//! `<root>/<dir_name>/store.lock`.
//!
//! Writes go to `.store.json.tmp`, are fsynced, renamed over `store.json`,
//! and the directory is fsynced. A crash at any point leaves either the old
//! or the new document in place.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use kw_core::config::{KwConfig, LockMode};
use kw_core::durable;
use kw_core::{FilesystemId, KwError, KwResult};

use crate::backend::PersistenceBackend;

const STORE_FILE: &str = "store.json";
const TEMP_FILE: &str = ".store.json.tmp";
const LOCK_FILE: &str = "store.lock";

#[derive(Debug, Clone)]
pub struct FsBackend {
    roots: BTreeMap<FilesystemId, PathBuf>,
    dir_name: String,
    lock_mode: LockMode,
}

impl FsBackend {
    pub fn new(dir_name: impl Into<String>, lock_mode: LockMode) -> Self {
        Self {
            roots: BTreeMap::new(),
            dir_name: dir_name.into(),
            lock_mode,
        }
    }

    /// Build a backend covering every filesystem listed in the config.
    pub fn from_config(config: &KwConfig) -> Self {
        let mut backend = Self::new(config.store.dir_name.clone(), config.store.lock_mode);
        for fs in &config.filesystems {
            backend.add_filesystem(fs.id.clone(), fs.root.clone());
        }
        backend
    }

    pub fn add_filesystem(&mut self, id: FilesystemId, root: PathBuf) {
        self.roots.insert(id, root);
    }

    pub fn filesystems(&self) -> impl Iterator<Item = &FilesystemId> {
        self.roots.keys()
    }

    /// Directory holding the store for `filesystem`.
    pub fn store_dir(&self, filesystem: &FilesystemId) -> KwResult<PathBuf> {
        let root = self.roots.get(filesystem).ok_or_else(|| {
            KwError::Config(format!("filesystem {filesystem} is not configured"))
        })?;
        Ok(root.join(&self.dir_name))
    }

    fn store_path(&self, filesystem: &FilesystemId) -> KwResult<PathBuf> {
        Ok(self.store_dir(filesystem)?.join(STORE_FILE))
    }

    /// First half of an atomic write: fully write and sync the temp file.
    pub(crate) fn stage(&self, filesystem: &FilesystemId, bytes: &[u8]) -> KwResult<PathBuf> {
        let tmp_path = self.store_dir(filesystem)?.join(TEMP_FILE);
        durable::stage(&tmp_path, bytes, 0o644)?;
        Ok(tmp_path)
    }

    /// Second half: rename the temp file over the store and sync the directory.
    pub(crate) fn promote(&self, filesystem: &FilesystemId, tmp_path: &Path) -> KwResult<()> {
        durable::promote(tmp_path, &self.store_path(filesystem)?)?;
        Ok(())
    }
}

impl PersistenceBackend for FsBackend {
    type Lock = FileLock;

    fn initialize(&self, filesystem: &FilesystemId) -> KwResult<()> {
        let dir = self.store_dir(filesystem)?;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&dir)?;
        tracing::debug!(%filesystem, dir = %dir.display(), "store directory ready");
        Ok(())
    }

    fn read_store_bytes(&self, filesystem: &FilesystemId) -> KwResult<Option<Vec<u8>>> {
        match fs::read(self.store_path(filesystem)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_store_bytes_atomic(&self, filesystem: &FilesystemId, bytes: &[u8]) -> KwResult<()> {
        let tmp_path = self.stage(filesystem, bytes)?;
        self.promote(filesystem, &tmp_path)?;
        tracing::debug!(%filesystem, bytes = bytes.len(), "store written");
        Ok(())
    }

    fn acquire_exclusive_lock(&self, filesystem: &FilesystemId) -> KwResult<FileLock> {
        let dir = self.store_dir(filesystem)?;
        if !dir.is_dir() {
            return Err(KwError::NotSetup {
                filesystem: filesystem.clone(),
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(dir.join(LOCK_FILE))?;

        let mut op = libc::LOCK_EX;
        if self.lock_mode == LockMode::Nonblocking {
            op |= libc::LOCK_NB;
        }
        loop {
            // SAFETY: the descriptor is valid for the lifetime of `file`.
            let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
            if rc == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                ErrorKind::WouldBlock => {
                    return Err(KwError::Busy {
                        filesystem: filesystem.clone(),
                    })
                }
                _ => return Err(err.into()),
            }
        }
        tracing::debug!(%filesystem, "store lock acquired");
        Ok(FileLock {
            file,
            filesystem: filesystem.clone(),
        })
    }
}

/// Held `flock(2)` lock; released on drop (or when the process exits).
pub struct FileLock {
    file: File,
    filesystem: FilesystemId,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still open; closing it would also unlock.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(filesystem = %self.filesystem, "store lock released");
    }
}
