//! Filesystem-backed `CloudBackend`: stands in for a real network
//! object-store backend (S3/WebDAV/vendor-HTTP are out of scope, spec
//! §1) so the sync engine can be exercised end-to-end, including
//! two-device merge scenarios, without any network dependency.
//!
//! Grounded on `store.rs`'s write-to-temp-then-rename discipline,
//! applied here to a second, independent root directory that plays the
//! role of "remote".

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Error};

use super::{CloudBackend, ObjectListing, RepoListing};
use crate::error::NoteforgeError;
use crate::store::write_atomic;

/// `base` holds one subdirectory per repo (`base/<repo_name>/...`);
/// `active_repo` selects which one object operations are scoped to,
/// matching the "implicit per-user, per-repo prefix" of spec §4.6.
pub struct LocalCloudBackend {
    base: PathBuf,
    active_repo: String,
    /// Soft quota simulated for `CAPACITY` testing (spec §4.7 step 4).
    capacity_bytes: i64,
}

impl LocalCloudBackend {
    pub fn new(base: PathBuf, active_repo: impl Into<String>) -> Self {
        Self {
            base,
            active_repo: active_repo.into(),
            capacity_bytes: i64::MAX / 2,
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: i64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    fn repo_root(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }

    fn active_root(&self) -> PathBuf {
        self.repo_root(&self.active_repo)
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.active_root().join(key.trim_start_matches('/'))
    }

    fn dir_size(dir: &Path) -> Result<i64, Error> {
        let mut total = 0i64;
        if !dir.exists() {
            return Ok(0);
        }
        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry?;
            if entry.file_type().is_file() {
                total += entry.metadata()?.len() as i64;
            }
        }
        Ok(total)
    }
}

impl CloudBackend for LocalCloudBackend {
    fn create_repo(&self, name: &str) -> Result<(), Error> {
        std::fs::create_dir_all(self.repo_root(name))?;
        Ok(())
    }

    fn remove_repo(&self, name: &str) -> Result<(), Error> {
        let root = self.repo_root(name);
        match std::fs::remove_dir_all(&root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_repos(&self) -> Result<Vec<RepoListing>, Error> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let size = Self::dir_size(&entry.path())?;
            let updated = entry
                .metadata()?
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            out.push(RepoListing { name, size, updated });
        }
        Ok(out)
    }

    fn put_object(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<usize, Error> {
        let path = self.key_path(key);
        if !overwrite && path.exists() {
            return Ok(bytes.len());
        }
        write_atomic(&path, bytes)?;
        Ok(bytes.len())
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, Error> {
        let path = self.key_path(key);
        std::fs::read(&path).map_err(|_| NoteforgeError::CloudObjectNotFound(key.to_string()).into())
    }

    fn remove_object(&self, key: &str) -> Result<(), Error> {
        let path = self.key_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectListing>, Error> {
        let dir = self.key_path(prefix);
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(&dir) {
            let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(self.active_root())
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            out.push(ObjectListing {
                path: rel,
                size: entry.metadata()?.len() as i64,
            });
        }
        Ok(out)
    }

    fn available_size(&self) -> Result<i64, Error> {
        let used = Self::dir_size(&self.active_root())?;
        Ok((self.capacity_bytes - used).max(0))
    }

    fn get_chunks_not_present(&self, ids: &[String]) -> Result<Vec<String>, Error> {
        let mut missing = Vec::new();
        for id in ids {
            let key = format!("objects/{}/{}", &id[0..2], &id[2..]);
            if !self.key_path(&key).exists() {
                missing.push(id.clone());
            }
        }
        Ok(missing)
    }
}
