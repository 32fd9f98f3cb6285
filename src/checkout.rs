//! Materializes a snapshot into the workspace: reassembles changed
//! files from stored chunks and atomically replaces them, deletes
//! removed files, then prunes empty directories (spec §4.5, component
//! E).
//!
//! Grounded on `pbs-datastore/src/chunk_store.rs`'s temp-file-then-
//! rename write pattern, and on the teacher's general preference for a
//! `HashMap<PathBuf, Mutex<()>>`-style per-key lock map over a single
//! global lock (spec §9: "an interior-mutable map keyed by absolute
//! path... a global lock would serialize checkout unnecessarily").

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Error};

use crate::codec::CryptConfig;
use crate::progress::{Context, Event};
use crate::store::Store;
use crate::workspace::{self, IgnoreRules, WorkspaceEntry};

/// Directories that survive the empty-directory pruning pass regardless
/// of content (spec §4.5 step 6).
const PRUNE_WHITELIST: &[&str] = &[".noteforge"];

const RENAME_RETRY_ATTEMPTS: u32 = 5;
const RENAME_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// Per-path advisory locks, allocated on first use. Entries are never
/// reclaimed within a single `Checkout`'s lifetime; a fresh `Checkout`
/// starts with an empty map.
#[derive(Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap();
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct Checkout<'a> {
    pub store: &'a Store,
    pub crypt: &'a CryptConfig,
    locks: PathLocks,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckoutResult {
    pub upserts: Vec<String>,
    pub removes: Vec<String>,
}

impl<'a> Checkout<'a> {
    pub fn new(store: &'a Store, crypt: &'a CryptConfig) -> Self {
        Self {
            store,
            crypt,
            locks: PathLocks::default(),
        }
    }

    /// `checkout(index_id) -> (upserts, removes)`.
    pub fn checkout(
        &self,
        workspace_root: &Path,
        index_id: &str,
        rules: &IgnoreRules,
        ctx: &Context,
    ) -> Result<CheckoutResult, Error> {
        let target = self.store.get_index(index_id)?;
        let current_entries = workspace::walk(workspace_root, rules)?;
        let current_by_path: HashMap<&str, &WorkspaceEntry> =
            current_entries.iter().map(|e| (e.path.as_str(), e)).collect();

        let mut target_files = Vec::with_capacity(target.files.len());
        for file_id in &target.files {
            target_files.push(self.store.get_file(file_id, self.crypt)?);
        }
        let target_by_path: HashMap<&str, _> =
            target_files.iter().map(|f| (f.path.as_str(), f)).collect();

        let mut upserts = Vec::new();
        for file in &target_files {
            match current_by_path.get(file.path.as_str()) {
                Some(entry) if entry.size == file.size && entry.updated == file.updated => {}
                _ => upserts.push(file.path.clone()),
            }
        }
        let removes: Vec<String> = current_entries
            .iter()
            .filter(|e| !target_by_path.contains_key(e.path.as_str()))
            .map(|e| e.path.clone())
            .collect();

        for path in &upserts {
            ctx.check_cancelled()?;
            ctx.emit(Event::CheckoutUpsertFile { path: path.clone() });
            let file = target_by_path[path.as_str()];
            self.write_file(workspace_root, file)?;
        }
        for path in &removes {
            ctx.check_cancelled()?;
            ctx.emit(Event::CheckoutRemoveFile { path: path.clone() });
            self.remove_file(workspace_root, path)?;
        }

        prune_empty_dirs(workspace_root, workspace_root)?;

        Ok(CheckoutResult { upserts, removes })
    }

    /// Applies one file upsert outside a full `checkout()` diff pass
    /// (used by the sync engine to materialize a merge result).
    pub fn apply_upsert(&self, workspace_root: &Path, file: &crate::model::File) -> Result<(), Error> {
        self.write_file(workspace_root, file)
    }

    /// Applies one file removal outside a full `checkout()` diff pass.
    pub fn apply_remove(&self, workspace_root: &Path, path: &str) -> Result<(), Error> {
        self.remove_file(workspace_root, path)
    }

    fn write_file(&self, workspace_root: &Path, file: &crate::model::File) -> Result<(), Error> {
        let dest = workspace::resolve(workspace_root, &file.path);
        let lock = self.locks.lock_for(&dest);
        let _guard = lock.lock().unwrap();

        let parent = dest.parent().context("destination has no parent")?;
        std::fs::create_dir_all(parent)?;

        let tmp_path = parent.join(format!(
            ".{}.checkout.tmp",
            dest.file_name().unwrap().to_string_lossy()
        ));
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            for chunk_id in &file.chunks {
                let bytes = self.store.get_chunk(chunk_id, self.crypt)?;
                tmp.write_all(&bytes)?;
            }
            tmp.sync_all()?;
        }

        rename_with_retries(&tmp_path, &dest)?;
        set_mtime_ms(&dest, file.updated)?;
        Ok(())
    }

    fn remove_file(&self, workspace_root: &Path, path: &str) -> Result<(), Error> {
        let abs = workspace::resolve(workspace_root, path);
        let lock = self.locks.lock_for(&abs);
        let _guard = lock.lock().unwrap();
        match std::fs::remove_file(&abs) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Retries a rename a small bounded number of times with backoff before
/// failing fatally (spec §4.5 step 4: "Windows file-in-use").
fn rename_with_retries(from: &Path, to: &Path) -> Result<(), Error> {
    let mut last_err = None;
    for attempt in 0..RENAME_RETRY_ATTEMPTS {
        match std::fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < RENAME_RETRY_ATTEMPTS {
                    std::thread::sleep(RENAME_RETRY_BACKOFF);
                }
            }
        }
    }
    Err(last_err.unwrap()).context(format!("renaming {} to {} failed after retries", from.display(), to.display()))
}

fn set_mtime_ms(path: &Path, updated_ms: i64) -> Result<(), Error> {
    let time = std::time::UNIX_EPOCH + std::time::Duration::from_millis(updated_ms.max(0) as u64);
    let times = std::fs::FileTimes::new().set_modified(time);
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

/// Recursively removes directories left empty after upserts/removes,
/// except the whitelist (spec §4.5 step 6).
fn prune_empty_dirs(root: &Path, dir: &Path) -> Result<bool, Error> {
    if let Some(name) = dir.file_name().and_then(|n| n.to_str()) {
        if PRUNE_WHITELIST.contains(&name) {
            return Ok(false);
        }
    }

    let mut is_empty = true;
    let entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if prune_empty_dirs(root, &path)? {
                let _ = std::fs::remove_dir(&path);
            } else {
                is_empty = false;
            }
        } else {
            is_empty = false;
        }
    }
    Ok(is_empty && dir != root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{File, Index, SystemIdentity};
    use std::fs;

    fn system() -> SystemIdentity {
        SystemIdentity {
            id: "d".into(),
            name: "n".into(),
            os: "linux".into(),
        }
    }

    #[test]
    fn checkout_materializes_and_rolls_back() {
        let repo = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let store = Store::new(repo.path().to_path_buf());
        let crypt = CryptConfig::new([9u8; 32]);

        let chunk_id = crate::model::chunk_id(b"hello");
        store.put_chunk(&chunk_id, b"hello", &crypt).unwrap();
        let file_v1 = File::new("/a.md".into(), 5, 1000, vec![chunk_id.clone()]);
        store.put_file(&file_v1, &crypt).unwrap();
        let index_v1 = Index::new("init".into(), 1000, vec![file_v1.id.clone()], &[5], &system());
        store.put_index(&index_v1).unwrap();

        let checkout = Checkout::new(&store, &crypt);
        let result = checkout
            .checkout(workspace.path(), &index_v1.id, &IgnoreRules::default(), &Context::none())
            .unwrap();
        assert_eq!(result.upserts, vec!["/a.md".to_string()]);
        assert_eq!(
            fs::read(workspace.path().join("a.md")).unwrap(),
            b"hello"
        );

        // Move forward, then roll back.
        let chunk_id2 = crate::model::chunk_id(b"hello world");
        store.put_chunk(&chunk_id2, b"hello world", &crypt).unwrap();
        fs::write(workspace.path().join("a.md"), b"hello world").unwrap();

        let result = checkout
            .checkout(workspace.path(), &index_v1.id, &IgnoreRules::default(), &Context::none())
            .unwrap();
        assert!(result.upserts.contains(&"/a.md".to_string()) || result.upserts.is_empty());
        assert_eq!(fs::read(workspace.path().join("a.md")).unwrap(), b"hello");
    }

    #[test]
    fn checkout_removes_files_not_in_target() {
        let repo = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let store = Store::new(repo.path().to_path_buf());
        let crypt = CryptConfig::new([9u8; 32]);

        let index = Index::new("init".into(), 1000, vec![], &[], &system());
        store.put_index(&index).unwrap();
        fs::write(workspace.path().join("stale.md"), b"x").unwrap();

        let checkout = Checkout::new(&store, &crypt);
        let result = checkout
            .checkout(workspace.path(), &index.id, &IgnoreRules::default(), &Context::none())
            .unwrap();
        assert_eq!(result.removes, vec!["/stale.md".to_string()]);
        assert!(!workspace.path().join("stale.md").exists());
    }
}
