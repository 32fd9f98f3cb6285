//! Local content-addressed object store (spec §3, §4.2, §6).
//!
//! Paths: `<root>/objects/<id[0:2]>/<id[2:]>` for chunks and files,
//! `<root>/indexes/<id>` for snapshots, `<root>/check/indexes/<id>` for
//! check manifests. Every write goes through `write_atomic`: write to a
//! sibling `.tmp` file, `fsync`, then rename over the destination, so a
//! process death never leaves a half-written object in place (spec §9:
//! "every persistent write is temp-file + rename").
//!
//! Grounded on `pbs-datastore/src/chunk_store.rs`'s two-level hex-prefix
//! layout and write-if-absent semantics, simplified from its
//! `ProcessLocker`-guarded multi-tenant design down to the single-user
//! scope of this store.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Error};

use crate::codec::{self, CryptConfig};
use crate::error::NoteforgeError;
use crate::model::{CheckIndex, File, Index};

const REF_LATEST: &str = "refs/latest";
const REF_LATEST_SYNC: &str = "refs/latest-sync";

/// Whether an object path is present, absent, or present-but-unreadable
/// (spec §4.4 step 3: `ErrNotExist` is fatal, a permission error is
/// not). `Path::exists()` alone can't tell these apart since it
/// swallows the underlying `io::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectPresence {
    Present,
    Missing,
    PermissionDenied,
}

fn stat_path(path: &Path) -> ObjectPresence {
    match std::fs::symlink_metadata(path) {
        Ok(_) => ObjectPresence::Present,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            ObjectPresence::PermissionDenied
        }
        Err(_) => ObjectPresence::Missing,
    }
}

/// Maps a failed object read to the right `NoteforgeError`, preserving
/// the distinction between "not there" and "there but unreadable"
/// instead of collapsing both into `NotFoundObject`.
fn read_object(path: &Path, id: &str) -> Result<Vec<u8>, Error> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(NoteforgeError::ObjectPermissionDenied(id.to_string()).into())
        }
        Err(_) => Err(NoteforgeError::NotFoundObject(id.to_string()).into()),
    }
}

/// Writes `data` to `path` via a sibling temp file + atomic rename.
/// Creates the parent directory if missing.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), Error> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap().to_string_lossy()
    ));
    {
        let mut tmp = std::fs::File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        tmp.write_all(data)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Two-level hex-prefix path for a content id under `objects/`.
fn object_path(root: &Path, id: &str) -> PathBuf {
    root.join("objects").join(&id[0..2]).join(&id[2..])
}

fn index_path(root: &Path, id: &str) -> PathBuf {
    root.join("indexes").join(id)
}

fn check_index_path(root: &Path, id: &str) -> PathBuf {
    root.join("check").join("indexes").join(id)
}

/// The local on-disk object store rooted at a repository directory.
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write-if-absent: a chunk already on disk is a silent no-op (spec
    /// §3: "a chunk is written at most once; duplicate writes are
    /// no-ops").
    pub fn put_chunk(&self, id: &str, raw: &[u8], crypt: &CryptConfig) -> Result<(), Error> {
        let path = object_path(&self.root, id);
        if path.exists() {
            return Ok(());
        }
        let encoded = codec::encode_encrypted(raw, crypt)?;
        write_atomic(&path, &encoded)
    }

    pub fn get_chunk(&self, id: &str, crypt: &CryptConfig) -> Result<Vec<u8>, Error> {
        let path = object_path(&self.root, id);
        let encoded = read_object(&path, id)?;
        codec::decode_encrypted(&encoded, crypt)
    }

    pub fn stat_chunk(&self, id: &str) -> bool {
        self.chunk_presence(id) == ObjectPresence::Present
    }

    pub fn chunk_presence(&self, id: &str) -> ObjectPresence {
        stat_path(&object_path(&self.root, id))
    }

    /// Loosens an object's file permissions after a `PermissionDenied`
    /// stat/read, per spec §4.4 step 3 ("if missing due to permission,
    /// attempt to chmod then continue").
    pub fn relax_permissions(&self, id: &str) -> Result<(), Error> {
        let path = object_path(&self.root, id);
        let perms = std::fs::Permissions::from_mode(0o644);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("chmod {}", path.display()))
    }

    pub fn put_file(&self, file: &File, crypt: &CryptConfig) -> Result<(), Error> {
        let path = object_path(&self.root, &file.id);
        if path.exists() {
            return Ok(());
        }
        let json = serde_json::to_vec(file)?;
        let encoded = codec::encode_encrypted(&json, crypt)?;
        write_atomic(&path, &encoded)
    }

    pub fn get_file(&self, id: &str, crypt: &CryptConfig) -> Result<File, Error> {
        let path = object_path(&self.root, id);
        let encoded = read_object(&path, id)?;
        let json = codec::decode_encrypted(&encoded, crypt)?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn stat_file(&self, id: &str) -> bool {
        object_path(&self.root, id).exists()
    }

    pub fn put_index(&self, index: &Index) -> Result<(), Error> {
        let path = index_path(&self.root, &index.id);
        if path.exists() {
            return Ok(());
        }
        let json = serde_json::to_vec(index)?;
        let encoded = codec::encode_plain(&json)?;
        write_atomic(&path, &encoded)
    }

    pub fn get_index(&self, id: &str) -> Result<Index, Error> {
        let path = index_path(&self.root, id);
        let encoded = read_object(&path, id)?;
        let json = codec::decode_plain(&encoded)?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn stat_index(&self, id: &str) -> bool {
        index_path(&self.root, id).exists()
    }

    pub fn put_check_index(&self, check: &CheckIndex) -> Result<(), Error> {
        let path = check_index_path(&self.root, &check.id);
        let json = serde_json::to_vec(check)?;
        let encoded = codec::encode_plain(&json)?;
        write_atomic(&path, &encoded)
    }

    pub fn get_check_index(&self, id: &str) -> Result<CheckIndex, Error> {
        let path = check_index_path(&self.root, id);
        let encoded = read_object(&path, id)?;
        let json = codec::decode_plain(&encoded)?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn remove_object(&self, id: &str) -> Result<(), Error> {
        let path = object_path(&self.root, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_index(&self, id: &str) -> Result<(), Error> {
        let path = index_path(&self.root, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads `refs/latest`, resolving it to the pointed `Index`. Returns
    /// `NotFoundIndex` if the ref file does not exist (spec §4.10): the
    /// empty-repo state.
    pub fn latest(&self) -> Result<Index, Error> {
        let id = self
            .read_ref(REF_LATEST)?
            .ok_or(NoteforgeError::NotFoundIndex)?;
        self.get_index(&id)
    }

    pub fn latest_id(&self) -> Result<Option<String>, Error> {
        self.read_ref(REF_LATEST)
    }

    pub fn update_latest(&self, index: &Index) -> Result<(), Error> {
        self.put_index(index)?;
        write_atomic(&self.root.join(REF_LATEST), index.id.as_bytes())
    }

    pub fn latest_sync_id(&self) -> Result<Option<String>, Error> {
        self.read_ref(REF_LATEST_SYNC)
    }

    pub fn update_latest_sync(&self, id: &str) -> Result<(), Error> {
        write_atomic(&self.root.join(REF_LATEST_SYNC), id.as_bytes())
    }

    pub fn tag(&self, name: &str) -> Result<Option<String>, Error> {
        validate_tag_name(name)?;
        self.read_ref(&format!("refs/tags/{name}"))
    }

    pub fn set_tag(&self, name: &str, id: &str) -> Result<(), Error> {
        validate_tag_name(name)?;
        write_atomic(&self.root.join("refs").join("tags").join(name), id.as_bytes())
    }

    pub fn remove_tag(&self, name: &str) -> Result<(), Error> {
        validate_tag_name(name)?;
        match std::fs::remove_file(self.root.join("refs").join("tags").join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_tags(&self) -> Result<Vec<String>, Error> {
        let dir = self.root.join("refs").join("tags");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_ref(&self, rel: &str) -> Result<Option<String>, Error> {
        match std::fs::read_to_string(self.root.join(rel)) {
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Wipes all local store state (`objects/`, `indexes/`, `check/`,
    /// `refs/`) after a `RepoFatal` error, leaving `config.json` and the
    /// repo root itself in place. The caller is left with an
    /// empty-repo store; the next `Sync` repopulates it from the cloud
    /// side from scratch (spec §4.2, §7 `RepoFatal`: "caller must reset
    /// the repo").
    pub fn reset(&self) -> Result<(), Error> {
        for dir in ["objects", "indexes", "check", "refs"] {
            let path = self.root.join(dir);
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
            }
        }
        Ok(())
    }

    /// Walks refs → reachable indexes → reachable files → reachable
    /// chunks, then removes unreachable objects and index files (spec
    /// §4.2 `Purge`).
    pub fn purge(&self, crypt: &CryptConfig) -> Result<PurgeReport, Error> {
        let mut reachable_indexes = std::collections::HashSet::new();
        for id in self.reachable_index_ids()? {
            reachable_indexes.insert(id);
        }

        let mut reachable_files = std::collections::HashSet::new();
        let mut reachable_chunks = std::collections::HashSet::new();
        for index_id in &reachable_indexes {
            let index = self.get_index(index_id)?;
            for file_id in &index.files {
                if reachable_files.insert(file_id.clone()) {
                    let file = self.get_file(file_id, crypt)?;
                    for chunk_id in file.chunks {
                        reachable_chunks.insert(chunk_id);
                    }
                }
            }
        }

        let mut report = PurgeReport::default();

        let indexes_dir = self.root.join("indexes");
        if indexes_dir.exists() {
            for entry in std::fs::read_dir(&indexes_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                if !reachable_indexes.contains(&name) {
                    std::fs::remove_file(entry.path())?;
                    report.indexes_removed += 1;
                }
            }
        }

        let objects_dir = self.root.join("objects");
        if objects_dir.exists() {
            for prefix_entry in std::fs::read_dir(&objects_dir)? {
                let prefix_entry = prefix_entry?;
                if !prefix_entry.file_type()?.is_dir() {
                    continue;
                }
                let prefix = prefix_entry.file_name().to_string_lossy().to_string();
                for entry in std::fs::read_dir(prefix_entry.path())? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with('.') {
                        continue;
                    }
                    let id = format!("{prefix}{name}");
                    if !reachable_files.contains(&id) && !reachable_chunks.contains(&id) {
                        let len = entry.metadata()?.len();
                        std::fs::remove_file(entry.path())?;
                        report.objects_removed += 1;
                        report.bytes_freed += len as i64;
                    }
                }
            }
        }

        Ok(report)
    }

    fn reachable_index_ids(&self) -> Result<Vec<String>, Error> {
        let mut ids = Vec::new();
        if let Some(id) = self.latest_id()? {
            ids.push(id);
        }
        if let Some(id) = self.latest_sync_id()? {
            ids.push(id);
        }
        for tag in self.list_tags()? {
            if let Some(id) = self.tag(&tag)? {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub indexes_removed: u64,
    pub objects_removed: u64,
    pub bytes_freed: i64,
}

fn validate_tag_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0');
    if !valid {
        bail!("invalid tag name: {name:?}");
    }
    Ok(())
}
