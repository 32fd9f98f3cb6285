//! Three-way merge sync engine: the central state machine of spec §4.7
//! (component G). Reconciles the local latest snapshot, the last
//! synchronized snapshot (the sync base), and the remote latest
//! snapshot; detects conflicts; uploads/downloads objects; and advances
//! the remote `refs/latest` pointer under the cloud lock.
//!
//! Grounded on `src/server/pull.rs`'s overall shape (resolve remote
//! state, diff against what's local, pull missing objects through a
//! bounded pool, then reconcile) generalized here to a genuinely
//! bidirectional merge rather than one-way replication.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use crate::checkout::Checkout;
use crate::cloud::{self, CloudBackend, TrafficStat};
use crate::codec::{self, CryptConfig};
use crate::config::RepoConfig;
use crate::error::NoteforgeError;
use crate::indexer::Indexer;
use crate::lock::CloudLock;
use crate::model::{CheckFileEntry, CheckIndex, File, Index, IndexHeader, IndexRegistry};
use crate::parallel::ParallelHandler;
use crate::progress::{Context, Event};
use crate::store::Store;
use crate::workspace::IgnoreRules;

/// Well-known path of the workspace's own ignore file, mirrored at the
/// same path remotely so a newly-arrived ignore rule can be consulted
/// before it is even checked out locally (spec §4.7 step 10).
pub const IGNORE_FILE_PATH: &str = "/.noteforgeignore";

pub struct SyncResult {
    pub upserts: Vec<String>,
    pub removes: Vec<String>,
    pub conflicts: Vec<String>,
    pub traffic: TrafficStat,
    /// `false` when COMPARE found `R.id == L.id` and nothing else ran.
    pub merged: bool,
}

pub struct SyncEngine<'a> {
    pub store: &'a Store,
    pub backend: Arc<dyn CloudBackend>,
    pub crypt: &'a CryptConfig,
    pub config: &'a RepoConfig,
    pub device_id: String,
    pub workspace_root: std::path::PathBuf,
    pub history_root: std::path::PathBuf,
    /// One-shot guard: repair runs at most once per process (spec §9).
    pub repair_done: Arc<AtomicBool>,
}

impl<'a> SyncEngine<'a> {
    pub fn sync(&self, rules: &IgnoreRules, ctx: &Context) -> Result<SyncResult, Error> {
        ctx.emit(Event::CloudLock);
        let mut lock = CloudLock::new(Arc::clone(&self.backend), self.device_id.clone(), self.config);
        lock.try_lock()?;
        let result = self.sync_locked(rules, ctx);
        let _ = lock.unlock();
        ctx.emit(Event::CloudUnlock);
        result
    }

    fn sync_locked(&self, rules: &IgnoreRules, ctx: &Context) -> Result<SyncResult, Error> {
        let mut traffic = TrafficStat::default();

        let local = self.store.latest().map_err(|e| {
            let no_local = e
                .downcast_ref::<NoteforgeError>()
                .is_some_and(|e| matches!(e, NoteforgeError::NotFoundIndex));
            if no_local {
                anyhow::anyhow!("cannot sync: no local snapshot exists yet")
            } else {
                e
            }
        })?;

        let remote = self.fetch_remote_latest(&mut traffic)?;

        // COMPARE
        if let Some(remote) = &remote {
            if remote.id == local.id {
                return Ok(SyncResult {
                    upserts: vec![],
                    removes: vec![],
                    conflicts: vec![],
                    traffic,
                    merged: false,
                });
            }
        }

        // CAPACITY
        let available = self.backend.available_size()?;
        let ceiling = remote.as_ref().map(|r| r.size).unwrap_or(0).max(local.size);
        if available <= ceiling {
            bail!(NoteforgeError::CloudStorageSizeExceeded);
        }

        if let Some(remote) = &remote {
            self.download_files(remote, &mut traffic, ctx)?;
            self.download_chunks(remote, &mut traffic, ctx)?;
        }

        self.upload_new_files(&local, remote.as_ref(), &mut traffic, ctx)?;

        let base = self.store.latest_sync_id()?.map(|id| self.store.get_index(&id)).transpose()?;

        let base_files = match &base {
            Some(b) => self.load_files(&b.files)?,
            None => Vec::new(),
        };
        let local_files = self.load_files(&local.files)?;
        let (mut local_upserts, local_removes) = diff_by_path(&local_files, &base_files);

        let (mut cloud_upserts, cloud_removes) = match &remote {
            Some(r) => {
                let remote_files = self.load_files(&r.files)?;
                diff_by_path(&remote_files, &local_files)
            }
            None => (Vec::new(), Vec::new()),
        };

        // Stale-local guard (spec §4.7 step 8).
        let cloud_by_path: HashMap<&str, &File> =
            cloud_upserts.iter().map(|f| (f.path.as_str(), f)).collect();
        local_upserts.retain(|f| match cloud_by_path.get(f.path.as_str()) {
            Some(c) => c.updated <= f.updated + self.config.stale_local_guard_ms,
            None => true,
        });

        let local_upsert_paths: HashSet<&str> = local_upserts.iter().map(|f| f.path.as_str()).collect();
        let local_remove_paths: HashSet<&str> = local_removes.iter().map(|s| s.as_str()).collect();

        let mut merge_upserts = Vec::new();
        let mut merge_removes = Vec::new();
        let mut conflicts = Vec::new();

        cloud_upserts.retain(|c| !c.path.ends_with(".tmp"));
        for c in cloud_upserts {
            if let Some(local_conflict_updated) = local_upsert_paths.contains(c.path.as_str()).then(|| {
                local_upserts
                    .iter()
                    .find(|f| f.path == c.path)
                    .map(|f| f.updated)
                    .unwrap()
            }) {
                conflicts.push(c.clone());
                if c.updated > local_conflict_updated {
                    merge_upserts.push(c);
                }
                // else: local keeps its copy; cloud side preserved only as history.
            } else if local_remove_paths.contains(c.path.as_str()) {
                // local delete beats remote upsert
            } else {
                merge_upserts.push(c);
            }
        }
        for r in cloud_removes {
            if !local_upsert_paths.contains(r.as_str()) {
                merge_removes.push(r);
            }
        }

        // IGNORE-OVERRIDE (spec §4.7 step 10): a newly-ignored path must
        // not be deleted locally.
        if let Some(ignore_file) = merge_upserts.iter().find(|f| f.path == IGNORE_FILE_PATH) {
            let new_rules = self.load_ignore_rules(ignore_file)?;
            let mut kept = Vec::with_capacity(merge_removes.len());
            for path in merge_removes {
                if !new_rules.is_excluded(&path)? {
                    kept.push(path);
                }
            }
            merge_removes = kept;
        }

        if !conflicts.is_empty() {
            self.write_conflict_history(&conflicts, ctx)?;
        }

        let conflict_paths: Vec<String> = conflicts.iter().map(|f| f.path.clone()).collect();

        if merge_upserts.is_empty() && merge_removes.is_empty() {
            // Nothing to merge, but refs still need to converge if the
            // remote moved ahead of the (empty-diff) local state.
            self.update_cloud_refs(&local, remote.as_ref(), ctx)?;
            self.store.update_latest_sync(&local.id)?;
            return Ok(SyncResult {
                upserts: vec![],
                removes: vec![],
                conflicts: conflict_paths,
                traffic,
                merged: true,
            });
        }

        let checkout = Checkout::new(self.store, self.crypt);
        for file in &merge_upserts {
            checkout.apply_upsert(&self.workspace_root, file)?;
        }
        for path in &merge_removes {
            checkout.apply_remove(&self.workspace_root, path)?;
        }

        let indexer = Indexer {
            store: self.store,
            crypt: self.crypt,
            config: self.config,
        };
        let merged_index = indexer.index(&self.workspace_root, "Sync merge", rules, ctx)?;

        self.upload_new_files(&merged_index, remote.as_ref(), &mut traffic, ctx)?;
        self.update_cloud_refs(&merged_index, remote.as_ref(), ctx)?;
        self.store.update_latest_sync(&merged_index.id)?;

        Ok(SyncResult {
            upserts: merge_upserts.into_iter().map(|f| f.path).collect(),
            removes: merge_removes,
            conflicts: conflict_paths,
            traffic,
            merged: true,
        })
    }

    fn fetch_remote_latest(&self, traffic: &mut TrafficStat) -> Result<Option<Index>, Error> {
        match self.backend.get_object("refs/latest") {
            Ok(bytes) => {
                traffic.record_download(bytes.len());
                let id = String::from_utf8(bytes)?.trim().to_string();
                let raw = self.backend.get_object(&format!("indexes/{id}"))?;
                traffic.record_download(raw.len());
                let json = codec::decode_plain(&raw)?;
                Ok(Some(serde_json::from_slice(&json)?))
            }
            Err(e) if cloud::is_object_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn load_files(&self, ids: &[String]) -> Result<Vec<File>, Error> {
        ids.iter()
            .map(|id| self.store.get_file(id, self.crypt).map_err(escalate_to_repo_fatal))
            .collect()
    }

    fn download_files(&self, remote: &Index, traffic: &mut TrafficStat, ctx: &Context) -> Result<(), Error> {
        let missing: Vec<String> = remote
            .files
            .iter()
            .filter(|id| !self.store.stat_file(id))
            .cloned()
            .collect();

        let traffic_parts: Arc<Mutex<Vec<TrafficStat>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let store_root = self.store.root().to_path_buf();
            let crypt: CryptConfig = (*self.crypt).clone();
            let backend = Arc::clone(&self.backend);
            let traffic_parts = Arc::clone(&traffic_parts);
            let pool = ParallelHandler::new(
                "sync-download-files",
                self.config.sync_transfer_pool.max(1),
                move |id: String| {
                    let store = Store::new(store_root.clone());
                    let raw = backend.get_object(&format!("objects/{}/{}", &id[0..2], &id[2..]))?;
                    let json = codec::decode_encrypted(&raw, &crypt)?;
                    let file: File = serde_json::from_slice(&json)?;
                    store.put_file(&file, &crypt)?;
                    let mut part = TrafficStat::default();
                    part.record_download(raw.len());
                    traffic_parts.lock().unwrap().push(part);
                    Ok(())
                },
            );
            for id in &missing {
                ctx.check_cancelled()?;
                ctx.emit(Event::CloudBeforeDownloadFile { path: id.clone() });
                pool.send(id.clone())?;
            }
            pool.complete()?;
        }
        for part in traffic_parts.lock().unwrap().iter() {
            traffic.merge(part);
        }
        Ok(())
    }

    fn download_chunks(&self, remote: &Index, traffic: &mut TrafficStat, ctx: &Context) -> Result<(), Error> {
        let mut cloud_chunk_ids = HashSet::new();
        for file_id in &remote.files {
            let file = self.store.get_file(file_id, self.crypt).map_err(escalate_to_repo_fatal)?;
            cloud_chunk_ids.extend(file.chunks);
        }
        let missing: Vec<String> = cloud_chunk_ids
            .into_iter()
            .filter(|id| !self.store.stat_chunk(id))
            .collect();

        let traffic_parts: Arc<Mutex<Vec<TrafficStat>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let store_root = self.store.root().to_path_buf();
            let crypt: CryptConfig = (*self.crypt).clone();
            let backend = Arc::clone(&self.backend);
            let traffic_parts = Arc::clone(&traffic_parts);
            let pool = ParallelHandler::new(
                "sync-download-chunks",
                self.config.sync_transfer_pool.max(1),
                move |id: String| {
                    let store = Store::new(store_root.clone());
                    let raw = backend.get_object(&format!("objects/{}/{}", &id[0..2], &id[2..]))?;
                    let data = codec::decode_encrypted(&raw, &crypt)?;
                    store.put_chunk(&id, &data, &crypt)?;
                    let mut part = TrafficStat::default();
                    part.record_download(raw.len());
                    traffic_parts.lock().unwrap().push(part);
                    Ok(())
                },
            );
            for id in &missing {
                ctx.check_cancelled()?;
                pool.send(id.clone())?;
            }
            pool.complete()?;
        }
        for part in traffic_parts.lock().unwrap().iter() {
            traffic.merge(part);
        }
        Ok(())
    }

    /// UPLOAD (spec §4.7 step 7, reused for the post-merge upload at
    /// step 12.4): files present in `index` but not already in
    /// `remote.files` get their chunks and descriptor uploaded.
    fn upload_new_files(
        &self,
        index: &Index,
        remote: Option<&Index>,
        traffic: &mut TrafficStat,
        ctx: &Context,
    ) -> Result<(), Error> {
        let remote_has: HashSet<&str> = remote
            .map(|r| r.files.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default();
        let to_upload: Vec<String> = index
            .files
            .iter()
            .filter(|id| !remote_has.contains(id.as_str()))
            .cloned()
            .collect();
        if to_upload.is_empty() {
            return Ok(());
        }

        let mut all_chunk_ids = HashSet::new();
        let mut files = Vec::with_capacity(to_upload.len());
        for id in &to_upload {
            let file = self.store.get_file(id, self.crypt).map_err(escalate_to_repo_fatal)?;
            all_chunk_ids.extend(file.chunks.clone());
            files.push(file);
        }

        let not_present = self
            .backend
            .get_chunks_not_present(&all_chunk_ids.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_else(|_| all_chunk_ids.iter().cloned().collect());
        let not_present: HashSet<String> = not_present.into_iter().collect();

        let traffic_parts: Arc<Mutex<Vec<TrafficStat>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let store_root = self.store.root().to_path_buf();
            let crypt: CryptConfig = (*self.crypt).clone();
            let backend = Arc::clone(&self.backend);
            let traffic_parts = Arc::clone(&traffic_parts);
            let pool = ParallelHandler::new(
                "sync-upload-chunks",
                self.config.sync_transfer_pool.max(1),
                move |id: String| {
                    let store = Store::new(store_root.clone());
                    let raw = store.get_chunk(&id, &crypt).map_err(escalate_to_repo_fatal)?;
                    let encoded = codec::encode_encrypted(&raw, &crypt)?;
                    let written = backend.put_object(
                        &format!("objects/{}/{}", &id[0..2], &id[2..]),
                        &encoded,
                        false,
                    )?;
                    let mut part = TrafficStat::default();
                    part.record_upload(written);
                    traffic_parts.lock().unwrap().push(part);
                    Ok(())
                },
            );
            for id in &all_chunk_ids {
                if !not_present.contains(id) {
                    continue; // backend already has it; idempotent skip
                }
                ctx.check_cancelled()?;
                ctx.emit(Event::CloudBeforeUploadFile { path: id.clone() });
                pool.send(id.clone())?;
            }
            pool.complete()?;
        }

        for file in &files {
            let json = serde_json::to_vec(file)?;
            let encoded = codec::encode_encrypted(&json, self.crypt)?;
            let written = backend_put(&self.backend, &format!("objects/{}/{}", &file.id[0..2], &file.id[2..]), &encoded)?;
            traffic.record_upload(written);
        }
        for part in traffic_parts.lock().unwrap().iter() {
            traffic.merge(part);
        }
        Ok(())
    }

    fn load_ignore_rules(&self, ignore_file: &File) -> Result<IgnoreRules, Error> {
        let mut data = Vec::new();
        for chunk_id in &ignore_file.chunks {
            data.extend(self.store.get_chunk(chunk_id, self.crypt).map_err(escalate_to_repo_fatal)?);
        }
        let text = String::from_utf8_lossy(&data);
        Ok(IgnoreRules {
            host_excludes: Vec::new(),
            gitignore_lines: text.lines().map(|l| l.to_string()).collect(),
        })
    }

    fn write_conflict_history(&self, conflicts: &[File], ctx: &Context) -> Result<(), Error> {
        let ts = now_ms();
        let dir = self.history_root.join(format!("{ts}-sync"));
        for file in conflicts {
            ctx.check_cancelled()?;
            let dest = dir.join(file.path.trim_start_matches('/'));
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut data = Vec::new();
            for chunk_id in &file.chunks {
                data.extend(self.store.get_chunk(chunk_id, self.crypt).map_err(escalate_to_repo_fatal)?);
            }
            std::fs::write(&dest, &data).map_err(|_| NoteforgeError::CloudGenerateConflictHistory)?;
        }
        Ok(())
    }

    /// UPDATE_CLOUD_REFS (spec §4.7 step 13): four tasks bounded to the
    /// configured refs pool (default 4).
    fn update_cloud_refs(&self, new_index: &Index, captured_remote: Option<&Index>, ctx: &Context) -> Result<(), Error> {
        let captured_id = captured_remote.map(|r| r.id.clone());
        let errors: Mutex<Vec<Error>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                if let Err(e) = self.update_refs_latest(new_index, captured_id.as_deref(), ctx) {
                    errors.lock().unwrap().push(e);
                }
            });
            scope.spawn(|| {
                if let Err(e) = self.update_index_registry(new_index) {
                    errors.lock().unwrap().push(e);
                }
            });
            scope.spawn(|| {
                if let Err(e) = self.upload_check_index(new_index) {
                    errors.lock().unwrap().push(e);
                }
            });
            scope.spawn(|| {
                if self
                    .repair_done
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if let Err(e) =
                        crate::repair::repair_missing_objects(self.store, Arc::clone(&self.backend), self.config, ctx)
                    {
                        errors.lock().unwrap().push(e);
                    }
                }
            });
        });

        let mut errors = errors.into_inner().unwrap();
        if let Some(first) = errors.pop() {
            return Err(first);
        }
        Ok(())
    }

    fn update_refs_latest(&self, new_index: &Index, captured_id: Option<&str>, ctx: &Context) -> Result<(), Error> {
        let current = self.backend.get_object("refs/latest");
        let current_id = match current {
            Ok(bytes) => Some(String::from_utf8(bytes)?.trim().to_string()),
            Err(e) if cloud::is_object_not_found(&e) => None,
            Err(e) => return Err(e),
        };
        if current_id.as_deref() != captured_id {
            return Err(NoteforgeError::CloudIndexChanged.into());
        }

        let json = serde_json::to_vec(new_index)?;
        let encoded = codec::encode_plain(&json)?;
        self.backend
            .put_object(&format!("indexes/{}", new_index.id), &encoded, false)?;

        ctx.emit(Event::CloudBeforeUploadRef {
            path: "refs/latest".into(),
        });
        self.backend
            .put_object("refs/latest", new_index.id.as_bytes(), true)?;

        for _ in 0..self.config.refs_confirm_attempts {
            if let Ok(bytes) = self.backend.get_object("refs/latest") {
                if bytes == new_index.id.as_bytes() {
                    return Ok(());
                }
            }
            std::thread::sleep(self.config.refs_confirm_pause());
        }
        bail!(NoteforgeError::CloudCheckFailed)
    }

    fn update_index_registry(&self, new_index: &Index) -> Result<(), Error> {
        let mut registry = match self.backend.get_object("indexes-v2.json") {
            Ok(bytes) => {
                let json = codec::decode_plain(&bytes)?;
                serde_json::from_slice(&json)?
            }
            Err(e) if cloud::is_object_not_found(&e) => IndexRegistry::default(),
            Err(e) => return Err(e),
        };
        registry.prepend_dedup(IndexHeader {
            id: new_index.id.clone(),
            system_id: new_index.system_id.clone(),
            system_name: new_index.system_name.clone(),
            system_os: new_index.system_os.clone(),
        });
        let json = serde_json::to_vec(&registry)?;
        let encoded = codec::encode_plain(&json)?;
        self.backend.put_object("indexes-v2.json", &encoded, true)?;
        Ok(())
    }

    fn upload_check_index(&self, new_index: &Index) -> Result<(), Error> {
        let mut entries = Vec::with_capacity(new_index.files.len());
        for file_id in &new_index.files {
            let file = self.store.get_file(file_id, self.crypt).map_err(escalate_to_repo_fatal)?;
            entries.push(CheckFileEntry::from(&file));
        }
        let check = CheckIndex::new(new_index.id.clone(), entries);
        self.store.put_check_index(&check)?;
        let json = serde_json::to_vec(&check)?;
        let encoded = codec::encode_plain(&json)?;
        self.backend
            .put_object(&format!("check/indexes/{}", check.id), &encoded, false)?;
        Ok(())
    }
}

/// Escalates a genuine not-found on a local object read to `RepoFatal`
/// (spec §7: an `ErrNotExist` hit reading `objects/*` during sync, as
/// opposed to during indexing, means the store is corrupt and the
/// caller must reset the repo).
fn escalate_to_repo_fatal(e: Error) -> Error {
    let missing = e
        .downcast_ref::<NoteforgeError>()
        .is_some_and(|e| matches!(e, NoteforgeError::NotFoundObject(_)));
    if missing {
        NoteforgeError::RepoFatal.into()
    } else {
        e
    }
}

fn backend_put(backend: &Arc<dyn CloudBackend>, key: &str, bytes: &[u8]) -> Result<usize, Error> {
    backend.put_object(key, bytes, false)
}

fn diff_by_path(newer: &[File], older: &[File]) -> (Vec<File>, Vec<String>) {
    let older_by_path: HashMap<&str, &File> = older.iter().map(|f| (f.path.as_str(), f)).collect();
    let newer_by_path: HashSet<&str> = newer.iter().map(|f| f.path.as_str()).collect();

    let mut upserts = Vec::new();
    for f in newer {
        match older_by_path.get(f.path.as_str()) {
            Some(old) if old.size == f.size && old.updated == f.updated => {}
            _ => upserts.push(f.clone()),
        }
    }
    let removes: Vec<String> = older
        .iter()
        .filter(|f| !newer_by_path.contains(f.path.as_str()))
        .map(|f| f.path.clone())
        .collect();
    (upserts, removes)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_object_escalates_to_repo_fatal() {
        let e: Error = NoteforgeError::NotFoundObject("deadbeef".into()).into();
        let escalated = escalate_to_repo_fatal(e);
        let matched = escalated
            .downcast_ref::<NoteforgeError>()
            .is_some_and(|e| matches!(e, NoteforgeError::RepoFatal));
        assert!(matched, "expected RepoFatal, got {escalated:?}");
    }

    #[test]
    fn other_errors_pass_through_unescalated() {
        let e: Error = NoteforgeError::CloudIndexChanged.into();
        let escalated = escalate_to_repo_fatal(e);
        let matched = escalated
            .downcast_ref::<NoteforgeError>()
            .is_some_and(|e| matches!(e, NoteforgeError::CloudIndexChanged));
        assert!(matched, "expected CloudIndexChanged to pass through, got {escalated:?}");
    }
}
