//! Walks the workspace, diffs against the prior snapshot, chunks and
//! stores modified files, and emits a new snapshot index (spec §4.4,
//! component D).
//!
//! Grounded on `src/server/pull.rs`'s `pull_index_chunks` for the
//! "validate previously-known objects under a bounded pool, fail fast on
//! `ErrNotExist`" shape, adapted here to validating the *previous*
//! snapshot's chunks before diffing rather than chunks freshly pulled
//! from a remote.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Error;

use crate::chunker;
use crate::codec::CryptConfig;
use crate::config::RepoConfig;
use crate::error::NoteforgeError;
use crate::model::{chunk_id, File, Index};
use crate::parallel::ParallelHandler;
use crate::progress::{Context, Event};
use crate::store::{ObjectPresence, Store};
use crate::workspace::{self, IgnoreRules, WorkspaceEntry};

pub struct Indexer<'a> {
    pub store: &'a Store,
    pub crypt: &'a CryptConfig,
    pub config: &'a RepoConfig,
}

impl<'a> Indexer<'a> {
    /// `index(memo, context) -> Index` with the outer `IndexFileChanged`
    /// retry loop (spec §4.4 step 5: "the outer driver retries the whole
    /// index operation up to seven times before giving up").
    pub fn index(
        &self,
        workspace_root: &Path,
        memo: &str,
        rules: &IgnoreRules,
        ctx: &Context,
    ) -> Result<Index, Error> {
        let mut attempts = 0;
        loop {
            match self.index_attempt(workspace_root, memo, rules, ctx) {
                Ok(index) => return Ok(index),
                Err(e) => {
                    attempts += 1;
                    let is_file_changed = e.downcast_ref::<NoteforgeError>().is_some_and(|e| {
                        matches!(e, NoteforgeError::IndexFileChanged(_))
                    });
                    if is_file_changed && attempts < self.config.index_retry_attempts {
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn index_attempt(
        &self,
        workspace_root: &Path,
        memo: &str,
        rules: &IgnoreRules,
        ctx: &Context,
    ) -> Result<Index, Error> {
        let entries = workspace::walk(workspace_root, rules)?;
        if entries.is_empty() {
            return Err(NoteforgeError::IndexEmpty.into());
        }
        ctx.emit(Event::IndexWalkData {
            count: entries.len() as u64,
            total: entries.len() as u64,
        });

        let previous = match self.store.latest() {
            Ok(index) => Some(index),
            Err(e) => {
                let not_found = e
                    .downcast_ref::<NoteforgeError>()
                    .is_some_and(|e| matches!(e, NoteforgeError::NotFoundIndex));
                if not_found {
                    None
                } else {
                    return Err(e);
                }
            }
        };

        let previous_files = match &previous {
            Some(index) => self.load_and_validate(index)?,
            None => Vec::new(),
        };

        let by_path: std::collections::HashMap<&str, &WorkspaceEntry> =
            entries.iter().map(|e| (e.path.as_str(), e)).collect();
        let prev_by_path: std::collections::HashMap<&str, &File> =
            previous_files.iter().map(|f| (f.path.as_str(), f)).collect();

        let mut upserts = Vec::new();
        for entry in &entries {
            match prev_by_path.get(entry.path.as_str()) {
                Some(prev) if prev.size == entry.size && prev.updated == entry.updated => {}
                _ => upserts.push(entry.clone()),
            }
        }
        let removed_paths: Vec<&str> = prev_by_path
            .keys()
            .filter(|p| !by_path.contains_key(*p))
            .copied()
            .collect();

        if upserts.is_empty() && removed_paths.is_empty() {
            if let Some(previous) = previous {
                return Ok(previous);
            }
        }

        let mut new_files: Vec<File> = previous_files
            .into_iter()
            .filter(|f| by_path.contains_key(f.path.as_str()) && !upsert_paths(&upserts).contains(f.path.as_str()))
            .collect();

        for entry in &upserts {
            ctx.check_cancelled()?;
            ctx.emit(Event::IndexUpsertFile {
                path: entry.path.clone(),
            });
            let file = self.ingest_file(workspace_root, entry)?;
            new_files.push(file);
        }

        let files: Vec<String> = new_files.iter().map(|f| f.id.clone()).collect();
        let sizes: Vec<i64> = new_files.iter().map(|f| f.size).collect();
        let system = self.config.system_identity();
        let now = now_ms();
        let index = Index::new(memo.to_string(), now, files, &sizes, &system);
        self.store.update_latest(&index)?;
        Ok(index)
    }

    /// Step 3: for each file in the previous snapshot, fetch its
    /// descriptor and stat every referenced chunk. Missing-with-NotExist
    /// is fatal; the caller must rebuild from scratch. A permission
    /// error on the descriptor or a chunk is not fatal: loosen the
    /// object's permissions and carry on.
    fn load_and_validate(&self, previous: &Index) -> Result<Vec<File>, Error> {
        let results: Arc<Mutex<Vec<File>>> = Arc::new(Mutex::new(Vec::new()));
        let results_for_pool = Arc::clone(&results);
        let crypt: CryptConfig = (*self.crypt).clone();

        {
            let store_root = self.store.root().to_path_buf();
            let pool = ParallelHandler::new(
                "index-validate",
                self.config.sync_validate_pool.max(1),
                move |file_id: String| {
                    let store = Store::new(store_root.clone());
                    let file = load_descriptor(&store, &file_id, &crypt)?;
                    for chunk in &file.chunks {
                        match store.chunk_presence(chunk) {
                            ObjectPresence::Present => {}
                            ObjectPresence::PermissionDenied => {
                                store.relax_permissions(chunk)?;
                            }
                            ObjectPresence::Missing => {
                                return Err(NoteforgeError::IndexFatalMissingObject.into());
                            }
                        }
                    }
                    results_for_pool.lock().unwrap().push(file);
                    Ok(())
                },
            );
            for file_id in &previous.files {
                pool.send(file_id.clone())?;
            }
            pool.complete()?;
        }

        Ok(Arc::try_unwrap(results).unwrap().into_inner().unwrap())
    }

    /// Step 5: chunk the file, put each chunk, then put the file
    /// descriptor. Re-stats the file after reading; a change mid-read
    /// fails this file with `IndexFileChanged`.
    fn ingest_file(&self, workspace_root: &Path, entry: &WorkspaceEntry) -> Result<File, Error> {
        let abs_path = workspace::resolve(workspace_root, &entry.path);
        let data = std::fs::read(&abs_path)?;

        let restat = std::fs::metadata(&abs_path)?;
        let restat_size = restat.len() as i64;
        let restat_updated = restat
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        if restat_size != entry.size || restat_updated != entry.updated {
            return Err(NoteforgeError::IndexFileChanged(entry.path.clone()).into());
        }

        let chunk_ids = if data.len() < self.config.chunk_min_bytes {
            let id = chunk_id(&data);
            self.store.put_chunk(&id, &data, self.crypt)?;
            vec![id]
        } else {
            let pieces =
                chunker::chunk_bytes(&data, self.config.chunk_min_bytes, self.config.chunk_max_bytes)?;
            let mut ids = Vec::with_capacity(pieces.len());
            for piece in pieces {
                let id = chunk_id(piece);
                self.store.put_chunk(&id, piece, self.crypt)?;
                ids.push(id);
            }
            ids
        };

        let file = File::new(entry.path.clone(), entry.size, entry.updated, chunk_ids);
        self.store.put_file(&file, self.crypt)?;
        Ok(file)
    }
}

/// Fetches a file descriptor, retrying once after a chmod if the first
/// read hit a permission error. Any other failure (including a
/// permission error that persists after the chmod) is fatal.
fn load_descriptor(store: &Store, file_id: &str, crypt: &CryptConfig) -> Result<File, Error> {
    match store.get_file(file_id, crypt) {
        Ok(file) => Ok(file),
        Err(e) if is_permission_denied(&e) => {
            store.relax_permissions(file_id)?;
            store
                .get_file(file_id, crypt)
                .map_err(|_| NoteforgeError::IndexFatalMissingObject.into())
        }
        Err(_) => Err(NoteforgeError::IndexFatalMissingObject.into()),
    }
}

fn is_permission_denied(e: &Error) -> bool {
    e.downcast_ref::<NoteforgeError>()
        .is_some_and(|e| matches!(e, NoteforgeError::ObjectPermissionDenied(_)))
}

fn upsert_paths(upserts: &[WorkspaceEntry]) -> std::collections::HashSet<&str> {
    upserts.iter().map(|e| e.path.as_str()).collect()
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
    use std::fs;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, RepoConfig, CryptConfig) {
        let workspace = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        let config = RepoConfig::default();
        let crypt = CryptConfig::new([3u8; 32]);
        (workspace, repo, config, crypt)
    }

    #[test]
    fn fresh_init_produces_expected_snapshot() {
        let (workspace, repo, config, crypt) = setup();
        fs::write(workspace.path().join("a.md"), b"hello").unwrap();

        let store = Store::new(repo.path().to_path_buf());
        let indexer = Indexer {
            store: &store,
            crypt: &crypt,
            config: &config,
        };
        let index = indexer
            .index(
                workspace.path(),
                "init",
                &IgnoreRules::default(),
                &Context::none(),
            )
            .unwrap();

        assert_eq!(index.count, 1);
        assert_eq!(index.size, 5);
        assert_eq!(store.latest_id().unwrap().as_deref(), Some(index.id.as_str()));
    }

    #[test]
    fn empty_workspace_fails() {
        let (workspace, repo, config, crypt) = setup();
        let store = Store::new(repo.path().to_path_buf());
        let indexer = Indexer {
            store: &store,
            crypt: &crypt,
            config: &config,
        };
        let err = indexer.index(workspace.path(), "init", &IgnoreRules::default(), &Context::none());
        assert!(err.is_err());
    }

    #[test]
    fn idempotent_reindex_returns_same_snapshot() {
        let (workspace, repo, config, crypt) = setup();
        fs::write(workspace.path().join("a.md"), b"hello").unwrap();
        let store = Store::new(repo.path().to_path_buf());
        let indexer = Indexer {
            store: &store,
            crypt: &crypt,
            config: &config,
        };
        let first = indexer
            .index(workspace.path(), "init", &IgnoreRules::default(), &Context::none())
            .unwrap();
        let second = indexer
            .index(workspace.path(), "noop", &IgnoreRules::default(), &Context::none())
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn modify_and_reindex_produces_new_snapshot() {
        let (workspace, repo, config, crypt) = setup();
        fs::write(workspace.path().join("a.md"), b"hello").unwrap();
        let store = Store::new(repo.path().to_path_buf());
        let indexer = Indexer {
            store: &store,
            crypt: &crypt,
            config: &config,
        };
        let first = indexer
            .index(workspace.path(), "init", &IgnoreRules::default(), &Context::none())
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        fs::write(workspace.path().join("a.md"), b"hello world").unwrap();
        let second = indexer
            .index(workspace.path(), "v2", &IgnoreRules::default(), &Context::none())
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.size, 11);
    }

    #[test]
    fn permission_denied_chunk_is_recovered_not_treated_as_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let (workspace, repo, config, crypt) = setup();
        fs::write(workspace.path().join("a.md"), b"hello").unwrap();
        let store = Store::new(repo.path().to_path_buf());
        let indexer = Indexer {
            store: &store,
            crypt: &crypt,
            config: &config,
        };
        let first = indexer
            .index(workspace.path(), "init", &IgnoreRules::default(), &Context::none())
            .unwrap();

        let chunk_id = crate::model::chunk_id(b"hello");
        let chunk_path = repo
            .path()
            .join("objects")
            .join(&chunk_id[0..2])
            .join(&chunk_id[2..]);
        std::fs::set_permissions(&chunk_path, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Reindexing with the workspace unchanged still walks
        // `load_and_validate` over the previous snapshot's chunks; a
        // permission error there must not be fatal.
        let second = indexer
            .index(workspace.path(), "noop", &IgnoreRules::default(), &Context::none())
            .unwrap();
        assert_eq!(first.id, second.id);

        let mode = std::fs::metadata(&chunk_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644, "chunk permissions should have been relaxed");
    }
}
