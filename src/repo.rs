//! `Repo`: the single entry point a caller actually constructs, wiring
//! the local store, the cloud backend, and the repository config
//! together behind one exclusive handle (spec §9: "a single-process,
//! single-workspace exclusivity guarantee is enough; don't build a lock
//! manager for concurrent callers within one process").
//!
//! Every public operation takes `&mut self` so the type system enforces
//! that exclusivity rather than an internal mutex: two overlapping
//! `index()`/`checkout()`/`sync()` calls on the same `Repo` simply don't
//! type-check.
//!
//! Grounded on the teacher's top-level `BackupRepository`-style facade
//! that owns a `ChunkStore` plus a remote client and exposes one method
//! per operation, rather than handing the pieces to the caller loose.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Error;

use crate::checkout::{Checkout, CheckoutResult};
use crate::cloud::CloudBackend;
use crate::codec::CryptConfig;
use crate::config::RepoConfig;
use crate::indexer::Indexer;
use crate::model::Index;
use crate::progress::Context;
use crate::store::{PurgeReport, Store};
use crate::sync::{SyncEngine, SyncResult};
use crate::workspace::IgnoreRules;

/// Subdirectory (alongside the workspace by default) holding conflict
/// history copies written during a merge (spec §4.7 step 11).
const HISTORY_DIR: &str = ".noteforge/history";

pub struct Repo {
    store: Store,
    crypt: CryptConfig,
    config: RepoConfig,
    backend: Arc<dyn CloudBackend>,
    workspace_root: PathBuf,
    history_root: PathBuf,
    device_id: String,
    rules: IgnoreRules,
    repair_done: Arc<AtomicBool>,
}

impl Repo {
    /// Opens (or initializes) a repo rooted at `repo_root`, tracking the
    /// workspace at `workspace_root`. `repo_root/config.json` is read if
    /// present, else the spec's defaults are used and persisted.
    pub fn open(
        repo_root: &Path,
        workspace_root: PathBuf,
        backend: Arc<dyn CloudBackend>,
        crypt: CryptConfig,
        rules: IgnoreRules,
    ) -> Result<Self, Error> {
        let config = RepoConfig::load(repo_root)?;
        config.save(repo_root)?;
        let device_id = config.system_id.clone();
        let history_root = workspace_root.join(HISTORY_DIR);

        Ok(Self {
            store: Store::new(repo_root.to_path_buf()),
            crypt,
            config,
            backend,
            workspace_root,
            history_root,
            device_id,
            rules,
            repair_done: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Walks the workspace and produces a new snapshot (spec §4.4).
    pub fn index(&mut self, memo: &str, ctx: &Context) -> Result<Index, Error> {
        let indexer = Indexer {
            store: &self.store,
            crypt: &self.crypt,
            config: &self.config,
        };
        indexer.index(&self.workspace_root, memo, &self.rules, ctx)
    }

    /// Materializes `index_id` into the workspace (spec §4.5).
    pub fn checkout(&mut self, index_id: &str, ctx: &Context) -> Result<CheckoutResult, Error> {
        let checkout = Checkout::new(&self.store, &self.crypt);
        checkout.checkout(&self.workspace_root, index_id, &self.rules, ctx)
    }

    /// Runs one full three-way-merge sync cycle against the cloud
    /// backend (spec §4.7).
    pub fn sync(&mut self, ctx: &Context) -> Result<SyncResult, Error> {
        std::fs::create_dir_all(&self.history_root)?;
        let engine = SyncEngine {
            store: &self.store,
            backend: Arc::clone(&self.backend),
            crypt: &self.crypt,
            config: &self.config,
            device_id: self.device_id.clone(),
            workspace_root: self.workspace_root.clone(),
            history_root: self.history_root.clone(),
            repair_done: Arc::clone(&self.repair_done),
        };
        engine.sync(&self.rules, ctx)
    }

    /// Reclaims local objects unreachable from any ref or tag (spec
    /// §4.2 `Purge`). Not part of the sync cycle; run on demand.
    pub fn purge(&mut self) -> Result<PurgeReport, Error> {
        self.store.purge(&self.crypt)
    }

    /// Wipes local store state after a `RepoFatal` error (spec §7:
    /// "caller must reset the repo"). The next `Sync` redownloads
    /// everything the cloud side still has; `Index`/`Checkout` see an
    /// empty local history until then. Also clears the one-shot repair
    /// guard so a post-reset sync may run the missing-object repair pass
    /// again.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.store.reset()?;
        self.repair_done.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    /// Creates a fresh, empty cloud repo named `name` (spec §9 entry
    /// points; delegates to `CloudBackend::create_repo`).
    pub fn create_cloud_repo(&mut self, name: &str) -> Result<(), Error> {
        self.backend.create_repo(name)
    }

    /// Removes the cloud repo named `name` and everything stored under
    /// it (spec §9 entry points; delegates to
    /// `CloudBackend::remove_repo`).
    pub fn remove_cloud_repo(&mut self, name: &str) -> Result<(), Error> {
        self.backend.remove_repo(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::local::LocalCloudBackend;

    #[test]
    fn index_then_checkout_round_trips() {
        let repo_dir = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let cloud_dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn CloudBackend> =
            Arc::new(LocalCloudBackend::new(cloud_dir.path().to_path_buf(), "repo1"));
        backend.create_repo("repo1").unwrap();

        std::fs::write(workspace.path().join("a.md"), b"hello").unwrap();

        let mut repo = Repo::open(
            repo_dir.path(),
            workspace.path().to_path_buf(),
            backend,
            CryptConfig::new([4u8; 32]),
            IgnoreRules::default(),
        )
        .unwrap();

        let index = repo.index("init", &Context::none()).unwrap();
        assert_eq!(index.count, 1);

        std::fs::write(workspace.path().join("b.md"), b"world").unwrap();
        let index2 = repo.index("v2", &Context::none()).unwrap();
        assert_eq!(index2.count, 2);

        let result = repo.checkout(&index.id, &Context::none()).unwrap();
        assert_eq!(result.removes, vec!["/b.md".to_string()]);
        assert!(!workspace.path().join("b.md").exists());
        assert!(workspace.path().join("a.md").exists());
    }

    #[test]
    fn reset_clears_local_history() {
        let repo_dir = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let cloud_dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn CloudBackend> =
            Arc::new(LocalCloudBackend::new(cloud_dir.path().to_path_buf(), "repo1"));
        backend.create_repo("repo1").unwrap();

        std::fs::write(workspace.path().join("a.md"), b"hello").unwrap();

        let mut repo = Repo::open(
            repo_dir.path(),
            workspace.path().to_path_buf(),
            backend,
            CryptConfig::new([4u8; 32]),
            IgnoreRules::default(),
        )
        .unwrap();
        repo.index("init", &Context::none()).unwrap();

        repo.reset().unwrap();

        let err = repo.index("after-reset", &Context::none());
        assert!(err.is_ok(), "reindexing after reset should rebuild from scratch");
        let rebuilt = err.unwrap();
        assert_eq!(rebuilt.count, 1);
    }

    #[test]
    fn create_and_remove_cloud_repo_delegate_to_backend() {
        let repo_dir = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let cloud_dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn CloudBackend> =
            Arc::new(LocalCloudBackend::new(cloud_dir.path().to_path_buf(), "repo1"));
        backend.create_repo("repo1").unwrap();

        let mut repo = Repo::open(
            repo_dir.path(),
            workspace.path().to_path_buf(),
            Arc::clone(&backend),
            CryptConfig::new([4u8; 32]),
            IgnoreRules::default(),
        )
        .unwrap();

        repo.create_cloud_repo("repo2").unwrap();
        assert!(backend.list_repos().unwrap().iter().any(|r| r.name == "repo2"));

        repo.remove_cloud_repo("repo2").unwrap();
        assert!(!backend.list_repos().unwrap().iter().any(|r| r.name == "repo2"));
    }
}
