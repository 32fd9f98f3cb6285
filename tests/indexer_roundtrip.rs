//! Exercises `Repo::index` end-to-end against a real temp workspace,
//! covering the scenarios a single-device user hits before ever syncing:
//! fresh init, a no-op reindex, an edit, and a delete.

use std::fs;
use std::sync::Arc;

use noteforge::cloud::local::LocalCloudBackend;
use noteforge::codec::CryptConfig;
use noteforge::progress::Context;
use noteforge::workspace::IgnoreRules;
use noteforge::Repo;

fn open_repo(workspace: &std::path::Path, repo_dir: &std::path::Path, cloud_dir: &std::path::Path) -> Repo {
    let backend: Arc<dyn noteforge::cloud::CloudBackend> =
        Arc::new(LocalCloudBackend::new(cloud_dir.to_path_buf(), "repo1"));
    backend.create_repo("repo1").unwrap();
    Repo::open(
        repo_dir,
        workspace.to_path_buf(),
        backend,
        CryptConfig::new([7u8; 32]),
        IgnoreRules::default(),
    )
    .unwrap()
}

#[test]
fn fresh_workspace_indexes_every_file_once() {
    let workspace = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    let cloud_dir = tempfile::tempdir().unwrap();

    fs::write(workspace.path().join("notes.md"), b"first draft").unwrap();
    fs::create_dir(workspace.path().join("sub")).unwrap();
    fs::write(workspace.path().join("sub").join("todo.md"), b"- [ ] write tests").unwrap();

    let mut repo = open_repo(workspace.path(), repo_dir.path(), cloud_dir.path());
    let index = repo.index("initial snapshot", &Context::none()).unwrap();

    assert_eq!(index.count, 2);
    assert_eq!(index.size, "first draft".len() as i64 + "- [ ] write tests".len() as i64);
}

#[test]
fn reindexing_without_changes_returns_the_same_snapshot_id() {
    let workspace = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    let cloud_dir = tempfile::tempdir().unwrap();
    fs::write(workspace.path().join("a.md"), b"stable content").unwrap();

    let mut repo = open_repo(workspace.path(), repo_dir.path(), cloud_dir.path());
    let first = repo.index("init", &Context::none()).unwrap();
    let second = repo.index("noop", &Context::none()).unwrap();

    assert_eq!(first.id, second.id);
}

#[test]
fn editing_then_deleting_a_file_produces_successive_distinct_snapshots() {
    let workspace = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    let cloud_dir = tempfile::tempdir().unwrap();
    let path = workspace.path().join("a.md");
    fs::write(&path, b"v1").unwrap();
    // Kept untouched throughout: without it the workspace would go empty
    // once a.md is deleted, and index() correctly refuses to snapshot an
    // empty workspace (IndexEmpty) rather than producing a 0-file one.
    fs::write(workspace.path().join("b.md"), b"untouched").unwrap();

    let mut repo = open_repo(workspace.path(), repo_dir.path(), cloud_dir.path());
    let v1 = repo.index("v1", &Context::none()).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(5));
    fs::write(&path, b"v2 with more text").unwrap();
    let v2 = repo.index("v2", &Context::none()).unwrap();
    assert_ne!(v1.id, v2.id);
    assert_eq!(v2.count, 2);

    fs::remove_file(&path).unwrap();
    let v3 = repo.index("v3", &Context::none()).unwrap();
    assert_ne!(v2.id, v3.id);
    assert_eq!(v3.count, 1);
}
