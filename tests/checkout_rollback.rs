//! Exercises `Repo::checkout` end-to-end: rolling a workspace back to an
//! earlier snapshot must restore edited/deleted files and remove files
//! that didn't exist in the target snapshot, then leave a further
//! checkout to the same target as a no-op.

use std::fs;
use std::sync::Arc;

use noteforge::cloud::local::LocalCloudBackend;
use noteforge::codec::CryptConfig;
use noteforge::progress::Context;
use noteforge::workspace::IgnoreRules;
use noteforge::Repo;

#[test]
fn checkout_restores_deleted_file_and_reverts_edit() {
    let workspace = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    let cloud_dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn noteforge::cloud::CloudBackend> =
        Arc::new(LocalCloudBackend::new(cloud_dir.path().to_path_buf(), "repo1"));
    backend.create_repo("repo1").unwrap();

    let a = workspace.path().join("a.md");
    let b = workspace.path().join("b.md");
    fs::write(&a, b"keep me stable").unwrap();
    fs::write(&b, b"will be deleted later").unwrap();

    let mut repo = Repo::open(
        repo_dir.path(),
        workspace.path().to_path_buf(),
        backend,
        CryptConfig::new([2u8; 32]),
        IgnoreRules::default(),
    )
    .unwrap();

    let snapshot_v1 = repo.index("v1: both files present", &Context::none()).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(5));
    fs::remove_file(&b).unwrap();
    fs::write(&a, b"edited after snapshot").unwrap();
    repo.index("v2: b removed, a edited", &Context::none()).unwrap();

    let result = repo.checkout(&snapshot_v1.id, &Context::none()).unwrap();
    assert!(result.upserts.contains(&"/a.md".to_string()));
    assert!(result.upserts.contains(&"/b.md".to_string()));
    assert_eq!(fs::read(&a).unwrap(), b"keep me stable");
    assert_eq!(fs::read(&b).unwrap(), b"will be deleted later");

    // A second checkout to the same snapshot should find nothing left to do.
    let noop = repo.checkout(&snapshot_v1.id, &Context::none()).unwrap();
    assert!(noop.upserts.is_empty());
    assert!(noop.removes.is_empty());
}

#[test]
fn checkout_to_empty_initial_snapshot_clears_the_workspace() {
    let workspace = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    let cloud_dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn noteforge::cloud::CloudBackend> =
        Arc::new(LocalCloudBackend::new(cloud_dir.path().to_path_buf(), "repo1"));
    backend.create_repo("repo1").unwrap();

    let mut repo = Repo::open(
        repo_dir.path(),
        workspace.path().to_path_buf(),
        backend,
        CryptConfig::new([2u8; 32]),
        IgnoreRules::default(),
    )
    .unwrap();

    // index() refuses an empty workspace, so seed one file, snapshot it,
    // then add a second file and check back out to the first (non-empty)
    // snapshot to confirm pruning of files absent from the target.
    fs::write(workspace.path().join("seed.md"), b"seed").unwrap();
    let seed_snapshot = repo.index("seed", &Context::none()).unwrap();

    fs::write(workspace.path().join("extra.md"), b"extra").unwrap();
    repo.index("plus extra", &Context::none()).unwrap();

    let result = repo.checkout(&seed_snapshot.id, &Context::none()).unwrap();
    assert_eq!(result.removes, vec!["/extra.md".to_string()]);
    assert!(!workspace.path().join("extra.md").exists());
    assert!(workspace.path().join("seed.md").exists());
}
