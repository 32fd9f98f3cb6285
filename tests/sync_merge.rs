//! Two-device merge scenarios driven entirely through `Repo::sync`
//! against a `LocalCloudBackend` shared by both "devices" (distinct repo
//! and workspace directories, same cloud root and repo name), matching
//! the in-repo stand-in for the real backend described for this sync
//! engine.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use noteforge::cloud::local::LocalCloudBackend;
use noteforge::cloud::CloudBackend;
use noteforge::codec::CryptConfig;
use noteforge::progress::Context;
use noteforge::workspace::IgnoreRules;
use noteforge::Repo;

const SHARED_KEY: [u8; 32] = [5u8; 32];

fn open_device(workspace: &Path, repo_dir: &Path, cloud_dir: &Path) -> Repo {
    let backend: Arc<dyn CloudBackend> =
        Arc::new(LocalCloudBackend::new(cloud_dir.to_path_buf(), "shared"));
    backend.create_repo("shared").unwrap();
    Repo::open(
        repo_dir,
        workspace.to_path_buf(),
        backend,
        CryptConfig::new(SHARED_KEY),
        IgnoreRules::default(),
    )
    .unwrap()
}

#[test]
fn second_device_pulls_first_devices_file_on_first_sync() {
    let cloud_dir = tempfile::tempdir().unwrap();

    let workspace_a = tempfile::tempdir().unwrap();
    let repo_a = tempfile::tempdir().unwrap();
    fs::write(workspace_a.path().join("shared.md"), b"from device A").unwrap();
    let mut device_a = open_device(workspace_a.path(), repo_a.path(), cloud_dir.path());
    device_a.index("A: initial", &Context::none()).unwrap();
    let sync_a = device_a.sync(&Context::none()).unwrap();
    assert!(sync_a.merged);

    let workspace_b = tempfile::tempdir().unwrap();
    let repo_b = tempfile::tempdir().unwrap();
    fs::write(workspace_b.path().join("local-only.md"), b"from device B").unwrap();
    let mut device_b = open_device(workspace_b.path(), repo_b.path(), cloud_dir.path());
    device_b.index("B: initial", &Context::none()).unwrap();
    let sync_b = device_b.sync(&Context::none()).unwrap();

    assert!(sync_b.merged);
    assert!(sync_b.upserts.contains(&"/shared.md".to_string()));
    assert!(sync_b.conflicts.is_empty());
    assert_eq!(
        fs::read(workspace_b.path().join("shared.md")).unwrap(),
        b"from device A"
    );
    assert!(workspace_b.path().join("local-only.md").exists());
}

#[test]
fn concurrent_edits_to_the_same_path_are_reported_as_a_conflict() {
    let cloud_dir = tempfile::tempdir().unwrap();

    // Establish a common base: A publishes shared.md, then B pulls it in
    // via its own first sync, so both devices start from the same
    // file-descriptor id for shared.md.
    let workspace_a = tempfile::tempdir().unwrap();
    let repo_a = tempfile::tempdir().unwrap();
    let shared_path_a = workspace_a.path().join("shared.md");
    fs::write(&shared_path_a, b"v1").unwrap();
    let mut device_a = open_device(workspace_a.path(), repo_a.path(), cloud_dir.path());
    device_a.index("A: v1", &Context::none()).unwrap();
    device_a.sync(&Context::none()).unwrap();

    let workspace_b = tempfile::tempdir().unwrap();
    let repo_b = tempfile::tempdir().unwrap();
    fs::write(workspace_b.path().join("other.md"), b"B's own file").unwrap();
    let mut device_b = open_device(workspace_b.path(), repo_b.path(), cloud_dir.path());
    device_b.index("B: initial", &Context::none()).unwrap();
    device_b.sync(&Context::none()).unwrap();
    assert_eq!(fs::read(workspace_b.path().join("shared.md")).unwrap(), b"v1");

    // A advances shared.md and publishes it.
    std::thread::sleep(Duration::from_millis(5));
    fs::write(&shared_path_a, b"v2 from A").unwrap();
    device_a.index("A: v2", &Context::none()).unwrap();
    device_a.sync(&Context::none()).unwrap();

    // B, unaware of A's edit, makes its own conflicting edit and syncs.
    std::thread::sleep(Duration::from_millis(5));
    fs::write(workspace_b.path().join("shared.md"), b"v2 from B").unwrap();
    device_b.index("B: v2", &Context::none()).unwrap();
    let sync_b = device_b.sync(&Context::none()).unwrap();

    assert!(sync_b.conflicts.contains(&"/shared.md".to_string()));

    // The losing side's content is preserved under conflict history
    // somewhere beneath B's workspace.
    let history_root = workspace_b.path().join(".noteforge/history");
    assert!(history_root.exists());
    let mut found = false;
    for entry in walkdir::WalkDir::new(&history_root) {
        let entry = entry.unwrap();
        if entry.file_name() == "shared.md" {
            found = true;
        }
    }
    assert!(found, "expected a conflict-history copy of shared.md under {:?}", history_root);
}

#[test]
fn resyncing_with_no_intervening_changes_is_a_cheap_no_op() {
    let cloud_dir = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let repo_dir = tempfile::tempdir().unwrap();
    fs::write(workspace.path().join("a.md"), b"content").unwrap();

    let mut device = open_device(workspace.path(), repo_dir.path(), cloud_dir.path());
    device.index("init", &Context::none()).unwrap();
    device.sync(&Context::none()).unwrap();

    let second = device.sync(&Context::none()).unwrap();
    assert!(!second.merged);
    assert!(second.upserts.is_empty());
    assert!(second.removes.is_empty());
}
