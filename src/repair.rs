//! Missing-object report ingest, re-upload, and report rewrite (spec
//! §4.9, component I). Runs at most once per process lifetime, tracked
//! by a one-shot guard on the owning `Repo` rather than a global flag
//! (spec §9).
//!
//! Grounded on `src/server/pull.rs`'s `pull_index_chunks` pattern of
//! "stat locally, queue what's present, upload via a bounded pool,
//! track what's still missing."

use std::sync::{Arc, Mutex};

use anyhow::Error;

use crate::cloud::CloudBackend;
use crate::codec;
use crate::config::RepoConfig;
use crate::model::MissingObjectsReport;
use crate::parallel::ParallelHandler;
use crate::progress::{Context, Event};
use crate::store::Store;

const REPORT_KEY: &str = "check/indexes-report";

pub struct RepairResult {
    pub fixed: u64,
    pub still_missing: u64,
}

fn path_suffix(id: &str) -> String {
    format!("{}/{}", &id[0..2], &id[2..])
}

/// `uploadCloudMissingObjects`: downloads the side-band report, queues
/// locally-present objects for upload, and rewrites the report with the
/// updated `stillMissing` set and an incremented `fixCount`.
pub fn repair_missing_objects(
    store: &Store,
    backend: Arc<dyn CloudBackend>,
    config: &RepoConfig,
    ctx: &Context,
) -> Result<Option<RepairResult>, Error> {
    let raw = match backend.get_object(REPORT_KEY) {
        Ok(bytes) => bytes,
        Err(e) if crate::cloud::is_object_not_found(&e) => return Ok(None),
        Err(e) => return Err(e),
    };
    let json = codec::decode_plain(&raw)?;
    let report: MissingObjectsReport = serde_json::from_slice(&json)?;
    if report.missing_objects.is_empty() {
        return Ok(None);
    }

    let still_missing = Arc::new(Mutex::new(
        report
            .missing_objects
            .iter()
            .cloned()
            .collect::<std::collections::HashSet<_>>(),
    ));

    {
        let still_missing = Arc::clone(&still_missing);
        let store_root = store.root().to_path_buf();
        let backend = Arc::clone(&backend);
        let pool = ParallelHandler::new("repair-upload", config.repair_pool.max(1), move |id: String| {
            let abs = store_root.join("objects").join(path_suffix(&id));
            let bytes = match std::fs::read(&abs) {
                Ok(bytes) => bytes,
                Err(_) => return Ok(()), // absent locally: stays in stillMissing
            };
            backend.put_object(&format!("objects/{}", path_suffix(&id)), &bytes, false)?;
            still_missing.lock().unwrap().remove(&id);
            Ok(())
        });
        for id in &report.missing_objects {
            ctx.check_cancelled()?;
            pool.send(id.clone())?;
        }
        pool.complete()?;
    }

    let still_missing: Vec<String> = Arc::try_unwrap(still_missing)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default()
        .into_iter()
        .collect();
    let fixed = report.missing_objects.len() as u64 - still_missing.len() as u64;

    let new_report = MissingObjectsReport {
        missing_objects: still_missing.clone(),
        fix_count: report.fix_count + 1,
    };
    let new_json = serde_json::to_vec(&new_report)?;
    let encoded = codec::encode_plain(&new_json)?;
    backend.put_object(REPORT_KEY, &encoded, true)?;

    ctx.emit(Event::CloudAfterFixObjects { fixed });
    if !still_missing.is_empty() {
        ctx.emit(Event::CloudCorrupted {
            still_missing: still_missing.len() as u64,
        });
    }

    Ok(Some(RepairResult {
        fixed,
        still_missing: still_missing.len() as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::local::LocalCloudBackend;

    #[test]
    fn no_report_means_nothing_to_do() {
        let repo = tempfile::tempdir().unwrap();
        let cloud_dir = tempfile::tempdir().unwrap();
        let store = Store::new(repo.path().to_path_buf());
        let backend: Arc<dyn CloudBackend> =
            Arc::new(LocalCloudBackend::new(cloud_dir.path().to_path_buf(), "repo1"));
        backend.create_repo("repo1").unwrap();
        let config = RepoConfig::default();

        let result = repair_missing_objects(&store, backend, &config, &Context::none()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn present_objects_are_uploaded_and_report_rewritten() {
        let repo = tempfile::tempdir().unwrap();
        let cloud_dir = tempfile::tempdir().unwrap();
        let store = Store::new(repo.path().to_path_buf());
        let backend: Arc<dyn CloudBackend> =
            Arc::new(LocalCloudBackend::new(cloud_dir.path().to_path_buf(), "repo1"));
        backend.create_repo("repo1").unwrap();
        let config = RepoConfig::default();
        let crypt = codec::CryptConfig::new([1u8; 32]);

        let id = crate::model::chunk_id(b"payload");
        store.put_chunk(&id, b"payload", &crypt).unwrap();

        let report = MissingObjectsReport {
            missing_objects: vec![id.clone()],
            fix_count: 0,
        };
        let encoded = codec::encode_plain(&serde_json::to_vec(&report).unwrap()).unwrap();
        backend.put_object("check/indexes-report", &encoded, true).unwrap();

        let result = repair_missing_objects(&store, Arc::clone(&backend), &config, &Context::none())
            .unwrap()
            .unwrap();
        assert_eq!(result.fixed, 1);
        assert_eq!(result.still_missing, 0);
        assert!(backend
            .get_object(&format!("objects/{}/{}", &id[0..2], &id[2..]))
            .is_ok());
    }
}
