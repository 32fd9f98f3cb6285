//! Cloud abstraction (spec §4.6, component F): a capability-set trait
//! over opaque string keys rooted at an implicit per-user, per-repo
//! prefix. Concrete backends (S3, WebDAV, vendor HTTP) are external
//! collaborators out of scope here; `local::LocalCloudBackend` is the
//! filesystem-backed stand-in used for tests and for single-machine
//! two-device simulations.
//!
//! Grounded on the teacher's "encode backend polymorphism as a
//! capability trait, inject the concrete implementation at construction,
//! no global registry" pattern (spec §9), mirrored from how
//! `pbs-datastore` keeps its store operations behind a narrow trait-like
//! surface rather than a god object.

pub mod local;

use anyhow::Error;

use crate::model::{Index, LockLease};

/// One entry returned by `list_repos`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoListing {
    pub name: String,
    pub size: i64,
    pub updated: i64,
}

/// One entry returned by `list_objects`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectListing {
    pub path: String,
    pub size: i64,
}

/// Traffic accounted into `TrafficStat` by the caller after each backend
/// call (spec §4.7 step 2, §9: "use per-worker local counters merged on
/// pool drain").
#[derive(Debug, Default, Clone, Copy)]
pub struct TrafficStat {
    pub download_bytes: i64,
    pub download_objects: u64,
    pub upload_bytes: i64,
    pub upload_objects: u64,
}

impl TrafficStat {
    pub fn merge(&mut self, other: &TrafficStat) {
        self.download_bytes += other.download_bytes;
        self.download_objects += other.download_objects;
        self.upload_bytes += other.upload_bytes;
        self.upload_objects += other.upload_objects;
    }

    pub fn record_download(&mut self, bytes: usize) {
        self.download_bytes += bytes as i64;
        self.download_objects += 1;
    }

    pub fn record_upload(&mut self, bytes: usize) {
        self.upload_bytes += bytes as i64;
        self.upload_objects += 1;
    }
}

/// The same capability set every backend exposes (spec §4.6). Blocking:
/// callers invoke it from worker-pool threads (`ParallelHandler`), not
/// from async tasks.
pub trait CloudBackend: Send + Sync {
    fn create_repo(&self, name: &str) -> Result<(), Error>;
    fn remove_repo(&self, name: &str) -> Result<(), Error>;
    fn list_repos(&self) -> Result<Vec<RepoListing>, Error>;

    /// Returns the number of bytes written. Fails with
    /// `CloudObjectNotFound`-adjacent errors only on transport/backend
    /// faults, not on "already exists" (spec §4.6, §7: "recover silently
    /// ... backend 'already exists' on upload").
    fn put_object(&self, key: &str, bytes: &[u8], overwrite: bool) -> Result<usize, Error>;

    /// Fails with `CloudObjectNotFound` on a 404-equivalent (spec §4.6).
    fn get_object(&self, key: &str) -> Result<Vec<u8>, Error>;

    /// Idempotent: removing an absent key is not an error (spec §4.6).
    fn remove_object(&self, key: &str) -> Result<(), Error>;

    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectListing>, Error>;

    /// Total bytes of storage still available to this repo (spec §4.6,
    /// §4.7 step 4 `CAPACITY`).
    fn available_size(&self) -> Result<i64, Error>;

    /// Of `ids`, returns the subset the backend can confirm are *not*
    /// already stored remotely — a dedup hint, not a guarantee (spec
    /// §4.7 step 7). Backends without this capability may return `ids`
    /// unchanged.
    fn get_chunks_not_present(&self, ids: &[String]) -> Result<Vec<String>, Error>;
}

/// Convenience read of `refs/latest` plus the index it points to,
/// layered on the raw `CloudBackend` (spec §4.6 `get_refs_and_files`,
/// §4.7 step 2). Returns `None` if `refs/latest` is absent.
pub fn get_remote_latest(backend: &dyn CloudBackend) -> Result<Option<Index>, Error> {
    match backend.get_object("refs/latest") {
        Ok(bytes) => {
            let id = String::from_utf8(bytes)?.trim().to_string();
            let raw = backend.get_object(&format!("indexes/{id}"))?;
            let json = crate::codec::decode_plain(&raw)?;
            Ok(Some(serde_json::from_slice(&json)?))
        }
        Err(e) => {
            if is_object_not_found(&e) {
                Ok(None)
            } else {
                Err(e)
            }
        }
    }
}

pub fn is_object_not_found(e: &Error) -> bool {
    e.downcast_ref::<crate::error::NoteforgeError>()
        .is_some_and(|e| matches!(e, crate::error::NoteforgeError::CloudObjectNotFound(_)))
}

pub fn get_lock_lease(backend: &dyn CloudBackend) -> Result<Option<LockLease>, Error> {
    match backend.get_object("lock-sync") {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(e) if is_object_not_found(&e) => Ok(None),
        Err(e) => Err(e),
    }
}
