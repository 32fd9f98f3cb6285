//! Repository configuration: system identity, chunk bounds, pool sizes,
//! and lock/retry timings. Loaded from `<repo>/config.json`, falling
//! back to the spec's stated defaults for anything absent, so an
//! existing repo directory with no config file still opens (spec §9:
//! "implementers may expose them as tunables without changing
//! correctness").
//!
//! Grounded on the teacher's general preference for small `serde`
//! config structs loaded via `serde_json` rather than a bespoke parser.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Error};
use serde::{Deserialize, Serialize};

use crate::chunker::{DEFAULT_MAX, DEFAULT_MIN};
use crate::model::SystemIdentity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Identity of the device/process producing indexes (spec §3).
    pub system_id: String,
    pub system_name: String,
    pub system_os: String,

    /// Content-defined chunking bounds (spec §4.3).
    pub chunk_min_bytes: usize,
    pub chunk_max_bytes: usize,

    /// Worker pool sizes (spec §4.7, §5).
    pub sync_transfer_pool: usize,
    pub sync_validate_pool: usize,
    pub sync_refs_pool: usize,
    pub repair_pool: usize,

    /// Cloud lock timings, in milliseconds (spec §4.8).
    pub lock_stale_after_ms: i64,
    pub lock_refresh_interval_ms: i64,
    pub lock_retry_attempts: u32,
    pub lock_retry_backoff_ms: i64,

    /// Stale-local guard window (spec §4.7 step 8).
    pub stale_local_guard_ms: i64,

    /// `refs/latest` post-upload confirmation loop (spec §4.7 step 13).
    pub refs_confirm_attempts: u32,
    pub refs_confirm_pause_ms: i64,

    /// Indexer retry budget for `IndexFileChanged` (spec §4.4 step 5).
    pub index_retry_attempts: u32,

    /// Per-backend-call timeout (spec §5).
    pub backend_call_timeout_ms: i64,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            system_id: "unknown-device".into(),
            system_name: "unknown".into(),
            system_os: std::env::consts::OS.into(),

            chunk_min_bytes: DEFAULT_MIN,
            chunk_max_bytes: DEFAULT_MAX,

            sync_transfer_pool: 8,
            sync_validate_pool: 4,
            sync_refs_pool: 4,
            repair_pool: 8,

            lock_stale_after_ms: 65_000,
            lock_refresh_interval_ms: 30_000,
            lock_retry_attempts: 3,
            lock_retry_backoff_ms: 5_000,

            stale_local_guard_ms: 7 * 60 * 1000,

            refs_confirm_attempts: 32,
            refs_confirm_pause_ms: 256,

            index_retry_attempts: 7,

            backend_call_timeout_ms: 30_000,
        }
    }
}

impl RepoConfig {
    /// Loads `<repo>/config.json`, or returns the defaults if the file
    /// does not exist.
    pub fn load(repo_root: &Path) -> Result<Self, Error> {
        let path = repo_root.join("config.json");
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn save(&self, repo_root: &Path) -> Result<(), Error> {
        let path = repo_root.join("config.json");
        let bytes = serde_json::to_vec_pretty(self)?;
        crate::store::write_atomic(&path, &bytes)
    }

    pub fn system_identity(&self) -> SystemIdentity {
        SystemIdentity {
            id: self.system_id.clone(),
            name: self.system_name.clone(),
            os: self.system_os.clone(),
        }
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_millis(self.lock_stale_after_ms.max(0) as u64)
    }

    pub fn lock_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.lock_refresh_interval_ms.max(0) as u64)
    }

    pub fn lock_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms.max(0) as u64)
    }

    pub fn refs_confirm_pause(&self) -> Duration {
        Duration::from_millis(self.refs_confirm_pause_ms.max(0) as u64)
    }

    pub fn backend_call_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_call_timeout_ms.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = RepoConfig::default();
        assert_eq!(cfg.chunk_min_bytes, 512 * 1024);
        assert_eq!(cfg.chunk_max_bytes, 8 * 1024 * 1024);
        assert_eq!(cfg.sync_transfer_pool, 8);
        assert_eq!(cfg.lock_stale_after_ms, 65_000);
        assert_eq!(cfg.index_retry_attempts, 7);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.chunk_min_bytes, RepoConfig::default().chunk_min_bytes);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = RepoConfig::default();
        cfg.system_name = "test-device".into();
        cfg.save(dir.path()).unwrap();
        let loaded = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.system_name, "test-device");
    }
}
