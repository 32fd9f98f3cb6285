//! Remote mutual exclusion: a lease object at key `lock-sync` (spec
//! §4.8, component H). One device holds the lock at a time; a stale
//! lease (unrefreshed past `lock_stale_after`) is fair game for the next
//! acquirer.
//!
//! Grounded on `src/tools/parallel_handler.rs`'s background-worker
//! lifecycle (spawn on acquire, signal-and-join on release) applied here
//! to a single periodic refresher thread instead of a pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Error;

use crate::cloud::{get_lock_lease, CloudBackend};
use crate::config::RepoConfig;
use crate::error::NoteforgeError;
use crate::model::LockLease;

pub struct CloudLock {
    backend: Arc<dyn CloudBackend>,
    device_id: String,
    stale_after_ms: i64,
    retry_attempts: u32,
    retry_backoff: std::time::Duration,
    refresh_interval: std::time::Duration,
    refresher: Option<Refresher>,
}

struct Refresher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CloudLock {
    pub fn new(backend: Arc<dyn CloudBackend>, device_id: String, config: &RepoConfig) -> Self {
        Self {
            backend,
            device_id,
            stale_after_ms: config.lock_stale_after_ms,
            retry_attempts: config.lock_retry_attempts,
            retry_backoff: config.lock_retry_backoff(),
            refresh_interval: config.lock_refresh_interval(),
            refresher: None,
        }
    }

    /// `tryLock(currentDeviceID)` (spec §4.8). Retries `CloudLocked` up
    /// to `retry_attempts` times with backoff, then fails.
    pub fn try_lock(&mut self) -> Result<(), Error> {
        let mut attempts = 0;
        loop {
            match self.try_lock_once() {
                Ok(()) => {
                    self.start_refresher();
                    return Ok(());
                }
                Err(e) => {
                    let is_locked = e
                        .downcast_ref::<NoteforgeError>()
                        .is_some_and(|e| matches!(e, NoteforgeError::CloudLocked));
                    attempts += 1;
                    if is_locked && attempts < self.retry_attempts {
                        std::thread::sleep(self.retry_backoff);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn try_lock_once(&self) -> Result<(), Error> {
        let existing = match get_lock_lease(self.backend.as_ref()) {
            Ok(existing) => existing,
            Err(_) => None, // unparseable: remove and retry as if absent
        };

        match existing {
            None => self.write_lease(),
            Some(lease) => {
                if lease.device_id == self.device_id || self.is_stale(&lease) {
                    self.write_lease()
                } else {
                    Err(NoteforgeError::CloudLocked.into())
                }
            }
        }
    }

    fn is_stale(&self, lease: &LockLease) -> bool {
        let now = now_ms();
        now.saturating_sub(lease.time) > self.stale_after_ms
    }

    fn write_lease(&self) -> Result<(), Error> {
        let lease = LockLease {
            device_id: self.device_id.clone(),
            time: now_ms(),
        };
        let bytes = serde_json::to_vec(&lease)?;
        self.backend.put_object("lock-sync", &bytes, true)?;
        Ok(())
    }

    fn start_refresher(&mut self) {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let backend = Arc::clone(&self.backend);
        let device_id = self.device_id.clone();
        let interval = self.refresh_interval;

        let handle = std::thread::Builder::new()
            .name("cloud-lock-refresh".into())
            .spawn(move || {
                while !stop_for_thread.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    if stop_for_thread.load(Ordering::SeqCst) {
                        return;
                    }
                    let lease = LockLease {
                        device_id: device_id.clone(),
                        time: now_ms(),
                    };
                    if let Ok(bytes) = serde_json::to_vec(&lease) {
                        // Refresh failures are logged but not fatal (spec §4.8).
                        if let Err(e) = backend.put_object("lock-sync", &bytes, true) {
                            log::warn!("cloud lock refresh failed: {e:#}");
                        }
                    }
                }
            })
            .expect("failed to spawn lock refresher thread");

        self.refresher = Some(Refresher { stop, handle });
    }

    /// `unlock()`: stops the refresher, then removes the lease, retrying
    /// a few times (spec §4.8).
    pub fn unlock(&mut self) -> Result<(), Error> {
        if let Some(refresher) = self.refresher.take() {
            refresher.stop.store(true, Ordering::SeqCst);
            let _ = refresher.handle.join();
        }
        let mut last_err = None;
        for _ in 0..3 {
            match self.backend.remove_object("lock-sync") {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap())
    }
}

impl Drop for CloudLock {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.stop.store(true, Ordering::SeqCst);
            let _ = refresher.handle.join();
        }
    }
}

/// Classifies a raw backend error message into a named error kind (spec
/// §4.8: "error messages containing 'RequestTimeTooSkewed' →
/// `SystemTimeIncorrect`; 'unavailable' → `CloudServiceUnavailable`").
pub fn classify_backend_message(msg: &str) -> NoteforgeError {
    NoteforgeError::classify_backend_message(msg)
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
    use crate::cloud::local::LocalCloudBackend;

    #[test]
    fn fresh_lock_succeeds_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalCloudBackend::new(dir.path().to_path_buf(), "repo1"));
        backend.create_repo("repo1").unwrap();
        let config = RepoConfig::default();
        let mut lock = CloudLock::new(backend, "dev-a".into(), &config);
        lock.try_lock().unwrap();
        lock.unlock().unwrap();
    }

    #[test]
    fn second_device_is_rejected_while_lock_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalCloudBackend::new(dir.path().to_path_buf(), "repo1"));
        backend.create_repo("repo1").unwrap();
        let mut config = RepoConfig::default();
        config.lock_retry_attempts = 1;
        config.lock_retry_backoff_ms = 0;

        let mut lock_a = CloudLock::new(Arc::clone(&backend), "dev-a".into(), &config);
        lock_a.try_lock().unwrap();

        let mut lock_b = CloudLock::new(Arc::clone(&backend), "dev-b".into(), &config);
        let err = lock_b.try_lock();
        assert!(err.is_err());

        lock_a.unlock().unwrap();
    }

    #[test]
    fn same_device_can_relock() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalCloudBackend::new(dir.path().to_path_buf(), "repo1"));
        backend.create_repo("repo1").unwrap();
        let config = RepoConfig::default();

        let mut lock_a = CloudLock::new(Arc::clone(&backend), "dev-a".into(), &config);
        lock_a.try_lock().unwrap();
        lock_a.unlock().unwrap();

        let mut lock_a2 = CloudLock::new(backend, "dev-a".into(), &config);
        lock_a2.try_lock().unwrap();
        lock_a2.unlock().unwrap();
    }
}
