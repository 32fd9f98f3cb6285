//! Closed error set for the snapshot/sync engine (spec §7).

use thiserror::Error;

/// Errors the engine can return from its public entry points.
///
/// Variants correspond 1:1 to the error kinds enumerated in the design
/// (§7); anything that does not need caller-visible matching (I/O,
/// (de)serialization, internal invariant slips) is folded into `Other`.
#[derive(Debug, Error)]
pub enum NoteforgeError {
    #[error("ref not found")]
    NotFoundIndex,

    #[error("object not found: {0}")]
    NotFoundObject(String),

    #[error("permission denied reading object: {0}")]
    ObjectPermissionDenied(String),

    #[error("cloud object not found: {0}")]
    CloudObjectNotFound(String),

    #[error("cloud authentication failed")]
    CloudAuthFailed,

    #[error("cloud access forbidden")]
    CloudForbidden,

    #[error("cloud service unavailable")]
    CloudServiceUnavailable,

    #[error("cloud rate limit exceeded")]
    CloudTooManyRequests,

    #[error("remote repo is locked by another device")]
    CloudLocked,

    #[error("remote refs/latest changed during sync")]
    CloudIndexChanged,

    #[error("cloud storage size exceeded")]
    CloudStorageSizeExceeded,

    #[error("cloud backup count exceeded")]
    CloudBackupCountExceeded,

    #[error("local system clock looks incorrect")]
    SystemTimeIncorrect,

    #[error("client version is deprecated")]
    DeprecatedVersion,

    #[error("cloud consistency check failed")]
    CloudCheckFailed,

    #[error("workspace is empty, refusing to snapshot")]
    IndexEmpty,

    #[error("file changed on disk while being indexed: {0}")]
    IndexFileChanged(String),

    #[error("snapshot references a missing object - repo is corrupt")]
    IndexFatalMissingObject,

    #[error("failed to write conflict history")]
    CloudGenerateConflictHistory,

    #[error("repo is corrupt, reset required")]
    RepoFatal,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NoteforgeError>;

impl NoteforgeError {
    /// Classify a backend error message the way spec §4.8 prescribes:
    /// certain substrings map to specific error kinds.
    pub fn classify_backend_message(msg: &str) -> Self {
        if msg.contains("RequestTimeTooSkewed") {
            NoteforgeError::SystemTimeIncorrect
        } else if msg.contains("unavailable") {
            NoteforgeError::CloudServiceUnavailable
        } else {
            NoteforgeError::Other(anyhow::anyhow!("{msg}"))
        }
    }

    /// True for errors the sync engine retries locally rather than
    /// surfacing immediately (spec §7 propagation policy).
    pub fn is_locally_retryable(&self) -> bool {
        matches!(self, NoteforgeError::CloudLocked)
    }
}
