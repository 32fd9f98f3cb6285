//! Content-addressed snapshot and synchronization engine for a notes
//! workspace: local indexing and checkout, a pluggable cloud backend,
//! and a three-way merge sync engine, all built around SHA-1 content
//! addressing and append-only object storage.
//!
//! See `error::NoteforgeError` for the error surface, `repo::Repo` for
//! the facade most callers should reach for first, and `progress::Context`
//! for cancellation and event observation threaded through every
//! long-running call.

pub mod checkout;
pub mod chunker;
pub mod cloud;
pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod indexer;
pub mod lock;
pub mod model;
pub mod parallel;
pub mod progress;
pub mod repair;
pub mod repo;
pub mod store;
pub mod sync;
pub mod workspace;

pub use error::{NoteforgeError, Result};
pub use repo::Repo;

/// Installs `env_logger` with a default filter of `info`, honoring
/// `RUST_LOG` if set. Host binaries call this once at startup; the
/// library itself never calls it implicitly.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
