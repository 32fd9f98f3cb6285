//! Value types of the data model (spec §3, §6): `File`, `Index`,
//! `CheckIndex`, and the cloud index registry. All four are immutable
//! once constructed; identity for `Chunk`/`File` is content-derived, and
//! for `Index`/`CheckIndex` it is a fresh random id (see `hash.rs`).
//!
//! Grounded on `pbs-datastore/src/manifest.rs`'s `FileInfo`/
//! `BackupManifest` serde shape (plain struct, `serde_json`, explicit
//! field renames to match an external wire format).

use serde::{Deserialize, Serialize};

use crate::hash;

/// A logical file version. `id` is derived from `(path, size, updated)`,
/// not from content, so two files with identical bytes but different
/// paths or timestamps are distinct entries (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    /// Workspace-relative, forward-slash, leading `/`.
    pub path: String,
    pub size: i64,
    /// Millisecond wall-clock timestamp.
    pub updated: i64,
    pub chunks: Vec<String>,
}

impl File {
    /// Builds a `File` and computes its id. Panics if `chunks` is empty:
    /// a file with no chunks is invalid by construction (spec §3).
    pub fn new(path: String, size: i64, updated: i64, chunks: Vec<String>) -> Self {
        assert!(!chunks.is_empty(), "file {path} has no chunks");
        let id = file_id(&path, size, updated);
        Self {
            id,
            path,
            size,
            updated,
            chunks,
        }
    }
}

/// `sha1(path || decimal(size) || decimal(updated))`, hex-rendered.
pub fn file_id(path: &str, size: i64, updated: i64) -> String {
    let mut buf = Vec::with_capacity(path.len() + 32);
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(size.to_string().as_bytes());
    buf.extend_from_slice(updated.to_string().as_bytes());
    hash::hex_id(&buf)
}

/// `sha1(raw bytes)`, hex-rendered.
pub fn chunk_id(data: &[u8]) -> String {
    hash::hex_id(data)
}

/// An immutable snapshot of the workspace (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub id: String,
    pub memo: String,
    pub created: i64,
    /// Unordered set of file ids, serialized as a list.
    pub files: Vec<String>,
    pub count: u64,
    pub size: i64,
    #[serde(rename = "systemID")]
    pub system_id: String,
    #[serde(rename = "systemName")]
    pub system_name: String,
    #[serde(rename = "systemOS")]
    pub system_os: String,
    #[serde(rename = "checkIndexID", skip_serializing_if = "Option::is_none")]
    pub check_index_id: Option<String>,
}

impl Index {
    pub fn new(memo: String, created: i64, files: Vec<String>, sizes: &[i64], system: &SystemIdentity) -> Self {
        let size = sizes.iter().sum();
        let count = files.len() as u64;
        Self {
            id: hash::random_index_id(),
            memo,
            created,
            files,
            count,
            size,
            system_id: system.id.clone(),
            system_name: system.name.clone(),
            system_os: system.os.clone(),
            check_index_id: None,
        }
    }
}

/// Device identity recorded into every index this device produces
/// (spec §3 `systemID`/`systemName`/`systemOS`).
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    pub id: String,
    pub name: String,
    pub os: String,
}

/// A side manifest listing every file and its chunk ids for a given
/// index, used only by repair (spec §3, §4.9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckIndex {
    pub id: String,
    #[serde(rename = "indexID")]
    pub index_id: String,
    pub files: Vec<CheckFileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFileEntry {
    pub id: String,
    pub chunks: Vec<String>,
}

impl CheckIndex {
    pub fn new(index_id: String, files: Vec<CheckFileEntry>) -> Self {
        Self {
            id: hash::random_index_id(),
            index_id,
            files,
        }
    }
}

/// Flat registry of snapshot metadata headers used for cloud-side paging
/// (`indexes-v2.json`, spec §4.7 step 13, §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexRegistry {
    pub indexes: Vec<IndexHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub id: String,
    #[serde(rename = "systemID")]
    pub system_id: String,
    #[serde(rename = "systemName")]
    pub system_name: String,
    #[serde(rename = "systemOS")]
    pub system_os: String,
}

impl IndexRegistry {
    /// Prepend `header`, removing any prior entry with the same id
    /// (spec §4.7 step 13: "prepend (or dedup-by-id)").
    pub fn prepend_dedup(&mut self, header: IndexHeader) {
        self.indexes.retain(|h| h.id != header.id);
        self.indexes.insert(0, header);
    }
}

/// The remote cloud lock lease object (spec §4.8, key `lock-sync`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockLease {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub time: i64,
}

/// The repair side-band report (spec §4.9, key `check/indexes-report`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissingObjectsReport {
    #[serde(rename = "missingObjects")]
    pub missing_objects: Vec<String>,
    #[serde(rename = "fixCount")]
    pub fix_count: u64,
}

impl From<&File> for CheckFileEntry {
    fn from(f: &File) -> Self {
        Self {
            id: f.id.clone(),
            chunks: f.chunks.clone(),
        }
    }
}
