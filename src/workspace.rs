//! Workspace directory walk shared by the indexer (§4.4) and checkout
//! (§4.5): a bounded traversal applying the same built-in filters plus a
//! gitignore-style matcher compiled from caller-supplied lines.
//!
//! Only regular files are tracked (directories, symlinks, and anything
//! else are Non-goals per spec §1). Grounded on
//! `src/pxar/create.rs`'s use of `pathpatterns::{MatchEntry, MatchList,
//! MatchType}` to decide inclusion, and its `entry_limit` bound on the
//! number of entries visited.

use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};
use walkdir::WalkDir;

/// Marker directory name that built-in hidden-entry filtering must never
/// skip (the repository's own metadata lives here, alongside the
/// workspace it tracks, in some deployments).
const WORKSPACE_MARKER: &str = ".noteforge";

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// A file found during a workspace walk, before chunking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    /// Workspace-relative, forward-slash, leading `/` (spec §3).
    pub path: String,
    pub size: i64,
    /// Millisecond wall-clock mtime.
    pub updated: i64,
}

/// Filters applied on top of the built-in rules: host-supplied literal
/// names to skip (e.g. app-internal files) plus gitignore-style lines.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    pub host_excludes: Vec<String>,
    pub gitignore_lines: Vec<String>,
}

impl IgnoreRules {
    fn compile(&self) -> Result<Vec<MatchEntry>, Error> {
        let mut entries = Vec::new();
        for name in &self.host_excludes {
            entries.push(MatchEntry::parse_pattern(
                name.as_bytes(),
                PatternFlag::PATH_NAME,
                MatchType::Exclude,
            )?);
        }
        for line in &self.gitignore_lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (pattern, kind) = if let Some(rest) = line.strip_prefix('!') {
                (rest, MatchType::Include)
            } else {
                (line, MatchType::Exclude)
            };
            entries.push(MatchEntry::parse_pattern(
                pattern.as_bytes(),
                PatternFlag::PATH_NAME,
                kind,
            )?);
        }
        Ok(entries)
    }

    /// A single-path yes/no answer against these rules, for callers that
    /// don't have a walk to drive (e.g. the merge-time ignore-override
    /// check in the sync engine). Built on the same `pathpatterns`
    /// matcher `walk_bounded` uses, not a separate implementation.
    pub fn is_excluded(&self, path: &str) -> Result<bool, Error> {
        let patterns = self.compile()?;
        Ok(patterns.matches(path.as_bytes(), Some(S_IFREG)) == Some(MatchType::Exclude))
    }
}

/// Default bound on the number of directory entries a single walk may
/// visit, guarding against runaway workspaces (pathologically deep
/// trees, filesystem loops via bind mounts, etc).
pub const DEFAULT_ENTRY_LIMIT: usize = 2_000_000;

/// Walks `root`, returning every regular file that survives the built-in
/// filters and `rules`, as workspace-relative paths (spec §4.4 step 1,
/// §4.5 step 2).
pub fn walk(root: &Path, rules: &IgnoreRules) -> Result<Vec<WorkspaceEntry>, Error> {
    walk_bounded(root, rules, DEFAULT_ENTRY_LIMIT)
}

pub fn walk_bounded(
    root: &Path,
    rules: &IgnoreRules,
    entry_limit: usize,
) -> Result<Vec<WorkspaceEntry>, Error> {
    let patterns = rules.compile()?;
    let mut out = Vec::new();
    let mut visited = 0usize;

    for entry in WalkDir::new(root).into_iter() {
        let entry = entry?;
        visited += 1;
        if visited > entry_limit {
            bail!("workspace walk exceeded entry limit ({entry_limit})");
        }

        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue, // root itself
        };

        if is_built_in_excluded(rel) {
            continue;
        }

        let is_dir = entry.file_type().is_dir();
        let mode = if is_dir { S_IFDIR } else { S_IFREG };
        let rel_str = to_workspace_path(rel);
        if patterns.matches(rel_str.as_bytes(), Some(mode)) == Some(MatchType::Exclude) {
            continue;
        }

        if !entry.file_type().is_file() {
            continue; // directories/symlinks are not tracked (Non-goal)
        }

        let metadata = entry.metadata()?;
        let updated = mtime_ms(&metadata);
        out.push(WorkspaceEntry {
            path: rel_str,
            size: metadata.len() as i64,
            updated,
        });
    }

    Ok(out)
}

/// Skip hidden entries (name starts with `.`) except the workspace
/// marker directory; skip `*.tmp` siblings of in-progress writes (spec
/// §4.4 step 1, §9).
fn is_built_in_excluded(rel: &Path) -> bool {
    for component in rel.components() {
        let name = component.as_os_str().to_string_lossy();
        if name == WORKSPACE_MARKER {
            continue;
        }
        if name.starts_with('.') {
            return true;
        }
    }
    if let Some(name) = rel.file_name().and_then(|n| n.to_str()) {
        if name.ends_with(".tmp") {
            return true;
        }
    }
    false
}

fn to_workspace_path(rel: &Path) -> String {
    let mut out = String::from("/");
    let s = rel.to_string_lossy().replace('\\', "/");
    out.push_str(&s);
    out
}

fn mtime_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Resolves a workspace-relative path (as stored in a `File`) back to an
/// absolute filesystem path under `root`.
pub fn resolve(root: &Path, workspace_path: &str) -> PathBuf {
    root.join(workspace_path.trim_start_matches('/'))
}
