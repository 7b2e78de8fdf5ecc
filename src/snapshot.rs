//! Integrity snapshots of the managed tree and the golden/reported diff

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::config::ItemClass;
use crate::file_lock::LOCK_SUFFIX;
use crate::file_write::TEMP_PREFIX;
use crate::node::Role;

/// Integrity record of one managed file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Lowercase hex blake3, empty when computed without hashes
    pub content_hash: String,
    /// Unix seconds
    pub modification_time: i64,
    pub cluster_item_key: String,
}

/// Path (relative, '/'-separated) to integrity record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Snapshot {
    pub files: BTreeMap<String, FileRecord>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, record: FileRecord) {
        self.files.insert(path.into(), record);
    }

    /// Merge another snapshot in; entries already present win
    pub fn merge(&mut self, other: Snapshot) {
        for (path, record) in other.files {
            self.files.entry(path).or_insert(record);
        }
    }

    /// Keep only the listed paths
    pub fn retain_paths(&mut self, paths: &BTreeSet<String>) {
        self.files.retain(|path, _| paths.contains(path));
    }
}

/// Classification of paths relative to the golden snapshot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DiffResult {
    /// On both sides with different content
    pub shared: BTreeSet<String>,
    /// In golden, absent on the worker
    pub missing: BTreeSet<String>,
    /// On the worker, not tracked by golden
    pub extra: BTreeSet<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.missing.is_empty() && self.extra.is_empty()
    }

    /// Files the master has to send back: shared ∪ missing
    pub fn corrective_paths(&self) -> Vec<String> {
        self.shared.iter().chain(self.missing.iter()).cloned().collect()
    }
}

/// Compare the golden snapshot with a worker's reported one
pub fn diff(golden: &Snapshot, reported: &Snapshot) -> DiffResult {
    let mut result = DiffResult::default();

    for (path, record) in &golden.files {
        match reported.files.get(path) {
            None => {
                result.missing.insert(path.clone());
            }
            Some(theirs) if theirs.content_hash != record.content_hash => {
                result.shared.insert(path.clone());
            }
            Some(_) => {}
        }
    }

    for path in reported.files.keys() {
        if !golden.files.contains_key(path) {
            result.extra.insert(path.clone());
        }
    }

    result
}

/// Fast file content hashing using BLAKE3
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Relative cluster path of `path` under `root`
pub fn cluster_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Lock markers and temp files that never belong to a snapshot
pub(crate) fn is_sidecar(path: &Path) -> bool {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    name.ends_with(LOCK_SUFFIX) || name.starts_with(TEMP_PREFIX)
}

/// Enumerate the files of every item class owned by `role`
fn enumerate_items(
    root: &Path,
    items: &BTreeMap<String, ItemClass>,
    role: Role,
) -> Vec<(String, PathBuf, String)> {
    let mut found: BTreeMap<String, (PathBuf, String)> = BTreeMap::new();

    for (key, item) in items.iter().filter(|(_, i)| i.source == role) {
        let base = root.join(&item.path);
        let mut walker = WalkDir::new(&base).follow_links(false);
        if !item.recursive {
            walker = walker.max_depth(1);
        }
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() || is_sidecar(path) || !item.matches_extension(path) {
                continue;
            }
            if let Some(rel) = cluster_path(root, path) {
                found
                    .entry(rel)
                    .or_insert_with(|| (path.to_path_buf(), key.clone()));
            }
        }
    }

    found
        .into_iter()
        .map(|(rel, (abs, key))| (rel, abs, key))
        .collect()
}

/// Compute the integrity snapshot of the files owned by `role`
pub fn compute_snapshot(
    root: &Path,
    items: &BTreeMap<String, ItemClass>,
    role: Role,
    with_hash: bool,
) -> Result<Snapshot> {
    let entries = enumerate_items(root, items, role);

    let records: Vec<(String, FileRecord)> = entries
        .par_iter()
        .filter_map(|(rel, abs, key)| {
            // Files may vanish between enumeration and hashing
            let metadata = match abs.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(path = %abs.display(), error = %e, "skipping unreadable file");
                    return None;
                }
            };
            let modification_time = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let content_hash = if with_hash {
                match hash_file_content(abs) {
                    Ok(h) => h,
                    Err(e) => {
                        tracing::debug!(path = %abs.display(), error = %e, "skipping unhashable file");
                        return None;
                    }
                }
            } else {
                String::new()
            };
            Some((
                rel.clone(),
                FileRecord {
                    content_hash,
                    modification_time,
                    cluster_item_key: key.clone(),
                },
            ))
        })
        .collect();

    Ok(Snapshot {
        files: records.into_iter().collect(),
    })
}
