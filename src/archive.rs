//! Archive bundles exchanged between master and workers.
//!
//! A bundle is a tar stream whose first entry is the JSON manifest
//! (`cluster_control.json`) followed by the carried files under `files/`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

use crate::node::Role;
use crate::protocol::MANIFEST_NAME;
use crate::protocol_core::{ensure_dir_exists, normalize_under_root, ProtocolError};
use crate::snapshot::{DiffResult, Snapshot};

const FILES_DIR: &str = "files";

/// Manifest fields every worker bundle must carry, even when empty
const WORKER_FIELDS: [&str; 2] = ["golden_refs", "worker_push"];

/// Bundle metadata
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub origin: Role,
    pub node: String,
    /// Worker's view of master-owned files, checked against golden
    #[serde(default)]
    pub golden_refs: Snapshot,
    /// Worker-owned files carried in the bundle for the master to store
    #[serde(default)]
    pub worker_push: Snapshot,
    /// Master-authoritative files carried in a corrective bundle
    #[serde(default)]
    pub master_files: Snapshot,
    #[serde(default)]
    pub diff: Option<DiffResult>,
}

impl Manifest {
    pub fn new(origin: Role, node: impl Into<String>) -> Self {
        Self {
            origin,
            node: node.into(),
            golden_refs: Snapshot::new(),
            worker_push: Snapshot::new(),
            master_files: Snapshot::new(),
            diff: None,
        }
    }

    /// Files whose contents travel in the bundle
    pub fn carried(&self) -> &Snapshot {
        match self.origin {
            Role::Master => &self.master_files,
            Role::Worker => &self.worker_push,
        }
    }
}

/// Write `manifest` plus the bytes of every carried file (read from `root`)
pub fn pack(manifest: &Manifest, root: &Path) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    let manifest_json = serde_json::to_vec(manifest).context("serialize manifest")?;
    append_bytes(&mut builder, MANIFEST_NAME, &manifest_json, 0)?;

    for (rel, record) in &manifest.carried().files {
        let src = normalize_under_root(root, Path::new(rel))?;
        let data = fs::read(&src).with_context(|| format!("read {}", src.display()))?;
        append_bytes(
            &mut builder,
            &format!("{}/{}", FILES_DIR, rel),
            &data,
            record.modification_time.max(0) as u64,
        )?;
    }

    builder.into_inner().context("finish archive")
}

fn append_bytes(builder: &mut Builder<Vec<u8>>, path: &str, data: &[u8], mtime: u64) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_cksum();
    builder
        .append_data(&mut header, path, data)
        .with_context(|| format!("append {}", path))
}

/// Build a bundle of `files` (records keyed by path) sent by `role` to/for `node_id`
pub fn compress(
    role: Role,
    node_id: &str,
    root: &Path,
    files: Snapshot,
    diff: Option<DiffResult>,
) -> Result<Vec<u8>> {
    let mut manifest = Manifest::new(role, node_id);
    match role {
        Role::Master => manifest.master_files = files,
        Role::Worker => manifest.worker_push = files,
    }
    manifest.diff = diff;
    pack(&manifest, root)
}

/// Unpack a bundle into a fresh directory under `staging`.
/// Returns the manifest and the extraction directory; the caller owns cleanup.
pub fn decompress(bytes: &[u8], staging: &Path) -> Result<(Manifest, PathBuf)> {
    let dir = staging.join(format!("recv-{}", uuid::Uuid::new_v4()));
    ensure_dir_exists(&dir)?;

    match unpack_into(bytes, &dir) {
        Ok(manifest) => Ok((manifest, dir)),
        Err(e) => {
            let _ = fs::remove_dir_all(&dir);
            Err(e)
        }
    }
}

fn unpack_into(bytes: &[u8], dir: &Path) -> Result<Manifest> {
    let mut archive = Archive::new(Cursor::new(bytes));
    archive.set_overwrite(true);

    for entry in archive.entries().context("read archive")? {
        let mut entry = entry.context("read archive entry")?;
        let et = entry.header().entry_type();
        // Regular files and directories only
        if !(et.is_file() || et.is_dir()) {
            continue;
        }
        let rel = entry.path()?.to_path_buf();
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            anyhow::bail!("archive entry contains parent component: {}", rel.display());
        }
        entry.unpack_in(dir)?;
    }

    let manifest_path = dir.join(MANIFEST_NAME);
    if !manifest_path.is_file() {
        return Err(ProtocolError::MissingManifest(MANIFEST_NAME.to_string()).into());
    }
    let raw = fs::read(&manifest_path)?;
    parse_manifest(&raw)
}

fn parse_manifest(raw: &[u8]) -> Result<Manifest> {
    let value: serde_json::Value = serde_json::from_slice(raw).context("parse manifest")?;
    let absent: Vec<&str> = WORKER_FIELDS
        .into_iter()
        .filter(|field| value.get(field).is_none())
        .collect();
    let manifest: Manifest = serde_json::from_value(value).context("parse manifest")?;
    if manifest.origin == Role::Worker {
        if let Some(field) = absent.first() {
            return Err(ProtocolError::MissingManifest(format!("{}.{}", MANIFEST_NAME, field)).into());
        }
    }
    Ok(manifest)
}

/// Location of a carried file inside an extraction directory
pub fn extracted_file(dir: &Path, rel: &str) -> Result<PathBuf> {
    normalize_under_root(&dir.join(FILES_DIR), Path::new(rel))
}
