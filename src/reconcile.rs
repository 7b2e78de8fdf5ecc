//! Reconciliation of one worker archive against the golden snapshot.
//!
//! A cycle runs decompress, worker-owned writes, cleanup, diff and response,
//! in that order. Blocking file work happens on the blocking pool.

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::archive::{compress, decompress, extracted_file, Manifest};
use crate::config::MasterConfig;
use crate::file_lock::with_file_lock;
use crate::file_write::write_file;
use crate::golden::GoldenCache;
use crate::journal::SyncOutcome;
use crate::node::Role;
use crate::protocol::command;
use crate::protocol_core::{ensure_dir_exists, normalize_under_root};
use crate::session::process_response;
use crate::snapshot::{diff, is_sidecar};
use crate::transport::ClusterTransport;

pub struct Reconciler<T> {
    config: Arc<MasterConfig>,
    golden: GoldenCache,
    transport: Arc<T>,
}

impl<T: ClusterTransport> Reconciler<T> {
    pub fn new(config: Arc<MasterConfig>, golden: GoldenCache, transport: Arc<T>) -> Self {
        Self {
            config,
            golden,
            transport,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Run one cycle for `node`. `Ok(true)` when the worker is in sync or
    /// acknowledged the corrective archive.
    pub async fn reconcile(&self, node: &str, archive: Vec<u8>) -> Result<bool> {
        let outcome = self.reconcile_cycle(node, archive).await?;
        Ok(outcome != SyncOutcome::NotConverged)
    }

    /// Like `reconcile`, reporting how the cycle ended
    pub async fn reconcile_cycle(&self, node: &str, archive: Vec<u8>) -> Result<SyncOutcome> {
        let config = Arc::clone(&self.config);
        let owner = node.to_string();
        let manifest = tokio::task::spawn_blocking(move || receive_archive(&config, &owner, &archive))
            .await
            .context("archive task panicked")??;

        let golden = self.golden.get();
        let result = diff(&golden, &manifest.golden_refs);

        if result.is_empty() {
            tracing::info!(node, "worker in sync with golden snapshot");
            if let Err(e) = self.transport.send_request(node, command::SYNC_OK, b"").await {
                tracing::warn!(node, error = %e, "could not notify worker of sync_ok");
            }
            return Ok(SyncOutcome::InSync);
        }

        tracing::info!(
            node,
            shared = result.shared.len(),
            missing = result.missing.len(),
            extra = result.extra.len(),
            "worker differs from golden snapshot"
        );

        let wanted: BTreeSet<String> = result.corrective_paths().into_iter().collect();
        let mut files = (*golden).clone();
        files.retain_paths(&wanted);

        let root = self.config.root.clone();
        let owner = node.to_string();
        let bytes = tokio::task::spawn_blocking(move || {
            compress(Role::Master, &owner, &root, files, Some(result))
        })
        .await
        .context("compress task panicked")??;

        match self
            .transport
            .send_archive(node, command::PUSH_CORRECTIVE, bytes, true)
            .await
        {
            Ok(reply) => match process_response(&reply) {
                Some(_) => Ok(SyncOutcome::Corrected),
                None => {
                    tracing::warn!(node, reply = %reply, "corrective archive not acknowledged");
                    Ok(SyncOutcome::NotConverged)
                }
            },
            Err(e) => {
                tracing::warn!(node, error = %e, "could not send corrective archive");
                Ok(SyncOutcome::NotConverged)
            }
        }
    }
}

/// Unpack a worker archive into the node's staging area and store its
/// worker-owned files. The extraction directory is removed either way.
fn receive_archive(config: &MasterConfig, node: &str, archive: &[u8]) -> Result<Manifest> {
    let staging = config.node_staging(node)?;
    ensure_dir_exists(&staging)?;
    let (manifest, dir) = decompress(archive, &staging)?;

    let applied = apply_worker_push(config, &manifest, &dir);
    if let Err(e) = fs::remove_dir_all(&dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "could not remove extraction directory");
    }
    applied?;
    Ok(manifest)
}

fn apply_worker_push(config: &MasterConfig, manifest: &Manifest, dir: &Path) -> Result<()> {
    if manifest.origin != Role::Worker && !manifest.worker_push.is_empty() {
        bail!("archive from {} carries worker files", manifest.origin);
    }

    for (path, record) in &manifest.worker_push.files {
        let item = config
            .item(&record.cluster_item_key)
            .with_context(|| format!("{}: unknown item class '{}'", path, record.cluster_item_key))?;
        if item.source != Role::Worker {
            bail!("{}: item class '{}' is not worker-owned", path, record.cluster_item_key);
        }
        if !item.covers(path) || is_sidecar(Path::new(path)) {
            bail!("{}: not a file of item class '{}'", path, record.cluster_item_key);
        }
        if let Some((key, _)) = config
            .items
            .iter()
            .find(|(_, i)| i.source == Role::Master && i.covers(path))
        {
            bail!("{}: master-owned through item class '{}'", path, key);
        }

        let src = extracted_file(dir, path)?;
        let content = fs::read(&src).with_context(|| format!("{} missing from archive", path))?;
        let dest = normalize_under_root(&config.root, Path::new(path))?;
        let umask = item.umask_bits()?;

        with_file_lock(&dest, || {
            write_file(
                &dest,
                &content,
                umask,
                record.modification_time,
                item.write_mode,
                Role::Master,
            )
        })
        .with_context(|| format!("store {}", path))?;
    }
    Ok(())
}
