//! Golden snapshot cache and its background refresher.
//!
//! The cache holds an `Arc<Snapshot>` behind a lock that only ever guards a
//! pointer clone or a pointer swap. Snapshots are built outside the lock and
//! published wholesale, so a reader always gets one complete refresher pass.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::config::MasterConfig;
use crate::node::Role;
use crate::snapshot::{compute_snapshot, Snapshot};

#[derive(Clone, Default)]
pub struct GoldenCache {
    current: Arc<RwLock<Arc<Snapshot>>>,
}

impl GoldenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; cheap, never blocks on a refresh in progress
    pub fn get(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    /// Publish a fully built snapshot, dropping the previous one
    pub fn replace(&self, snapshot: Snapshot) {
        let next = Arc::new(snapshot);
        *self.current.write() = next;
    }
}

/// Recompute the golden snapshot once and publish it. Returns the file count.
pub async fn refresh_once(cache: &GoldenCache, config: &MasterConfig) -> Result<usize> {
    let root = config.root.clone();
    let items = config.items.clone();
    let started = Instant::now();

    let snapshot =
        tokio::task::spawn_blocking(move || compute_snapshot(&root, &items, Role::Master, true))
            .await
            .context("snapshot task panicked")??;

    let count = snapshot.len();
    cache.replace(snapshot);
    tracing::debug!(files = count, elapsed_ms = started.elapsed().as_millis() as u64, "golden snapshot refreshed");
    Ok(count)
}

/// Refresh every `config.refresh_interval()` until `stop` flips to true or its
/// sender goes away. A failed pass keeps the previous snapshot published.
pub async fn run_refresher(
    cache: GoldenCache,
    config: Arc<MasterConfig>,
    mut stop: watch::Receiver<bool>,
) {
    let interval = config.refresh_interval();
    tracing::debug!(interval_secs = interval.as_secs(), "golden refresher started");

    loop {
        if *stop.borrow() {
            break;
        }

        tracing::debug!("recalculating integrity control");
        if let Err(e) = refresh_once(&cache, &config).await {
            tracing::warn!(error = %e, "integrity recalculation failed; keeping previous snapshot");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("golden refresher stopped");
}
