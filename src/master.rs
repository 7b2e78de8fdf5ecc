//! Master coordinator: owns the golden cache, the node registry, background
//! tasks and the staging area, and tears all of it down on stop.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::admin::{serve_admin, AdminHandler};
use crate::agents::{AgentInventory, JsonFileInventory, NoAgents};
use crate::config::MasterConfig;
use crate::golden::{refresh_once, run_refresher, GoldenCache};
use crate::journal::SyncJournal;
use crate::net_async::server::{self, NodeRegistry};
use crate::node::NodeInfo;
use crate::protocol_core::{ensure_dir_exists, node_dir};
use crate::reconcile::Reconciler;
use crate::session::{MasterSession, SessionContext};
use crate::transport::TransferInbox;

/// Labeled background tasks joined on shutdown
#[derive(Default)]
pub struct TaskSet {
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskSet {
    pub fn spawn<F>(&self, label: impl Into<String>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((label.into(), handle));
    }

    /// Tasks not yet reaped
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every task, giving each at most `limit`. Tasks that overrun
    /// are aborted. Returns how many timed out.
    pub async fn join_all(&self, limit: Duration) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut timed_out = 0;
        for (label, mut handle) in tasks {
            match tokio::time::timeout(limit, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(task = %label, error = %e, "task failed"),
                Err(_) => {
                    tracing::warn!(task = %label, limit_ms = limit.as_millis() as u64, "task did not stop in time");
                    handle.abort();
                    timed_out += 1;
                }
            }
        }
        timed_out
    }
}

/// Flips the coordinator's stop signal; usable from any thread.
#[derive(Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

/// Remove staged data of `node`, or of every node when None
pub fn clean_up(staging: &Path, node: Option<&str>) -> Result<()> {
    let target = match node {
        Some(node) => node_dir(staging, node)?,
        None => staging.to_path_buf(),
    };
    if !target.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&target).with_context(|| format!("read {}", target.display()))? {
        let path = entry?.path();
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        removed.with_context(|| format!("remove {}", path.display()))?;
    }
    tracing::debug!(dir = %target.display(), "staging cleaned");
    Ok(())
}

pub struct Master {
    config: Arc<MasterConfig>,
    registry: Arc<NodeRegistry>,
    golden: GoldenCache,
    reconciler: Arc<Reconciler<NodeRegistry>>,
    tasks: Arc<TaskSet>,
    stop: Arc<watch::Sender<bool>>,
    journal: Option<Arc<SyncJournal>>,
    agents: Arc<dyn AgentInventory>,
}

impl Master {
    pub fn new(config: MasterConfig) -> Result<Master> {
        config.validate()?;
        ensure_dir_exists(&config.staging_dir)?;
        let config = Arc::new(config);

        let registry = Arc::new(NodeRegistry::new(
            NodeInfo::master(&config.node_name, &config.node_address),
            config.staging_dir.clone(),
            config.request_timeout(),
        ));
        let golden = GoldenCache::new();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&config),
            golden.clone(),
            Arc::clone(&registry),
        ));
        let agents: Arc<dyn AgentInventory> = match &config.agents_file {
            Some(path) => Arc::new(JsonFileInventory::new(path)),
            None => Arc::new(NoAgents),
        };
        let journal = config
            .journal_file
            .as_deref()
            .map(|path| Arc::new(SyncJournal::new(path)));
        let (stop, _) = watch::channel(false);

        Ok(Master {
            config,
            registry,
            golden,
            reconciler,
            tasks: Arc::new(TaskSet::default()),
            stop: Arc::new(stop),
            journal,
            agents,
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn golden(&self) -> &GoldenCache {
        &self.golden
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Publish a first golden snapshot and start the refresher
    pub async fn start(&self) -> Result<()> {
        match refresh_once(&self.golden, &self.config).await {
            Ok(n) => tracing::info!(files = n, "golden snapshot ready"),
            Err(e) => tracing::warn!(error = %e, "initial integrity calculation failed"),
        }
        self.tasks.spawn(
            "golden refresher",
            run_refresher(
                self.golden.clone(),
                Arc::clone(&self.config),
                self.stop.subscribe(),
            ),
        );
        Ok(())
    }

    pub fn context(&self) -> SessionContext<NodeRegistry> {
        SessionContext {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.registry),
            reconciler: Arc::clone(&self.reconciler),
            tasks: Arc::clone(&self.tasks),
            stop: self.stop.subscribe(),
            journal: self.journal.clone(),
        }
    }

    pub fn session(&self, node: &str, inbox: Arc<TransferInbox>) -> MasterSession<NodeRegistry> {
        MasterSession::new(node, inbox, self.context())
    }

    pub fn admin_handler(&self) -> AdminHandler<NodeRegistry> {
        AdminHandler::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.agents),
        )
    }

    /// Accept workers on `listener` until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let ctx = self.context();
        server::serve(
            listener,
            Arc::clone(&self.registry),
            move |node: &str, inbox| MasterSession::new(node, inbox, ctx.clone()),
            self.stop.subscribe(),
        )
        .await
    }

    /// Start the refresher and admin channel, serve workers until stopped,
    /// then shut down.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        let listener = TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("bind {}", self.config.bind))?;

        let admin = Arc::new(self.admin_handler());
        let socket = self.config.admin_socket.clone();
        let stop = self.stop.subscribe();
        self.tasks.spawn("admin channel", async move {
            if let Err(e) = serve_admin(&socket, admin, stop).await {
                tracing::error!(socket = %socket.display(), error = %e, "admin channel failed");
            }
        });

        let served = self.serve(listener).await;
        self.shutdown().await;
        served
    }

    /// Stop background work, disconnect workers and purge staging
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        self.stop.send_replace(true);
        let timed_out = self.tasks.join_all(self.config.shutdown_timeout()).await;
        if timed_out > 0 {
            tracing::warn!(tasks = timed_out, "tasks aborted at shutdown");
        }
        self.registry.disconnect_all();
        if let Err(e) = clean_up(&self.config.staging_dir, None) {
            tracing::warn!(error = %e, "could not purge staging directory");
        }
    }
}
