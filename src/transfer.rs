//! Receiving side of one streamed worker archive.

use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

use crate::journal::{SyncJournal, SyncJournalEntry, SyncOutcome};
use crate::master::clean_up;
use crate::protocol::command;
use crate::protocol::timeouts::TRANSFER_POLL_MS;
use crate::protocol_core::ProtocolError;
use crate::reconcile::Reconciler;
use crate::transport::{Chunk, ClusterTransport, TransferInbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Receiving,
    Complete,
    Error,
    Done,
}

enum Received {
    Complete,
    Stopped,
    Failed(anyhow::Error),
}

/// Accumulates one archive from a worker, then hands it to the reconciler.
/// Errors are reported to the worker as `sync_error` and never propagate.
pub struct TransferSession<T: ClusterTransport> {
    node: String,
    name: String,
    rx: mpsc::UnboundedReceiver<Chunk>,
    inbox: Arc<TransferInbox>,
    buffer: Vec<u8>,
    state: TransferState,
    reconciler: Arc<Reconciler<T>>,
    stop: watch::Receiver<bool>,
    max_bytes: u64,
    journal: Option<Arc<SyncJournal>>,
}

impl<T: ClusterTransport> TransferSession<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: &str,
        name: &str,
        rx: mpsc::UnboundedReceiver<Chunk>,
        inbox: Arc<TransferInbox>,
        reconciler: Arc<Reconciler<T>>,
        stop: watch::Receiver<bool>,
        max_bytes: u64,
        journal: Option<Arc<SyncJournal>>,
    ) -> Self {
        Self {
            node: node.to_string(),
            name: name.to_string(),
            rx,
            inbox,
            buffer: Vec::new(),
            state: TransferState::Receiving,
            reconciler,
            stop,
            max_bytes,
            journal,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Drive the session to `Done`; returns the state it finished from.
    pub async fn run(mut self) -> TransferState {
        let received = self.receive().await;
        let bytes = self.buffer.len() as u64;

        let last = match received {
            Received::Stopped => {
                tracing::debug!(node = %self.node, archive = %self.name, "transfer interrupted by shutdown");
                self.record(SyncJournalEntry::now(&self.node, &self.name, SyncOutcome::Cancelled, bytes));
                TransferState::Receiving
            }
            Received::Failed(e) => {
                self.fail(e, bytes).await;
                TransferState::Error
            }
            Received::Complete => {
                self.state = TransferState::Complete;
                tracing::debug!(node = %self.node, archive = %self.name, bytes, "archive received");
                let archive = std::mem::take(&mut self.buffer);
                let cycle = self.reconciler.reconcile_cycle(&self.node, archive).await;
                match cycle {
                    Ok(outcome) => {
                        self.record(SyncJournalEntry::now(&self.node, &self.name, outcome, bytes));
                        TransferState::Complete
                    }
                    Err(e) => {
                        self.fail(e, bytes).await;
                        TransferState::Error
                    }
                }
            }
        };

        self.finish();
        last
    }

    async fn receive(&mut self) -> Received {
        let poll = Duration::from_millis(TRANSFER_POLL_MS);
        loop {
            if *self.stop.borrow() {
                return Received::Stopped;
            }
            match timeout(poll, self.rx.recv()).await {
                Err(_) => continue,
                Ok(Some(Chunk::Data(bytes))) => {
                    if (self.buffer.len() + bytes.len()) as u64 > self.max_bytes {
                        return Received::Failed(
                            ProtocolError::ArchiveTooLarge {
                                name: self.name.clone(),
                                max: self.max_bytes,
                            }
                            .into(),
                        );
                    }
                    self.buffer.extend_from_slice(&bytes);
                }
                Ok(Some(Chunk::End)) => return Received::Complete,
                Ok(None) => {
                    return Received::Failed(anyhow!(
                        "connection closed before archive {} was complete",
                        self.name
                    ))
                }
            }
        }
    }

    async fn fail(&mut self, error: anyhow::Error, bytes: u64) {
        self.state = TransferState::Error;
        tracing::error!(node = %self.node, archive = %self.name, error = %format!("{:#}", error), "sync cycle failed");

        let staging = self.reconciler.config().staging_dir.clone();
        let node = self.node.clone();
        let cleaned =
            tokio::task::spawn_blocking(move || clean_up(&staging, Some(&node))).await;
        match cleaned {
            Ok(Err(e)) => tracing::warn!(node = %self.node, error = %e, "staging cleanup failed"),
            Err(e) => tracing::warn!(node = %self.node, error = %e, "staging cleanup panicked"),
            Ok(Ok(())) => {}
        }

        let reason = format!("{:#}", error);
        if let Err(e) = self
            .reconciler
            .transport()
            .send_request(&self.node, command::SYNC_ERROR, reason.as_bytes())
            .await
        {
            tracing::debug!(node = %self.node, error = %e, "could not report sync_error");
        }

        self.record(
            SyncJournalEntry::now(&self.node, &self.name, SyncOutcome::Failed, bytes).with_error(reason),
        );
    }

    fn record(&self, entry: SyncJournalEntry) {
        if let Some(journal) = &self.journal {
            journal.record(entry);
        }
    }

    fn finish(&mut self) -> bool {
        if self.state == TransferState::Done {
            return false;
        }
        self.state = TransferState::Done;
        self.inbox.release(&self.name);
        true
    }
}

impl<T: ClusterTransport> Drop for TransferSession<T> {
    fn drop(&mut self) {
        // Aborted mid-run
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{pack, Manifest};
    use crate::config::MasterConfig;
    use crate::golden::GoldenCache;
    use crate::node::Role;
    use crate::transport::mock::MockTransport;

    struct Harness {
        _tmp: tempfile::TempDir,
        inbox: Arc<TransferInbox>,
        transport: Arc<MockTransport>,
        reconciler: Arc<Reconciler<MockTransport>>,
        journal: Arc<SyncJournal>,
        stop: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(MasterConfig {
            root: tmp.path().join("root"),
            staging_dir: tmp.path().join("staging"),
            ..MasterConfig::default()
        });
        std::fs::create_dir_all(&config.root).unwrap();
        let transport = Arc::new(MockTransport::with_workers(&["worker-1"]));
        let reconciler = Arc::new(Reconciler::new(
            config,
            GoldenCache::new(),
            Arc::clone(&transport),
        ));
        let journal = Arc::new(SyncJournal::new(&tmp.path().join("sync.jsonl")));
        let (stop, _) = watch::channel(false);
        Harness {
            _tmp: tmp,
            inbox: Arc::new(TransferInbox::new()),
            transport,
            reconciler,
            journal,
            stop,
        }
    }

    impl Harness {
        fn session(&self, name: &str, max_bytes: u64) -> TransferSession<MockTransport> {
            self.session_for("worker-1", name, max_bytes)
        }

        fn session_for(&self, node: &str, name: &str, max_bytes: u64) -> TransferSession<MockTransport> {
            let rx = self.inbox.claim(name).unwrap();
            TransferSession::new(
                node,
                name,
                rx,
                Arc::clone(&self.inbox),
                Arc::clone(&self.reconciler),
                self.stop.subscribe(),
                max_bytes,
                Some(Arc::clone(&self.journal)),
            )
        }
    }

    #[tokio::test]
    async fn complete_archive_is_reconciled() {
        let h = harness();
        let session = h.session("a.tar", 1 << 20);
        assert_eq!(session.state(), TransferState::Receiving);

        let bytes = pack(&Manifest::new(Role::Worker, "worker-1"), h._tmp.path()).unwrap();
        let (first, second) = bytes.split_at(100);
        h.inbox.deliver("a.tar", Chunk::Data(first.to_vec()));
        h.inbox.deliver("a.tar", Chunk::Data(second.to_vec()));
        h.inbox.deliver("a.tar", Chunk::End);

        assert_eq!(session.run().await, TransferState::Complete);
        assert_eq!(h.transport.sent()[0].command, "sync_ok");
        assert_eq!(h.inbox.pending(), 0);
        assert_eq!(h.journal.read_entries().unwrap()[0].outcome, SyncOutcome::InSync);
    }

    #[tokio::test]
    async fn oversized_archive_reports_sync_error() {
        let h = harness();
        let session = h.session("big.tar", 8);
        h.inbox.deliver("big.tar", Chunk::Data(vec![0u8; 16]));

        assert_eq!(session.run().await, TransferState::Error);
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, "sync_error");
        assert!(String::from_utf8_lossy(&sent[0].bytes).contains("exceeds"));
        assert_eq!(h.inbox.pending(), 0);
    }

    #[tokio::test]
    async fn dropped_connection_is_an_error() {
        let h = harness();
        let session = h.session("a.tar", 1024);
        h.inbox.close_all();
        assert_eq!(session.run().await, TransferState::Error);
        assert_eq!(h.transport.sent()[0].command, "sync_error");
    }

    #[tokio::test]
    async fn failed_cycle_for_path_like_node_touches_nothing_outside_staging() {
        let h = harness();
        let sentinel = h._tmp.path().join("sentinel");
        std::fs::write(&sentinel, b"keep").unwrap();
        std::fs::write(h._tmp.path().join("root/agent.conf"), b"golden").unwrap();

        let session = h.session_for("..", "evil.tar", 1 << 20);
        h.inbox.deliver("evil.tar", Chunk::Data(b"not a tar archive".to_vec()));
        h.inbox.deliver("evil.tar", Chunk::End);

        assert_eq!(session.run().await, TransferState::Error);
        assert!(sentinel.exists());
        assert!(h._tmp.path().join("root/agent.conf").exists());
        let entry = &h.journal.read_entries().unwrap()[0];
        assert_eq!(entry.outcome, SyncOutcome::Failed);
    }

    #[tokio::test]
    async fn stop_interrupts_receiving() {
        let h = harness();
        let session = h.session("a.tar", 1024);
        let task = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.stop.send_replace(true);

        let state = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("transfer did not observe stop")
            .unwrap();
        assert_eq!(state, TransferState::Receiving);
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.inbox.pending(), 0);
        assert_eq!(h.journal.read_entries().unwrap()[0].outcome, SyncOutcome::Cancelled);
    }
}
