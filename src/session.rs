//! Per-connection command dispatch on the master.

use std::sync::Arc;
use tokio::sync::watch;

use crate::config::MasterConfig;
use crate::journal::SyncJournal;
use crate::master::TaskSet;
use crate::node::NodeInfo;
use crate::protocol::{command, status};
use crate::protocol_core::split_reply;
use crate::reconcile::Reconciler;
use crate::transfer::TransferSession;
use crate::transport::{ClusterTransport, Reply, SessionHandler, TransferInbox};

/// Behavior shared by every role: rejects unknown commands and decodes the
/// generic reply statuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaseProtocol;

impl BaseProtocol {
    pub fn handle(&self, command: &str, _payload: &[u8]) -> Reply {
        Reply::err(format!("unknown command: {}", command))
    }

    pub fn process_response(&self, status: &str, payload: &str) -> Option<String> {
        match status {
            status::OK | status::ACK => Some(payload.to_string()),
            status::ERR => {
                tracing::warn!(reply = payload, "peer replied with an error");
                None
            }
            other => {
                tracing::warn!(status = other, reply = payload, "unknown reply status");
                None
            }
        }
    }
}

/// Decode a raw "<status> <payload>" reply. `ok-*` statuses are master-side
/// success markers; everything else goes through `BaseProtocol`.
pub fn process_response(reply: &str) -> Option<String> {
    if reply.is_empty() {
        return None;
    }
    let (status, payload) = split_reply(reply);
    if status.starts_with(status::MASTER_PREFIX) {
        return Some(payload.to_string());
    }
    BaseProtocol.process_response(status, payload)
}

/// Coordinator state every master session shares.
pub struct SessionContext<T> {
    pub config: Arc<MasterConfig>,
    pub transport: Arc<T>,
    pub reconciler: Arc<Reconciler<T>>,
    pub tasks: Arc<TaskSet>,
    pub stop: watch::Receiver<bool>,
    pub journal: Option<Arc<SyncJournal>>,
}

impl<T> Clone for SessionContext<T> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            reconciler: Arc::clone(&self.reconciler),
            tasks: Arc::clone(&self.tasks),
            stop: self.stop.clone(),
            journal: self.journal.clone(),
        }
    }
}

/// Dispatcher bound to one worker connection
pub struct MasterSession<T> {
    node: String,
    inbox: Arc<TransferInbox>,
    ctx: SessionContext<T>,
    base: BaseProtocol,
}

impl<T: ClusterTransport> MasterSession<T> {
    pub fn new(node: &str, inbox: Arc<TransferInbox>, ctx: SessionContext<T>) -> Self {
        Self {
            node: node.to_string(),
            inbox,
            ctx,
            base: BaseProtocol,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn start_transfer(&self, payload: &[u8]) -> Reply {
        if *self.ctx.stop.borrow() {
            return Reply::err("master is shutting down");
        }
        let name = String::from_utf8_lossy(payload).trim().to_string();
        if name.is_empty() {
            return Reply::err("stream_sync needs an archive name");
        }
        let Some(rx) = self.inbox.claim(&name) else {
            return Reply::err(format!("archive {} is already being received", name));
        };

        let session = TransferSession::new(
            &self.node,
            &name,
            rx,
            Arc::clone(&self.inbox),
            Arc::clone(&self.ctx.reconciler),
            self.ctx.stop.clone(),
            self.ctx.config.max_archive_bytes,
            self.ctx.journal.clone(),
        );
        self.ctx.tasks.spawn(format!("transfer {} from {}", name, self.node), async move {
            session.run().await;
        });
        Reply::ack(name)
    }

    fn list_nodes(&self) -> Reply {
        let mut nodes = self.ctx.transport.list_nodes();
        let config = &self.ctx.config;
        nodes.insert(
            config.node_name.clone(),
            NodeInfo::master(&config.node_name, &config.node_address),
        );
        match serde_json::to_string(&nodes) {
            Ok(json) => Reply::ok(json),
            Err(e) => Reply::err(e.to_string()),
        }
    }
}

impl<T: ClusterTransport> SessionHandler for MasterSession<T> {
    async fn handle(&self, command: &str, payload: &[u8]) -> Reply {
        tracing::debug!(node = %self.node, command, "command received");
        match command {
            command::ECHO => Reply::new(status::OK_CLIENT, String::from_utf8_lossy(payload)),
            command::REQUEST_SYNC => Reply::ack("Starting sync from master"),
            command::STREAM_SYNC => self.start_transfer(payload),
            command::LIST_NODES => self.list_nodes(),
            other => self.base.handle(other, payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::golden::GoldenCache;
    use crate::transport::mock::MockTransport;
    use crate::transport::Chunk;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn session(workers: &[&str]) -> (MasterSession<MockTransport>, watch::Sender<bool>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(MasterConfig {
            node_name: "master".into(),
            node_address: "192.168.0.1".into(),
            root: tmp.path().join("root"),
            staging_dir: tmp.path().join("staging"),
            ..MasterConfig::default()
        });
        let transport = Arc::new(MockTransport::with_workers(workers));
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = SessionContext {
            config: Arc::clone(&config),
            transport: Arc::clone(&transport),
            reconciler: Arc::new(Reconciler::new(config, GoldenCache::new(), transport)),
            tasks: Arc::new(TaskSet::default()),
            stop: stop_rx,
            journal: None,
        };
        (MasterSession::new("worker-1", Arc::new(TransferInbox::new()), ctx), stop_tx, tmp)
    }

    #[test]
    fn process_response_statuses() {
        assert_eq!(process_response("ok done"), Some("done".to_string()));
        assert_eq!(process_response("ack Starting"), Some("Starting".to_string()));
        assert_eq!(process_response("ok-m {\"a\":1}"), Some("{\"a\":1}".to_string()));
        assert_eq!(process_response("ok-c"), Some(String::new()));
        assert_eq!(process_response("err boom"), None);
        assert_eq!(process_response("weird stuff"), None);
        assert_eq!(process_response(""), None);
    }

    #[tokio::test]
    async fn echo_and_request_sync() {
        let (session, _stop, _tmp) = session(&[]);
        assert_eq!(session.handle("echo", b"ping").await.to_wire(), "ok-c ping");
        let reply = session.handle("request_sync", b"").await;
        assert_eq!(reply.status, "ack");
        assert_eq!(reply.payload, "Starting sync from master");
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let (session, _stop, _tmp) = session(&[]);
        let reply = session.handle("frobnicate", b"").await;
        assert_eq!(reply.to_wire(), "err unknown command: frobnicate");
    }

    #[tokio::test]
    async fn list_nodes_includes_self() {
        let (session, _stop, _tmp) = session(&["worker-1", "worker-2"]);
        let reply = session.handle("list_nodes", b"").await;
        assert_eq!(reply.status, "ok");
        let nodes: BTreeMap<String, NodeInfo> = serde_json::from_str(&reply.payload).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes["master"], NodeInfo::master("master", "192.168.0.1"));
        assert_eq!(nodes["worker-2"].ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn stream_sync_claims_the_archive_once() {
        let (session, _stop, _tmp) = session(&["worker-1"]);
        let reply = session.handle("stream_sync", b"a.tar").await;
        assert_eq!(reply.to_wire(), "ack a.tar");
        assert_eq!(session.handle("stream_sync", b"a.tar").await.status, "err");
        assert_eq!(session.handle("stream_sync", b"  ").await.status, "err");

        // A garbage archive ends in sync_error, and the slot is released
        session.inbox.deliver("a.tar", Chunk::Data(b"not a tar".to_vec()));
        session.inbox.deliver("a.tar", Chunk::End);
        for _ in 0..100 {
            if session.inbox.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(session.inbox.pending(), 0);
        let sent = session.ctx.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, "sync_error");
    }

    #[tokio::test]
    async fn stream_sync_refused_while_stopping() {
        let (session, stop, _tmp) = session(&["worker-1"]);
        stop.send(true).unwrap();
        assert_eq!(session.handle("stream_sync", b"a.tar").await.status, "err");
    }
}
