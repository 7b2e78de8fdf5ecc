//! Transport seams between the session logic and the connection multiplexer.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::node::NodeInfo;
use crate::protocol::status;
use crate::protocol::timeouts::UNCLAIMED_ARCHIVE_MS;
use crate::protocol_core::join_reply;

/// Unclaimed archives a single connection may have in flight
pub const MAX_PENDING_ARCHIVES: usize = 16;

/// Reply to one inbound request: status token plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: String,
    pub payload: String,
}

impl Reply {
    pub fn new(status: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            payload: payload.into(),
        }
    }

    pub fn ok(payload: impl Into<String>) -> Self {
        Self::new(status::OK, payload)
    }

    pub fn ack(payload: impl Into<String>) -> Self {
        Self::new(status::ACK, payload)
    }

    pub fn err(payload: impl Into<String>) -> Self {
        Self::new(status::ERR, payload)
    }

    /// "<status> <payload>" as sent on the wire
    pub fn to_wire(&self) -> String {
        join_reply(&self.status, &self.payload)
    }
}

/// Role-specific request handling for one connection, invoked by the
/// multiplexer for every inbound request.
pub trait SessionHandler: Send + Sync + 'static {
    fn handle(&self, command: &str, payload: &[u8]) -> impl Future<Output = Reply> + Send;
}

/// Outbound side of the cluster: what the master needs to reach its workers.
pub trait ClusterTransport: Send + Sync + 'static {
    /// Send a request to one node and wait for its raw reply
    fn send_request(
        &self,
        node: &str,
        command: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<String>> + Send;

    /// Stream `bytes` to `node` as an archive, then send `command` naming it
    fn send_archive(
        &self,
        node: &str,
        command: &str,
        bytes: Vec<u8>,
        is_compressed: bool,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Connected nodes by name
    fn list_nodes(&self) -> BTreeMap<String, NodeInfo>;

    /// Send a request to every connected node; one entry per node
    fn send_request_broadcast(
        &self,
        command: &str,
        payload: &[u8],
    ) -> impl Future<Output = Vec<(String, Result<String>)>> + Send {
        async move {
            let mut replies = Vec::new();
            for node in self.list_nodes().into_keys() {
                let reply = self.send_request(&node, command, payload).await;
                replies.push((node, reply));
            }
            replies
        }
    }
}

/// A piece of a streamed archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    End,
}

struct Slot {
    tx: mpsc::UnboundedSender<Chunk>,
    rx: Option<mpsc::UnboundedReceiver<Chunk>>,
    last_chunk: Instant,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            last_chunk: Instant::now(),
        }
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        self.rx.is_some() && self.last_chunk.elapsed() >= ttl
    }
}

/// Per-connection routing of archive chunks to the session that consumes
/// them. Chunks may arrive before or after the consumer claims the archive;
/// unclaimed archives idle for longer than the ttl are discarded.
pub struct TransferInbox {
    slots: Mutex<HashMap<String, Slot>>,
    unclaimed_ttl: Duration,
}

impl Default for TransferInbox {
    fn default() -> Self {
        Self::with_unclaimed_ttl(Duration::from_millis(UNCLAIMED_ARCHIVE_MS))
    }
}

impl TransferInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unclaimed_ttl(unclaimed_ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            unclaimed_ttl,
        }
    }

    /// Make room for a new archive. False when every slot is still live.
    fn admit(&self, slots: &mut HashMap<String, Slot>, name: &str) -> bool {
        if slots.contains_key(name) {
            return true;
        }
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_stale(self.unclaimed_ttl));
        if slots.len() < before {
            tracing::warn!(dropped = before - slots.len(), "discarded archives nobody claimed");
        }
        slots.len() < MAX_PENDING_ARCHIVES
    }

    /// Route a chunk to archive `name`. Returns false when it was dropped.
    pub fn deliver(&self, name: &str, chunk: Chunk) -> bool {
        let mut slots = self.slots.lock();
        if !self.admit(&mut slots, name) {
            tracing::warn!(archive = name, "too many archives in flight; dropping chunk");
            return false;
        }
        let slot = slots.entry(name.to_string()).or_insert_with(Slot::new);
        slot.last_chunk = Instant::now();
        slot.tx.send(chunk).is_ok()
    }

    /// Take the receiving end of archive `name`; None if already claimed.
    pub fn claim(&self, name: &str) -> Option<mpsc::UnboundedReceiver<Chunk>> {
        let mut slots = self.slots.lock();
        if !self.admit(&mut slots, name) {
            return None;
        }
        slots
            .entry(name.to_string())
            .or_insert_with(Slot::new)
            .rx
            .take()
    }

    /// Forget archive `name`
    pub fn release(&self, name: &str) {
        self.slots.lock().remove(name);
    }

    /// Drop every slot; consumers observe a closed channel
    pub fn close_all(&self) {
        self.slots.lock().clear();
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Drain a claimed archive until its end marker, refusing more than `max` bytes.
pub async fn collect_archive(
    rx: &mut mpsc::UnboundedReceiver<Chunk>,
    name: &str,
    max: u64,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    loop {
        match rx.recv().await {
            Some(Chunk::Data(bytes)) => {
                if (buf.len() + bytes.len()) as u64 > max {
                    return Err(crate::protocol_core::ProtocolError::ArchiveTooLarge {
                        name: name.to_string(),
                        max,
                    }
                    .into());
                }
                buf.extend_from_slice(&bytes);
            }
            Some(Chunk::End) => return Ok(buf),
            None => anyhow::bail!("archive {} closed before completion", name),
        }
    }
}
