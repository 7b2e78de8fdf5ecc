//! Async (Tokio) connection multiplexer between the master and its workers.
//!
//! Every connection carries framed `Message`s in both directions. Requests are
//! matched to responses by id, archive chunks are routed through the
//! connection's `TransferInbox`, and inbound requests are handed to a
//! role-specific `SessionHandler` on their own task.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Duration};

use crate::protocol::timeouts::{read_deadline_ms, write_deadline_ms};
use crate::protocol::ARCHIVE_CHUNK_SIZE;
use crate::protocol_core::{build_frame_header, parse_frame_header, validate_frame_size, Message, ProtocolError};
use crate::transport::{Chunk, SessionHandler, TransferInbox};

/// Read one frame. Returns None when the peer closed the connection cleanly.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<(u8, Vec<u8>)>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    // Idle connections wait for a header indefinitely
    let mut hdr = [0u8; 11];
    match stream.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (typ, len) = parse_frame_header(&hdr)?;
    let len = len as usize;
    validate_frame_size(len)?;

    let mut payload = vec![0u8; len];
    if len > 0 {
        let ms = read_deadline_ms(len);
        match timeout(Duration::from_millis(ms), stream.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => bail!("frame payload timeout ({} ms)", ms),
        }
    }
    Ok(Some((typ, payload)))
}

pub async fn write_frame<W>(stream: &mut W, t: u8, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    validate_frame_size(payload.len())?;
    let ms = write_deadline_ms(payload.len());
    let hdr = build_frame_header(t, payload.len() as u32);
    match timeout(Duration::from_millis(ms), async {
        stream.write_all(&hdr).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        stream.flush().await
    })
    .await
    {
        Ok(result) => result.map_err(Into::into),
        Err(_) => bail!("frame write timeout ({} ms)", ms),
    }
}

pub async fn read_message<R>(stream: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match read_frame(stream).await? {
        Some((t, payload)) => Ok(Some(Message::decode(t, &payload)?)),
        None => Ok(None),
    }
}

pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (t, payload) = msg.encode()?;
    write_frame(stream, t, &payload).await
}

/// One end of an established connection, shared by everything that talks on it.
pub struct Peer {
    name: String,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<String>>>,
    next_id: AtomicU64,
    inbox: Arc<TransferInbox>,
    kill: watch::Sender<bool>,
}

impl Peer {
    /// New peer plus the queue its connection driver drains onto the socket
    pub fn new(name: &str) -> (Arc<Peer>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (kill, _) = watch::channel(false);
        let peer = Peer {
            name: name.to_string(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            inbox: Arc::new(TransferInbox::new()),
            kill,
        };
        (Arc::new(peer), rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inbox(&self) -> Arc<TransferInbox> {
        Arc::clone(&self.inbox)
    }

    pub fn is_closed(&self) -> bool {
        *self.kill.borrow() || self.outbound.is_closed()
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| ProtocolError::ConnectionClosed(self.name.clone()).into())
    }

    /// Queue a request; the receiver resolves with the raw reply
    pub fn start_request(&self, command: &str, payload: &[u8]) -> Result<(u64, oneshot::Receiver<String>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let sent = self.send(Message::Request {
            id,
            command: command.to_string(),
            payload: payload.to_vec(),
        });
        if let Err(e) = sent {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    pub async fn await_reply(
        &self,
        id: u64,
        rx: oneshot::Receiver<String>,
        limit: Duration,
    ) -> Result<String> {
        match timeout(limit, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed(self.name.clone()).into()),
            Err(_) => {
                self.pending.lock().remove(&id);
                bail!("request {} to {} timed out after {} ms", id, self.name, limit.as_millis())
            }
        }
    }

    pub async fn request(&self, command: &str, payload: &[u8], limit: Duration) -> Result<String> {
        let (id, rx) = self.start_request(command, payload)?;
        self.await_reply(id, rx, limit).await
    }

    /// Queue `bytes` as archive `name`, chunked, followed by its end marker
    pub fn stream_archive(&self, name: &str, bytes: &[u8]) -> Result<()> {
        for chunk in bytes.chunks(ARCHIVE_CHUNK_SIZE) {
            self.send(Message::ArchiveData {
                name: name.to_string(),
                chunk: chunk.to_vec(),
            })?;
        }
        self.send(Message::ArchiveEnd {
            name: name.to_string(),
        })
    }

    fn complete(&self, id: u64, reply: String) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!(peer = %self.name, id, "reply for unknown or expired request"),
        }
    }

    /// Tear the connection down: waiters see ConnectionClosed, archive
    /// consumers see a closed channel.
    pub fn disconnect(&self) {
        self.kill.send_replace(true);
        self.pending.lock().clear();
        self.inbox.close_all();
    }
}

/// Run a connection until EOF, an I/O error or `peer.disconnect()`.
pub async fn drive_connection<S, H>(
    stream: S,
    peer: Arc<Peer>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    handler: Arc<H>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: SessionHandler,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut writer_kill = peer.kill.subscribe();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = outbound.recv() => match msg {
                    Some(msg) => write_message(&mut writer, &msg).await?,
                    None => break,
                },
                _ = writer_kill.changed() => break,
            }
        }
        let _ = writer.shutdown().await;
        Ok::<(), anyhow::Error>(())
    });

    let read_result = read_loop(&mut reader, &peer, &handler).await;

    peer.disconnect();
    match writer_task.await {
        Ok(Err(e)) if read_result.is_ok() => return Err(e),
        Err(e) => tracing::warn!(peer = %peer.name, error = %e, "writer task failed"),
        _ => {}
    }
    read_result
}

async fn read_loop<R, H>(reader: &mut R, peer: &Arc<Peer>, handler: &Arc<H>) -> Result<()>
where
    R: AsyncRead + Unpin,
    H: SessionHandler,
{
    let mut kill = peer.kill.subscribe();
    loop {
        if *kill.borrow() {
            return Ok(());
        }
        let frame = tokio::select! {
            frame = read_frame(reader) => frame?,
            _ = kill.changed() => return Ok(()),
        };
        let Some((typ, payload)) = frame else {
            return Ok(());
        };
        // The frame was read whole, so the stream is still aligned
        let msg = match Message::decode(typ, &payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = %peer.name, frame = typ, error = %format!("{:#}", e), "dropping malformed message");
                continue;
            }
        };
        match msg {
            Message::Request { id, command, payload } => {
                let handler = Arc::clone(handler);
                let peer = Arc::clone(peer);
                tokio::spawn(async move {
                    let reply = handler.handle(&command, &payload).await;
                    let response = Message::Response {
                        id,
                        reply: reply.to_wire(),
                    };
                    if peer.send(response).is_err() {
                        tracing::debug!(peer = %peer.name, command = %command, "connection gone before reply");
                    }
                });
            }
            Message::Response { id, reply } => peer.complete(id, reply),
            Message::ArchiveData { name, chunk } => {
                peer.inbox.deliver(&name, Chunk::Data(chunk));
            }
            Message::ArchiveEnd { name } => {
                peer.inbox.deliver(&name, Chunk::End);
            }
            other => {
                tracing::warn!(peer = %peer.name, frame = other.frame_type(), "unexpected frame after handshake");
            }
        }
    }
}

pub mod server {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tokio::net::{TcpListener, TcpStream};

    use crate::node::{NodeInfo, Role};
    use crate::protocol::timeouts::{ACCEPT_BACKOFF_MS, HELLO_MS};
    use crate::protocol_core::{ensure_dir_exists, node_dir, Hello};
    use crate::transport::ClusterTransport;

    struct Connected {
        info: NodeInfo,
        peer: Arc<Peer>,
    }

    /// Connected workers, keyed by the name they announced in HELLO
    pub struct NodeRegistry {
        master: NodeInfo,
        staging: PathBuf,
        request_timeout: Duration,
        nodes: RwLock<BTreeMap<String, Connected>>,
    }

    impl NodeRegistry {
        pub fn new(master: NodeInfo, staging: PathBuf, request_timeout: Duration) -> Self {
            Self {
                master,
                staging,
                request_timeout,
                nodes: RwLock::new(BTreeMap::new()),
            }
        }

        pub fn master(&self) -> &NodeInfo {
            &self.master
        }

        /// Register a worker and provision its staging directory.
        /// A second connection under a live name is refused.
        pub fn add_node(&self, info: NodeInfo, peer: Arc<Peer>) -> Result<()> {
            let staging = node_dir(&self.staging, &info.name)?;
            if info.name == self.master.name {
                bail!("node name '{}' is the master's", info.name);
            }
            let mut nodes = self.nodes.write();
            if let Some(existing) = nodes.get(&info.name) {
                if !existing.peer.is_closed() {
                    bail!("node '{}' is already connected", info.name);
                }
            }
            ensure_dir_exists(&staging)?;
            tracing::info!(node = %info.name, ip = %info.ip, "worker connected");
            nodes.insert(info.name.clone(), Connected { info, peer });
            Ok(())
        }

        /// Forget `name` if it is still bound to `peer`
        pub fn remove_node(&self, name: &str, peer: &Arc<Peer>) -> bool {
            let mut nodes = self.nodes.write();
            let same = nodes
                .get(name)
                .is_some_and(|c| Arc::ptr_eq(&c.peer, peer));
            if same {
                nodes.remove(name);
                tracing::info!(node = name, "worker disconnected");
            }
            same
        }

        pub fn peer(&self, name: &str) -> Result<Arc<Peer>> {
            self.nodes
                .read()
                .get(name)
                .map(|c| Arc::clone(&c.peer))
                .ok_or_else(|| ProtocolError::UnknownNode(name.to_string()).into())
        }

        pub fn len(&self) -> usize {
            self.nodes.read().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn disconnect_all(&self) {
            let peers: Vec<Arc<Peer>> = self
                .nodes
                .read()
                .values()
                .map(|c| Arc::clone(&c.peer))
                .collect();
            for peer in peers {
                peer.disconnect();
            }
        }
    }

    impl ClusterTransport for NodeRegistry {
        async fn send_request(&self, node: &str, command: &str, payload: &[u8]) -> Result<String> {
            let peer = self.peer(node)?;
            peer.request(command, payload, self.request_timeout).await
        }

        async fn send_archive(
            &self,
            node: &str,
            command: &str,
            bytes: Vec<u8>,
            is_compressed: bool,
        ) -> Result<String> {
            let peer = self.peer(node)?;
            let name = format!("{}-{}.tar", self.master.name, uuid::Uuid::new_v4());
            tracing::debug!(node, archive = %name, bytes = bytes.len(), is_compressed, "streaming archive");
            peer.stream_archive(&name, &bytes)?;
            peer.request(command, name.as_bytes(), self.request_timeout).await
        }

        fn list_nodes(&self) -> BTreeMap<String, NodeInfo> {
            self.nodes
                .read()
                .iter()
                .map(|(name, c)| (name.clone(), c.info.clone()))
                .collect()
        }
    }

    /// Accept workers until `stop` flips. `make_handler` builds the session
    /// for each connection from the worker's name and its inbox.
    pub async fn serve<F, H>(
        listener: TcpListener,
        registry: Arc<NodeRegistry>,
        make_handler: F,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()>
    where
        F: Fn(&str, Arc<TransferInbox>) -> H + Send + Sync + 'static,
        H: SessionHandler,
    {
        let make_handler = Arc::new(make_handler);
        tracing::info!(addr = %listener.local_addr()?, "listening for workers");

        loop {
            if *stop.borrow() {
                break;
            }
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(ACCEPT_BACKOFF_MS)).await;
                        continue;
                    }
                },
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let registry = Arc::clone(&registry);
            let make_handler = Arc::clone(&make_handler);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, make_handler).await {
                    tracing::warn!(peer = %addr, error = %e, "worker connection ended with error");
                }
            });
        }
        Ok(())
    }

    async fn handle_connection<F, H>(
        mut stream: TcpStream,
        addr: std::net::SocketAddr,
        registry: Arc<NodeRegistry>,
        make_handler: Arc<F>,
    ) -> Result<()>
    where
        F: Fn(&str, Arc<TransferInbox>) -> H + Send + Sync + 'static,
        H: SessionHandler,
    {
        let _ = stream.set_nodelay(true);

        let hello = match timeout(Duration::from_millis(HELLO_MS), read_message(&mut stream)).await {
            Ok(msg) => msg?,
            Err(_) => bail!("no HELLO within {} ms", HELLO_MS),
        };
        let Hello { name, role } = match hello {
            Some(Message::Hello(hello)) => hello,
            Some(other) => bail!("expected HELLO, got frame {}", other.frame_type()),
            None => return Ok(()),
        };
        if role != Role::Worker {
            bail!("'{}' announced role {}; only workers may connect", name, role);
        }

        let (peer, outbound) = Peer::new(&name);
        registry
            .add_node(NodeInfo::worker(&name, addr.ip().to_string()), Arc::clone(&peer))
            .with_context(|| format!("register {}", addr))?;

        let ack = Message::HelloAck {
            master: registry.master().name.clone(),
        };
        if let Err(e) = write_message(&mut stream, &ack).await {
            registry.remove_node(&name, &peer);
            return Err(e);
        }

        let handler = Arc::new(make_handler(&name, peer.inbox()));
        let result = drive_connection(stream, Arc::clone(&peer), outbound, handler).await;
        registry.remove_node(&name, &peer);
        result
    }
}

pub mod client {
    use super::*;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    use crate::node::Role;
    use crate::protocol::command;
    use crate::protocol::timeouts::{HELLO_MS, REQUEST_MS};
    use crate::protocol_core::Hello;

    /// Worker side of a master connection
    pub struct WorkerLink {
        peer: Arc<Peer>,
        master: String,
        task: JoinHandle<Result<()>>,
        request_timeout: Duration,
    }

    impl WorkerLink {
        pub async fn connect<F, H>(addr: &str, name: &str, make_handler: F) -> Result<WorkerLink>
        where
            F: FnOnce(Arc<TransferInbox>) -> H,
            H: SessionHandler,
        {
            let mut stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("connect {}", addr))?;
            let _ = stream.set_nodelay(true);

            let hello = Message::Hello(Hello {
                name: name.to_string(),
                role: Role::Worker,
            });
            write_message(&mut stream, &hello).await?;

            let master = match timeout(Duration::from_millis(HELLO_MS), read_message(&mut stream)).await {
                Ok(Ok(Some(Message::HelloAck { master }))) => master,
                Ok(Ok(Some(other))) => bail!("expected HELLO_ACK, got frame {}", other.frame_type()),
                Ok(Ok(None)) => return Err(ProtocolError::ConnectionClosed(addr.to_string()).into()),
                Ok(Err(e)) => return Err(e),
                Err(_) => bail!("no HELLO_ACK within {} ms", HELLO_MS),
            };

            let (peer, outbound) = Peer::new(&master);
            let handler = Arc::new(make_handler(peer.inbox()));
            let task = tokio::spawn(drive_connection(stream, Arc::clone(&peer), outbound, handler));

            Ok(WorkerLink {
                peer,
                master,
                task,
                request_timeout: Duration::from_millis(REQUEST_MS),
            })
        }

        pub fn master(&self) -> &str {
            &self.master
        }

        pub fn with_request_timeout(mut self, limit: Duration) -> Self {
            self.request_timeout = limit;
            self
        }

        pub async fn request(&self, command: &str, payload: &[u8]) -> Result<String> {
            self.peer.request(command, payload, self.request_timeout).await
        }

        /// Announce an integrity archive with `stream_sync`, then stream it.
        /// Returns the master's reply to the announcement.
        pub async fn push_archive(&self, bytes: &[u8]) -> Result<String> {
            let name = format!("{}.tar", uuid::Uuid::new_v4());
            let (id, rx) = self.peer.start_request(command::STREAM_SYNC, name.as_bytes())?;
            self.peer.stream_archive(&name, bytes)?;
            self.peer.await_reply(id, rx, self.request_timeout).await
        }

        pub async fn close(self) -> Result<()> {
            self.peer.disconnect();
            self.task.await.context("connection task panicked")?
        }
    }
}
