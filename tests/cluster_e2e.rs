use anyhow::Result;
use fleetsync::admin::AdminRequest;
use fleetsync::archive::{decompress, pack, Manifest};
use fleetsync::config::{ItemClass, WriteMode};
use fleetsync::net_async::client::WorkerLink;
use fleetsync::node::{NodeInfo, Role};
use fleetsync::snapshot::compute_snapshot;
use fleetsync::transport::{collect_archive, Reply, SessionHandler, TransferInbox};
use fleetsync::{Master, MasterConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug)]
enum Event {
    SyncOk,
    SyncError(String),
    Corrective(Vec<u8>),
}

/// Worker side that records what the master tells it
struct FakeWorker {
    inbox: Arc<TransferInbox>,
    events: mpsc::UnboundedSender<Event>,
}

impl SessionHandler for FakeWorker {
    async fn handle(&self, command: &str, payload: &[u8]) -> Reply {
        match command {
            "sync_ok" => {
                let _ = self.events.send(Event::SyncOk);
                Reply::ok("")
            }
            "sync_error" => {
                let _ = self.events.send(Event::SyncError(String::from_utf8_lossy(payload).into_owned()));
                Reply::ok("")
            }
            "push_corrective" => {
                let name = String::from_utf8_lossy(payload).into_owned();
                let Some(mut rx) = self.inbox.claim(&name) else {
                    return Reply::err("archive already claimed");
                };
                match collect_archive(&mut rx, &name, u64::MAX).await {
                    Ok(bytes) => {
                        self.inbox.release(&name);
                        let _ = self.events.send(Event::Corrective(bytes));
                        Reply::ok("Files received")
                    }
                    Err(e) => Reply::err(e.to_string()),
                }
            }
            "file_status" => Reply::ok("{}"),
            other => Reply::err(format!("unknown command: {}", other)),
        }
    }
}

fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn items() -> BTreeMap<String, ItemClass> {
    let mut items = BTreeMap::new();
    items.insert(
        "shared".to_string(),
        ItemClass {
            path: "etc/shared".into(),
            source: Role::Master,
            write_mode: WriteMode::Atomic,
            umask: "0o117".into(),
            recursive: true,
            extensions: vec![],
        },
    );
    items.insert(
        "agent-info".to_string(),
        ItemClass {
            path: "queue/agent-info".into(),
            source: Role::Worker,
            write_mode: WriteMode::Atomic,
            umask: "0o117".into(),
            recursive: false,
            extensions: vec![],
        },
    );
    items
}

struct Cluster {
    _tmp: tempfile::TempDir,
    master_root: std::path::PathBuf,
    worker_root: std::path::PathBuf,
    master: Arc<Master>,
    addr: String,
}

async fn start_master() -> Result<Cluster> {
    let tmp = tempfile::tempdir()?;
    let master_root = tmp.path().join("master");
    let worker_root = tmp.path().join("worker");
    write_file(&master_root.join("etc/shared/agent.conf"), b"golden agent.conf")?;
    write_file(&master_root.join("etc/shared/rules.xml"), b"<rules/>")?;
    std::fs::create_dir_all(master_root.join("queue/agent-info"))?;
    write_file(&worker_root.join("etc/shared/agent.conf"), b"stale agent.conf")?;
    write_file(&worker_root.join("queue/agent-info/worker-1"), b"os=linux")?;

    let config = MasterConfig {
        node_name: "master".into(),
        node_address: "127.0.0.1".into(),
        root: master_root.clone(),
        staging_dir: tmp.path().join("staging"),
        admin_socket: tmp.path().join("admin.sock"),
        journal_file: Some(tmp.path().join("sync.jsonl")),
        refresh_interval_secs: 30,
        items: items(),
        ..MasterConfig::default()
    };

    let master = Arc::new(Master::new(config)?);
    master.start().await?;

    // Free port, accepted on before any worker connects
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let serving = Arc::clone(&master);
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    Ok(Cluster {
        _tmp: tmp,
        master_root,
        worker_root,
        master,
        addr,
    })
}

async fn connect_worker(cluster: &Cluster) -> Result<(WorkerLink, mpsc::UnboundedReceiver<Event>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let link = WorkerLink::connect(&cluster.addr, "worker-1", |inbox| FakeWorker { inbox, events: tx }).await?;
    Ok((link, rx))
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no event from master")
        .expect("event channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_echo_and_list_nodes() -> Result<()> {
    let cluster = start_master().await?;
    let (link, _events) = connect_worker(&cluster).await?;
    assert_eq!(link.master(), "master");

    assert_eq!(link.request("echo", b"keepalive").await?, "ok-c keepalive");
    assert_eq!(link.request("request_sync", b"").await?, "ack Starting sync from master");

    let reply = link.request("list_nodes", b"").await?;
    let (status, payload) = reply.split_once(' ').unwrap();
    assert_eq!(status, "ok");
    let nodes: BTreeMap<String, NodeInfo> = serde_json::from_str(payload)?;
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes["worker-1"].node_type, Role::Worker);
    assert_eq!(nodes["master"].node_type, Role::Master);

    let admin = cluster.master.admin_handler();
    let reply = admin
        .process(AdminRequest::GetNodes {
            nodes: Some(vec!["worker-1".into()]),
        })
        .await;
    assert_eq!(reply.payload().as_object().unwrap().len(), 1);

    let files = admin
        .process(AdminRequest::GetFiles { files: None, nodes: None })
        .await
        .payload();
    assert_eq!(files["worker-1"], serde_json::json!({}));
    assert_eq!(files["master"].as_object().unwrap().len(), 2);

    // A second connection under the same name is refused
    let (tx, _rx) = mpsc::unbounded_channel();
    let dup = WorkerLink::connect(&cluster.addr, "worker-1", |inbox| FakeWorker { inbox, events: tx }).await;
    assert!(dup.is_err());

    link.close().await?;
    cluster.master.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_sync_cycle_pushes_corrective_archive() -> Result<()> {
    let cluster = start_master().await?;
    let (link, mut events) = connect_worker(&cluster).await?;

    let items = items();
    let mut manifest = Manifest::new(Role::Worker, "worker-1");
    manifest.golden_refs = compute_snapshot(&cluster.worker_root, &items, Role::Master, true)?;
    manifest.worker_push = compute_snapshot(&cluster.worker_root, &items, Role::Worker, true)?;
    let archive = pack(&manifest, &cluster.worker_root)?;

    let reply = link.push_archive(&archive).await?;
    assert!(reply.starts_with("ack "), "unexpected reply: {}", reply);

    let bytes = match next_event(&mut events).await {
        Event::Corrective(bytes) => bytes,
        other => panic!("expected corrective archive, got {:?}", other),
    };

    let unpack = tempfile::tempdir()?;
    let (corrective, dir) = decompress(&bytes, unpack.path())?;
    assert_eq!(corrective.origin, Role::Master);
    let carried: Vec<&str> = corrective.master_files.files.keys().map(String::as_str).collect();
    assert_eq!(carried, vec!["etc/shared/agent.conf", "etc/shared/rules.xml"]);
    let diff = corrective.diff.expect("corrective archive carries the diff");
    assert!(diff.shared.contains("etc/shared/agent.conf"));
    assert!(diff.missing.contains("etc/shared/rules.xml"));
    assert_eq!(
        std::fs::read(dir.join("files/etc/shared/agent.conf"))?,
        b"golden agent.conf"
    );

    // Worker-owned file landed on the master
    assert_eq!(
        std::fs::read(cluster.master_root.join("queue/agent-info/worker-1"))?,
        b"os=linux"
    );

    link.close().await?;
    cluster.master.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_in_sync_gets_sync_ok() -> Result<()> {
    let cluster = start_master().await?;
    let (link, mut events) = connect_worker(&cluster).await?;

    let mut manifest = Manifest::new(Role::Worker, "worker-1");
    manifest.golden_refs = (*cluster.master.golden().get()).clone();
    let archive = pack(&manifest, &cluster.worker_root)?;
    link.push_archive(&archive).await?;

    assert!(matches!(next_event(&mut events).await, Event::SyncOk));

    link.close().await?;
    cluster.master.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_archive_reports_sync_error_and_keeps_connection() -> Result<()> {
    let cluster = start_master().await?;
    let (link, mut events) = connect_worker(&cluster).await?;

    link.push_archive(b"this is not a tar archive").await?;
    match next_event(&mut events).await {
        Event::SyncError(reason) => assert!(!reason.is_empty()),
        other => panic!("expected sync_error, got {:?}", other),
    }

    // Connection survives the failed cycle
    assert_eq!(link.request("echo", b"still here").await?, "ok-c still here");
    assert_eq!(cluster.master.registry().len(), 1);

    link.close().await?;
    cluster.master.shutdown().await;
    Ok(())
}
