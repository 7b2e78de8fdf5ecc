//! Administrative queries over a local channel.
//!
//! One JSON request per line, answered with one `[status, "<json text>"]`
//! line. Failures never close the channel: unreachable nodes degrade to
//! partial results and malformed requests get an `err` reply.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::agents::AgentInventory;
use crate::config::MasterConfig;
use crate::node::{NodeInfo, Role};
use crate::protocol::{command, status};
use crate::protocol_core::split_reply;
use crate::session::process_response;
use crate::snapshot::compute_snapshot;
use crate::transport::ClusterTransport;

/// Target that addresses every connected node in `forward`
pub const ALL_NODES: &str = "all";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AdminRequest {
    GetFiles {
        #[serde(default)]
        files: Option<Vec<String>>,
        #[serde(default)]
        nodes: Option<Vec<String>>,
    },
    GetNodes {
        #[serde(default)]
        nodes: Option<Vec<String>>,
    },
    GetAgents {
        #[serde(default)]
        status: Option<String>,
    },
    Sync {
        #[serde(default)]
        nodes: Option<Vec<String>>,
    },
    /// Relay a raw worker command to one node or to `all`
    Forward {
        request: String,
        target: String,
        #[serde(default)]
        payload: String,
    },
}

/// `[status, json_payload]`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AdminReply(pub String, pub String);

impl AdminReply {
    pub fn ok(payload: &Value) -> Self {
        AdminReply(status::OK.to_string(), payload.to_string())
    }

    pub fn err(error: impl std::fmt::Display) -> Self {
        AdminReply(
            status::ERR.to_string(),
            json!({ "error": error.to_string() }).to_string(),
        )
    }

    pub fn status(&self) -> &str {
        &self.0
    }

    /// Payload parsed back into JSON; a non-JSON payload comes back as a string
    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.1).unwrap_or_else(|_| Value::String(self.1.clone()))
    }
}

pub struct AdminHandler<T> {
    config: Arc<MasterConfig>,
    transport: Arc<T>,
    agents: Arc<dyn AgentInventory>,
}

impl<T: ClusterTransport> AdminHandler<T> {
    pub fn new(config: Arc<MasterConfig>, transport: Arc<T>, agents: Arc<dyn AgentInventory>) -> Self {
        Self {
            config,
            transport,
            agents,
        }
    }

    /// Answer one request line
    pub async fn process_line(&self, line: &str) -> AdminReply {
        match serde_json::from_str::<AdminRequest>(line) {
            Ok(request) => self.process(request).await,
            Err(e) => {
                tracing::warn!(error = %e, "malformed admin request");
                AdminReply::err(format!("malformed request: {}", e))
            }
        }
    }

    pub async fn process(&self, request: AdminRequest) -> AdminReply {
        tracing::debug!(?request, "admin request");
        let result = match request {
            AdminRequest::GetFiles { files, nodes } => self.get_files(files, nodes).await,
            AdminRequest::GetNodes { nodes } => Ok(self.get_nodes(nodes.as_deref())),
            AdminRequest::GetAgents { status } => self.agents.agents(status.as_deref()),
            AdminRequest::Sync { nodes } => Ok(self.sync(nodes).await),
            AdminRequest::Forward {
                request,
                target,
                payload,
            } => return self.forward(&request, &target, &payload).await,
        };
        match result {
            Ok(value) => AdminReply::ok(&value),
            Err(e) => {
                tracing::warn!(error = %e, "admin request failed");
                AdminReply::err(format!("{:#}", e))
            }
        }
    }

    fn local(&self) -> NodeInfo {
        NodeInfo::master(&self.config.node_name, &self.config.node_address)
    }

    /// `{node: {path: record}}`; nodes that did not answer are `null` when
    /// named explicitly and left out of a broadcast.
    async fn get_files(&self, files: Option<Vec<String>>, nodes: Option<Vec<String>>) -> Result<Value> {
        let payload = serde_json::to_vec(&files)?;
        let mut result = Map::new();

        match nodes {
            Some(nodes) => {
                for node in nodes {
                    let value = if node == self.config.node_name {
                        self.local_files_or_null().await
                    } else {
                        match self.transport.send_request(&node, command::FILE_STATUS, &payload).await {
                            Ok(reply) => decode_json_reply(&node, &reply),
                            Err(e) => {
                                tracing::warn!(node = %node, error = %e, "file_status failed");
                                Value::Null
                            }
                        }
                    };
                    result.insert(node, value);
                }
            }
            None => {
                let replies = self
                    .transport
                    .send_request_broadcast(command::FILE_STATUS, &payload)
                    .await;
                for (node, reply) in replies {
                    match reply {
                        Ok(reply) => {
                            result.insert(node.clone(), decode_json_reply(&node, &reply));
                        }
                        Err(e) => tracing::warn!(node = %node, error = %e, "file_status failed"),
                    }
                }
                result.insert(self.config.node_name.clone(), self.local_files_or_null().await);
            }
        }

        if let Some(files) = files {
            let wanted: BTreeSet<String> = files.into_iter().collect();
            for value in result.values_mut() {
                if let Value::Object(map) = value {
                    map.retain(|path, _| wanted.contains(path));
                }
            }
        }
        Ok(Value::Object(result))
    }

    async fn local_files_or_null(&self) -> Value {
        self.local_files().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "local integrity calculation failed");
            Value::Null
        })
    }

    /// Master's own tree: both roles' items, with hashes
    async fn local_files(&self) -> Result<Value> {
        let root = self.config.root.clone();
        let items = self.config.items.clone();
        let snapshot = tokio::task::spawn_blocking(move || -> Result<_> {
            if !root.is_dir() {
                anyhow::bail!("managed root {} is not a directory", root.display());
            }
            let mut files = compute_snapshot(&root, &items, Role::Master, true)?;
            files.merge(compute_snapshot(&root, &items, Role::Worker, true)?);
            Ok(files)
        })
        .await
        .context("snapshot task panicked")??;
        Ok(serde_json::to_value(snapshot)?)
    }

    fn get_nodes(&self, nodes: Option<&[String]>) -> Value {
        let mut all = self.transport.list_nodes();
        let local = self.local();
        all.insert(local.name.clone(), local);
        if let Some(wanted) = nodes {
            all.retain(|name, _| wanted.contains(name));
        }
        json!(all)
    }

    async fn sync(&self, nodes: Option<Vec<String>>) -> Value {
        let replies = match nodes {
            Some(nodes) => {
                let mut replies = Vec::new();
                for node in nodes {
                    let reply = self.transport.send_request(&node, command::REQUEST_SYNC, b"").await;
                    replies.push((node, reply));
                }
                replies
            }
            None => {
                self.transport
                    .send_request_broadcast(command::REQUEST_SYNC, b"")
                    .await
            }
        };
        reply_map(replies)
    }

    async fn forward(&self, request: &str, target: &str, payload: &str) -> AdminReply {
        if target == ALL_NODES {
            let replies = self
                .transport
                .send_request_broadcast(request, payload.as_bytes())
                .await;
            return AdminReply::ok(&reply_map(replies));
        }
        match self.transport.send_request(target, request, payload.as_bytes()).await {
            Ok(reply) => {
                let (status, payload) = split_reply(&reply);
                AdminReply(status.to_string(), payload.to_string())
            }
            Err(e) => {
                tracing::warn!(node = target, request, error = %e, "forward failed");
                AdminReply::err(e)
            }
        }
    }
}

/// `{node: raw reply}`, `null` for nodes that failed
fn reply_map(replies: Vec<(String, Result<String>)>) -> Value {
    let mut map = Map::new();
    for (node, reply) in replies {
        let value = match reply {
            Ok(reply) => Value::String(reply),
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "no reply");
                Value::Null
            }
        };
        map.insert(node, value);
    }
    Value::Object(map)
}

fn decode_json_reply(node: &str, reply: &str) -> Value {
    let Some(payload) = process_response(reply) else {
        return Value::Null;
    };
    serde_json::from_str(&payload).unwrap_or_else(|e| {
        tracing::warn!(node, error = %e, "unparseable reply");
        Value::Null
    })
}

/// Serve admin requests on a unix socket until `stop` flips
#[cfg(unix)]
pub async fn serve_admin<T: ClusterTransport>(
    socket: &Path,
    handler: Arc<AdminHandler<T>>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    use crate::protocol::timeouts::ACCEPT_BACKOFF_MS;

    if socket.exists() {
        std::fs::remove_file(socket)
            .with_context(|| format!("remove stale socket {}", socket.display()))?;
    }
    crate::protocol_core::ensure_parent_exists(socket)?;
    let listener =
        UnixListener::bind(socket).with_context(|| format!("bind {}", socket.display()))?;
    tracing::info!(socket = %socket.display(), "admin channel listening");

    loop {
        if *stop.borrow() {
            break;
        }
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "admin accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(ACCEPT_BACKOFF_MS)).await;
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

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "admin client read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handler.process_line(&line).await;
                let mut out = match serde_json::to_string(&reply) {
                    Ok(out) => out,
                    Err(e) => {
                        tracing::warn!(error = %e, "could not encode admin reply");
                        continue;
                    }
                };
                out.push('\n');
                if writer.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }

    let _ = std::fs::remove_file(socket);
    Ok(())
}

#[cfg(not(unix))]
pub async fn serve_admin<T: ClusterTransport>(
    _socket: &Path,
    _handler: Arc<AdminHandler<T>>,
    _stop: watch::Receiver<bool>,
) -> Result<()> {
    anyhow::bail!("the admin channel needs unix domain sockets")
}

/// Send one request to a running master's admin socket
#[cfg(unix)]
pub async fn query(socket: &Path, request: &AdminRequest) -> Result<AdminReply> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connect {}", socket.display()))?;
    let (reader, mut writer) = stream.into_split();

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;

    let reply = BufReader::new(reader)
        .lines()
        .next_line()
        .await?
        .context("admin channel closed without a reply")?;
    serde_json::from_str(&reply).context("parse admin reply")
}

#[cfg(not(unix))]
pub async fn query(_socket: &Path, _request: &AdminRequest) -> Result<AdminReply> {
    anyhow::bail!("the admin channel needs unix domain sockets")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::NoAgents;
    use crate::config::{ItemClass, WriteMode};
    use crate::transport::mock::MockTransport;

    fn handler(transport: MockTransport, root: &Path) -> AdminHandler<MockTransport> {
        let mut config = MasterConfig {
            node_name: "master".into(),
            node_address: "192.168.0.1".into(),
            root: root.to_path_buf(),
            ..MasterConfig::default()
        };
        config.items.insert(
            "shared".into(),
            ItemClass {
                path: "etc/shared".into(),
                source: Role::Master,
                write_mode: WriteMode::Atomic,
                umask: "0o117".into(),
                recursive: true,
                extensions: vec![],
            },
        );
        AdminHandler::new(Arc::new(config), Arc::new(transport), Arc::new(NoAgents))
    }

    #[test]
    fn requests_are_tagged_by_command() {
        let req: AdminRequest = serde_json::from_str(r#"{"command":"get_nodes","nodes":["a"]}"#).unwrap();
        assert_eq!(
            req,
            AdminRequest::GetNodes {
                nodes: Some(vec!["a".into()])
            }
        );
        let req: AdminRequest = serde_json::from_str(r#"{"command":"sync"}"#).unwrap();
        assert_eq!(req, AdminRequest::Sync { nodes: None });
        assert_eq!(
            serde_json::to_string(&AdminReply::ok(&json!({"a": 1}))).unwrap(),
            r#"["ok","{\"a\":1}"]"#
        );
    }

    #[tokio::test]
    async fn get_nodes_filters_to_named_nodes() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(MockTransport::with_workers(&["nodeA", "nodeB", "nodeC"]), tmp.path());

        let reply = h
            .process(AdminRequest::GetNodes {
                nodes: Some(vec!["nodeA".into()]),
            })
            .await;
        assert_eq!(reply.status(), "ok");
        let nodes = reply.payload();
        let nodes = nodes.as_object().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes["nodeA"]["type"], "worker");

        let all = h.process(AdminRequest::GetNodes { nodes: None }).await.payload();
        assert_eq!(all.as_object().unwrap().len(), 4);
        assert_eq!(all["master"]["type"], "master");
        assert_eq!(all["master"]["ip"], "192.168.0.1");
    }

    #[tokio::test]
    async fn get_files_merges_nodes_and_self() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc/shared")).unwrap();
        std::fs::write(tmp.path().join("etc/shared/agent.conf"), b"x").unwrap();
        std::fs::write(tmp.path().join("etc/shared/rules.xml"), b"y").unwrap();

        let transport = MockTransport::with_workers(&["nodeA", "nodeB"]);
        transport.reply_to(
            "file_status",
            r#"ok {"etc/shared/agent.conf":{"content_hash":"h","modification_time":1,"cluster_item_key":"shared"}}"#,
        );
        let h = handler(transport, tmp.path());

        let all = h
            .process(AdminRequest::GetFiles { files: None, nodes: None })
            .await
            .payload();
        assert_eq!(all.as_object().unwrap().len(), 3);
        assert_eq!(all["nodeA"]["etc/shared/agent.conf"]["content_hash"], "h");
        assert_eq!(all["master"].as_object().unwrap().len(), 2);

        let narrowed = h
            .process(AdminRequest::GetFiles {
                files: Some(vec!["etc/shared/rules.xml".into()]),
                nodes: Some(vec!["master".into(), "nodeB".into(), "ghost".into()]),
            })
            .await
            .payload();
        assert_eq!(narrowed.as_object().unwrap().len(), 3);
        assert_eq!(narrowed["master"].as_object().unwrap().len(), 1);
        assert!(narrowed["master"]["etc/shared/rules.xml"].is_object());
        assert_eq!(narrowed["nodeB"], json!({}));
        assert!(narrowed["ghost"].is_null());
    }

    #[tokio::test]
    async fn broadcast_get_files_keeps_worker_replies_when_local_snapshot_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = MockTransport::with_workers(&["nodeA"]);
        transport.reply_to("file_status", "ok {}");
        let h = handler(transport, &tmp.path().join("missing-root"));

        let reply = h.process(AdminRequest::GetFiles { files: None, nodes: None }).await;
        assert_eq!(reply.status(), "ok");
        let all = reply.payload();
        assert_eq!(all["nodeA"], json!({}));
        assert!(all["master"].is_null());
    }

    #[tokio::test]
    async fn sync_and_forward() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = MockTransport::with_workers(&["nodeA", "nodeB"]);
        transport.reply_to("request_sync", "ack Starting sync");
        transport.reply_to("echo", "ok-c hi");
        let h = handler(transport, tmp.path());

        let synced = h
            .process(AdminRequest::Sync {
                nodes: Some(vec!["nodeB".into(), "ghost".into()]),
            })
            .await
            .payload();
        assert_eq!(synced["nodeB"], "ack Starting sync");
        assert!(synced["ghost"].is_null());

        let one = h
            .process(AdminRequest::Forward {
                request: "echo".into(),
                target: "nodeA".into(),
                payload: "hi".into(),
            })
            .await;
        assert_eq!(one, AdminReply("ok-c".into(), "hi".into()));

        let all = h
            .process(AdminRequest::Forward {
                request: "echo".into(),
                target: ALL_NODES.into(),
                payload: "hi".into(),
            })
            .await;
        assert_eq!(all.status(), "ok");
        assert_eq!(all.payload()["nodeB"], "ok-c hi");

        let missing = h
            .process(AdminRequest::Forward {
                request: "echo".into(),
                target: "ghost".into(),
                payload: String::new(),
            })
            .await;
        assert_eq!(missing.status(), "err");
    }

    #[tokio::test]
    async fn malformed_request_gets_an_error_reply() {
        let tmp = tempfile::tempdir().unwrap();
        let h = handler(MockTransport::default(), tmp.path());
        let reply = h.process_line("{not json").await;
        assert_eq!(reply.status(), "err");
        assert!(reply.payload()["error"].as_str().unwrap().contains("malformed"));
        let reply = h.process_line(r#"{"command":"get_agents"}"#).await;
        assert_eq!(reply.payload()["totalItems"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn socket_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let socket = tmp.path().join("admin.sock");
        let h = Arc::new(handler(MockTransport::with_workers(&["nodeA"]), tmp.path()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn({
            let socket = socket.clone();
            async move { serve_admin(&socket, h, stop_rx).await }
        });

        let mut reply = None;
        for _ in 0..50 {
            if let Ok(r) = query(&socket, &AdminRequest::GetNodes { nodes: None }).await {
                reply = Some(r);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let reply = reply.expect("admin socket never came up");
        assert_eq!(reply.payload().as_object().unwrap().len(), 2);

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}
