//! Shared protocol logic: frame headers, message envelopes, reply parsing and
//! path normalization under the managed root.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::node::Role;
use crate::protocol::{frame, MAGIC, MAX_FRAME_SIZE, VERSION};

/// Protocol failures callers may want to tell apart from plain I/O errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic in frame header")]
    BadMagic,
    #[error("protocol version mismatch: got {got}, expected {expected}")]
    VersionMismatch { got: u16, expected: u16 },
    #[error("frame payload too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("frame type {0} does not match its payload")]
    FrameMismatch(u8),
    #[error("{0} not included in received archive")]
    MissingManifest(String),
    #[error("node {0} is not connected")]
    UnknownNode(String),
    #[error("archive {name} exceeds {max} bytes")]
    ArchiveTooLarge { name: String, max: u64 },
    #[error("connection to {0} closed")]
    ConnectionClosed(String),
    #[error("invalid node name {0:?}")]
    InvalidNodeName(String),
}

/// Worker introduction, the first frame on every connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub name: String,
    pub role: Role,
}

/// Everything that travels on a worker connection after the frame header.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    HelloAck { master: String },
    Request { id: u64, command: String, payload: Vec<u8> },
    Response { id: u64, reply: String },
    ArchiveData { name: String, chunk: Vec<u8> },
    ArchiveEnd { name: String },
}

impl Message {
    pub fn frame_type(&self) -> u8 {
        match self {
            Message::Hello(_) => frame::HELLO,
            Message::HelloAck { .. } => frame::HELLO_ACK,
            Message::Request { .. } => frame::REQUEST,
            Message::Response { .. } => frame::RESPONSE,
            Message::ArchiveData { .. } => frame::ARCHIVE_DATA,
            Message::ArchiveEnd { .. } => frame::ARCHIVE_END,
        }
    }

    /// Serialize into (frame type, payload)
    pub fn encode(&self) -> Result<(u8, Vec<u8>)> {
        let payload = bincode::serialize(self).context("encode message")?;
        validate_frame_size(payload.len())?;
        Ok((self.frame_type(), payload))
    }

    pub fn decode(frame_type: u8, payload: &[u8]) -> Result<Message> {
        let msg: Message = bincode::deserialize(payload).context("decode message")?;
        if msg.frame_type() != frame_type {
            return Err(ProtocolError::FrameMismatch(frame_type).into());
        }
        Ok(msg)
    }
}

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; 11] {
    let mut header = [0u8; 11];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; 11]) -> Result<(u8, u32)> {
    if &header[0..4] != MAGIC {
        return Err(ProtocolError::BadMagic.into());
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(ProtocolError::VersionMismatch {
            got: version,
            expected: VERSION,
        }
        .into());
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

    Ok((frame_type, payload_len))
}

/// Build a "<status> <payload>" reply string
pub fn join_reply(status: &str, payload: &str) -> String {
    format!("{} {}", status, payload)
}

/// Split a reply into status token and payload on the first space.
/// A reply without a space is all status.
pub fn split_reply(reply: &str) -> (&str, &str) {
    match reply.split_once(' ') {
        Some((status, payload)) => (status, payload),
        None => (reply, ""),
    }
}

/// Normalize a cluster path (relative, '/'-separated) to be safely under a root directory.
/// Rejects absolute paths, parent components and NUL bytes, canonicalizes what
/// already exists to resolve symlinks, and ensures the result stays under root.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    bail!("path component contains colon (potential ADS attack)");
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("empty path");
    }

    let root = canonicalize_lenient(root)?;
    let final_path = canonicalize_lenient(&root.join(&safe))?;

    if !final_path.starts_with(&root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }

    Ok(final_path)
}

/// A node name doubles as its staging directory name, so it must be exactly
/// one plain path component.
pub fn validate_node_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c.to_str() == Some(name)
    );
    if !single || name.contains(['/', '\\', '\0']) {
        return Err(ProtocolError::InvalidNodeName(name.to_string()).into());
    }
    Ok(())
}

/// Staging directory of `node` under `staging`
pub fn node_dir(staging: &Path, node: &str) -> Result<PathBuf> {
    validate_node_name(node)?;
    Ok(staging.join(node))
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// missing tail, so symlinks are resolved even for files not yet created.
fn canonicalize_lenient(path: &Path) -> Result<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
    let mut base = existing
        .canonicalize()
        .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", existing, e))?;
    for name in tail.into_iter().rev() {
        base.push(name);
    }
    Ok(base)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("create directory {}", path.display()))?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}
