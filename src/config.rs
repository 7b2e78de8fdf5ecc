//! Master configuration, loaded from TOML

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::node::Role;
use crate::protocol::timeouts::REQUEST_MS;
use crate::protocol_core::node_dir;

/// How a file of an item class is written to disk
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Write to a sibling temp file, then rename over the target
    #[default]
    Atomic,
    /// Truncate and write the target in place
    Direct,
}

/// A class of managed files (the `cluster_item_key` of a snapshot record)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ItemClass {
    /// Directory or file, relative to the managed root
    pub path: String,
    /// Role whose copy is authoritative
    pub source: Role,
    #[serde(default)]
    pub write_mode: WriteMode,
    /// Octal umask applied to written files, e.g. "0o117"
    #[serde(default = "default_umask")]
    pub umask: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    /// Only files with these extensions (without dot); empty means all
    #[serde(default)]
    pub extensions: Vec<String>,
}

fn default_umask() -> String {
    "0o117".to_string()
}

fn default_true() -> bool {
    true
}

impl ItemClass {
    /// Parse the umask string ("0o117", "0117" or "117", all octal)
    pub fn umask_bits(&self) -> Result<u32> {
        parse_umask(&self.umask)
    }

    pub fn matches_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.extensions.iter().any(|e| e.trim_start_matches('.') == ext)
    }

    /// Whether cluster path `rel` ('/'-separated) is one of this class's
    /// files: under `path`, one level deep unless recursive, with a listed
    /// extension.
    pub fn covers(&self, rel: &str) -> bool {
        if rel.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return false;
        }
        let base: Vec<String> = Path::new(&self.path)
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        let base = base.join("/");

        let inside = if rel == base {
            true
        } else {
            let rest = if base.is_empty() {
                Some(rel)
            } else {
                rel.strip_prefix(base.as_str()).and_then(|r| r.strip_prefix('/'))
            };
            match rest {
                Some(rest) => self.recursive || !rest.contains('/'),
                None => false,
            }
        };
        inside && self.matches_extension(Path::new(rel))
    }
}

pub fn parse_umask(raw: &str) -> Result<u32> {
    let digits = raw
        .trim()
        .trim_start_matches("0o")
        .trim_start_matches("0O");
    let bits = u32::from_str_radix(digits, 8)
        .with_context(|| format!("invalid umask '{}'", raw))?;
    if bits > 0o777 {
        bail!("umask '{}' out of range", raw);
    }
    Ok(bits)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// Worker listener (host:port)
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Address advertised for this node in node listings
    #[serde(default = "default_node_address")]
    pub node_address: String,
    /// Managed tree root
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Per-node staging area for received archives
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Unix socket for the admin channel
    #[serde(default = "default_admin_socket")]
    pub admin_socket: PathBuf,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_archive")]
    pub max_archive_bytes: u64,
    /// JSON agent inventory served by get_agents
    #[serde(default)]
    pub agents_file: Option<PathBuf>,
    /// JSONL record of sync cycles
    #[serde(default)]
    pub journal_file: Option<PathBuf>,
    #[serde(default)]
    pub items: BTreeMap<String, ItemClass>,
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "master".to_string())
}

fn default_bind() -> String {
    "0.0.0.0:1516".to_string()
}

fn default_node_address() -> String {
    "127.0.0.1".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("fleetsync-staging")
}

fn default_admin_socket() -> PathBuf {
    std::env::temp_dir().join("fleetsync-admin.sock")
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    REQUEST_MS
}

fn default_max_archive() -> u64 {
    512 * 1024 * 1024
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            bind: default_bind(),
            node_address: default_node_address(),
            root: default_root(),
            staging_dir: default_staging_dir(),
            admin_socket: default_admin_socket(),
            refresh_interval_secs: default_refresh_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            request_timeout_ms: default_request_timeout(),
            max_archive_bytes: default_max_archive(),
            agents_file: None,
            journal_file: None,
            items: BTreeMap::new(),
        }
    }
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: MasterConfig =
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            bail!("node_name must not be empty");
        }
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be greater than zero");
        }
        for (key, item) in &self.items {
            item.umask_bits()
                .with_context(|| format!("item '{}'", key))?;
            let p = Path::new(&item.path);
            if p.components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
            {
                bail!("item '{}' path '{}' must stay under the root", key, item.path);
            }
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn item(&self, key: &str) -> Option<&ItemClass> {
        self.items.get(key)
    }

    /// Staging directory of one node; refuses names that are not a single
    /// path component.
    pub fn node_staging(&self, node: &str) -> Result<PathBuf> {
        node_dir(&self.staging_dir, node)
    }
}
