//! Agent inventory served by the admin `get_agents` query

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub trait AgentInventory: Send + Sync {
    /// Agents, optionally only those whose status matches (case-insensitive)
    fn agents(&self, status: Option<&str>) -> Result<Value>;
}

/// Inventory with no agents
pub struct NoAgents;

impl AgentInventory for NoAgents {
    fn agents(&self, _status: Option<&str>) -> Result<Value> {
        Ok(listing(Vec::new()))
    }
}

/// Inventory read from a JSON array of agent objects on every query
pub struct JsonFileInventory {
    path: PathBuf,
}

impl JsonFileInventory {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl AgentInventory for JsonFileInventory {
    fn agents(&self, status: Option<&str>) -> Result<Value> {
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("read agent inventory {}", self.path.display()))?;
        let all: Vec<Value> = serde_json::from_slice(&raw)
            .with_context(|| format!("parse agent inventory {}", self.path.display()))?;

        let items = match status {
            Some(wanted) => all
                .into_iter()
                .filter(|agent| {
                    agent
                        .get("status")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s.eq_ignore_ascii_case(wanted))
                })
                .collect(),
            None => all,
        };
        Ok(listing(items))
    }
}

fn listing(items: Vec<Value>) -> Value {
    json!({ "totalItems": items.len(), "items": items })
}
