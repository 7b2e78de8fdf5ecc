use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Worker already matched golden
    InSync,
    /// Corrective archive sent and acknowledged
    Corrected,
    /// Corrective archive not acknowledged; retried on the worker's next sync
    NotConverged,
    Failed,
    Cancelled,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SyncJournalEntry {
    pub timestamp: String,
    pub node: String,
    pub archive: String,
    pub outcome: SyncOutcome,
    pub bytes_received: u64,
    pub error: Option<String>,
}

impl SyncJournalEntry {
    pub fn now(node: &str, archive: &str, outcome: SyncOutcome, bytes_received: u64) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            node: node.to_string(),
            archive: archive.to_string(),
            outcome,
            bytes_received,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Append-only JSONL record of reconciliation cycles
pub struct SyncJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SyncJournal {
    pub fn new(path: &Path) -> Self {
        SyncJournal {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn add_entry(&self, entry: &SyncJournalEntry) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open sync journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Best-effort append; failures are logged, never propagated
    pub fn record(&self, entry: SyncJournalEntry) {
        if let Err(e) = self.add_entry(&entry) {
            tracing::warn!(journal = %self.path.display(), error = %e, "could not write sync journal");
        }
    }

    pub fn read_entries(&self) -> Result<Vec<SyncJournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).context("Failed to open sync journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}
