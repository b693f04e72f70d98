use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// One line of the append-only stage ledger (`_runs.jsonl`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: u64,
    pub excluded: u64,
    pub flagged: u64,
}

pub fn append(path: &Path, record: &RunRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io_at(parent, e))?;
    }
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| PipelineError::io_at(path, e))?;
    file.write_all(&line).map_err(|e| PipelineError::io_at(path, e))?;
    Ok(())
}

pub fn read_all(path: &Path) -> Result<Vec<RunRecord>> {
    crate::storage::read_jsonl(path)
}
