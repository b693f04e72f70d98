//! Durable artifact storage: atomic writes and canonical JSON/JSONL.
//!
//! Every stage reads only what its predecessor wrote through this module.
//! Writes go to a temporary sibling and are renamed into place, so a reader
//! either sees the previous artifact or the complete new one.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Locations of every artifact under the work root.
#[derive(Debug, Clone)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("manifest").join("episodes.json")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.root.join("validation")
    }

    pub fn validation_results(&self) -> PathBuf {
        self.validation_dir().join("episodes.json")
    }

    pub fn validation_failures(&self) -> PathBuf {
        self.validation_dir().join("failures.jsonl")
    }

    pub fn validated_episodes(&self) -> PathBuf {
        self.validation_dir().join("validated_episodes.jsonl")
    }

    pub fn validated_ids(&self) -> PathBuf {
        self.validation_dir().join("validated_ids.json")
    }

    pub fn validation_summary(&self) -> PathBuf {
        self.validation_dir().join("summary.json")
    }

    pub fn global_stats(&self) -> PathBuf {
        self.root.join("stats").join("global_stats.json")
    }

    pub fn normalized_dir(&self) -> PathBuf {
        self.root.join("normalized")
    }

    pub fn transform_report(&self) -> PathBuf {
        self.normalized_dir().join("_report.json")
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.root.join("dataset")
    }

    pub fn run_log(&self) -> PathBuf {
        self.root.join("_runs.jsonl")
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` via a temporary file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io_at(parent, e))?;
    }
    let tmp = tmp_sibling(path);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| PipelineError::io_at(&tmp, e))?;
        file.write_all(bytes)
            .map_err(|e| PipelineError::io_at(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| PipelineError::io_at(path, e))?;
    Ok(())
}

/// Pretty JSON with a trailing newline. Map ordering comes from the types
/// (BTreeMap everywhere), which keeps reruns byte-identical.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &to_canonical_json(value)?)
}

pub fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut bytes = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut bytes, row)?;
        bytes.push(b'\n');
    }
    write_atomic(path, &bytes)
}

/// Read a required JSON artifact; absence is reported as `MissingArtifact`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::MissingArtifact(path.to_path_buf()))
        }
        Err(e) => return Err(PipelineError::io_at(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|e| PipelineError::invalid(path, e.to_string()))
}

/// Read an optional JSON artifact; `None` when the file does not exist.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match read_json(path) {
        Ok(v) => Ok(Some(v)),
        Err(PipelineError::MissingArtifact(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read a JSONL artifact, skipping blank lines. Any bad line fails the read.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::MissingArtifact(path.to_path_buf()))
        }
        Err(e) => return Err(PipelineError::io_at(path, e)),
    };
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| PipelineError::invalid(path, format!("line {}: {}", n + 1, e)))
        })
        .collect()
}
