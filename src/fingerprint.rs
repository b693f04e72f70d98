use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::constants::{FINGERPRINT_ALGO, FINGERPRINT_ALGO_SAMPLED};
use crate::error::{PipelineError, Result};

const READ_BUF: usize = 1024 * 1024;

/// Digest of one file: its size plus a SHA-256 over its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256_hex: String,
}

/// How much of each file is hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintMode {
    Full,
    /// Head and tail windows of this many bytes, plus the size
    Sampled(u64),
}

impl FingerprintMode {
    pub fn from_sample_bytes(sample_bytes: u64) -> Self {
        if sample_bytes == 0 {
            FingerprintMode::Full
        } else {
            FingerprintMode::Sampled(sample_bytes)
        }
    }

    pub fn algo(&self) -> &'static str {
        match self {
            FingerprintMode::Full => FINGERPRINT_ALGO,
            FingerprintMode::Sampled(_) => FINGERPRINT_ALGO_SAMPLED,
        }
    }
}

/// Double-stat guard against hashing a file that is still being copied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityCheck {
    /// Smaller files are taken as settled without waiting
    pub min_bytes: u64,
    pub pause: Duration,
}

impl StabilityCheck {
    pub fn new(min_bytes: u64, pause_ms: u64) -> Self {
        Self {
            min_bytes,
            pause: Duration::from_millis(pause_ms),
        }
    }

    /// False when the file vanished or its size or mtime moved during the pause.
    pub fn is_settled(&self, path: &Path) -> bool {
        let Some(first) = file_state(path) else {
            return false;
        };
        if first.0 < self.min_bytes {
            return true;
        }
        std::thread::sleep(self.pause);
        file_state(path) == Some(first)
    }
}

fn file_state(path: &Path) -> Option<(u64, Option<SystemTime>)> {
    let meta = fs::metadata(path).ok()?;
    Some((meta.len(), meta.modified().ok()))
}

pub fn digest_file(path: &Path, mode: FingerprintMode) -> Result<FileDigest> {
    let mut file = File::open(path).map_err(|e| PipelineError::io_at(path, e))?;
    let size = file
        .metadata()
        .map_err(|e| PipelineError::io_at(path, e))?
        .len();

    let mut hasher = Sha256::new();
    match mode {
        FingerprintMode::Full => {
            let mut buf = vec![0u8; READ_BUF];
            loop {
                let n = file.read(&mut buf).map_err(|e| PipelineError::io_at(path, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        FingerprintMode::Sampled(window) => {
            let mut head = Vec::new();
            (&mut file)
                .take(window)
                .read_to_end(&mut head)
                .map_err(|e| PipelineError::io_at(path, e))?;
            hasher.update(&head);
            if size > window {
                file.seek(SeekFrom::Start(size.saturating_sub(window)))
                    .map_err(|e| PipelineError::io_at(path, e))?;
                let mut tail = Vec::new();
                file.read_to_end(&mut tail)
                    .map_err(|e| PipelineError::io_at(path, e))?;
                hasher.update(&tail);
            }
        }
    }

    Ok(FileDigest {
        size,
        sha256_hex: hex::encode(hasher.finalize()),
    })
}

/// Combine per-role digests into one episode fingerprint.
///
/// Roles (e.g. `parquet`, a camera name) stand in for paths so a copied or
/// relocated dataset keeps its fingerprints. The canonical string is sorted by
/// role, which makes the result independent of argument order.
pub fn combine_fingerprint(parts: &[(String, FileDigest)]) -> String {
    let mut sorted: Vec<&(String, FileDigest)> = parts.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut s = String::new();
    for (role, digest) in sorted {
        s.push_str(role);
        s.push('|');
        s.push_str(&digest.size.to_string());
        s.push('|');
        s.push_str(&digest.sha256_hex);
        s.push('\n');
    }

    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint a set of role-tagged files. Pure apart from reading them.
pub fn fingerprint(files: &[(String, &Path)], mode: FingerprintMode) -> Result<(String, u64)> {
    let mut parts = Vec::with_capacity(files.len());
    let mut bytes_total = 0;
    for (role, path) in files {
        let digest = digest_file(path, mode)?;
        bytes_total += digest.size;
        parts.push((role.clone(), digest));
    }
    Ok((combine_fingerprint(&parts), bytes_total))
}
