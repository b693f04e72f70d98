//! Read-only view of the raw dataset tree.
//!
//! ```text
//! <raw_root>/
//!   data/chunk-000/episode_000000.parquet
//!   videos/chunk-000/observation.images.front/episode_000000.mp4
//!   meta/episodes.jsonl
//!   meta/episodes_stats.jsonl
//!   meta/info.json            (optional)
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::constants::{chunk_dir_name, episode_file_stem, ACTION_COL, OBS_STATE_COL};
use crate::error::{PipelineError, Result};
use crate::storage;

static CHUNK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^chunk-(\w+)$").expect("valid regex"));
static EPISODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^episode_(\d+)\.(parquet|mp4)$").expect("valid regex"));

/// Parse `chunk-000` into `000`.
pub fn parse_chunk_name(name: &str) -> Option<String> {
    CHUNK_RE.captures(name).map(|c| c[1].to_string())
}

/// Parse `episode_000042.parquet` / `.mp4` into 42.
pub fn parse_episode_file_name(name: &str) -> Option<u64> {
    EPISODE_RE.captures(name).and_then(|c| c[1].parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
struct EpisodeMetaLine {
    episode_index: u64,
    length: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfoFeature {
    #[serde(default)]
    pub shape: Vec<usize>,
}

/// The subset of `meta/info.json` the pipeline consults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetInfo {
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub features: BTreeMap<String, InfoFeature>,
}

impl DatasetInfo {
    pub fn declared_width(&self, feature: &str) -> Option<usize> {
        self.features
            .get(feature)
            .and_then(|f| f.shape.first().copied())
    }
}

/// Episode-level metadata used by validation.
#[derive(Debug, Clone, Default)]
pub struct DatasetMeta {
    pub lengths: BTreeMap<u64, u64>,
    pub info: Option<DatasetInfo>,
}

impl DatasetMeta {
    pub fn action_width(&self, fallback: usize) -> usize {
        self.info
            .as_ref()
            .and_then(|i| i.declared_width(ACTION_COL))
            .unwrap_or(fallback)
    }

    pub fn state_width(&self, fallback: usize) -> usize {
        self.info
            .as_ref()
            .and_then(|i| i.declared_width(OBS_STATE_COL))
            .unwrap_or(fallback)
    }

    pub fn fps(&self, fallback: f64) -> f64 {
        self.info.as_ref().and_then(|i| i.fps).unwrap_or(fallback)
    }
}

#[derive(Debug, Clone)]
pub struct RawDataset {
    root: PathBuf,
}

impl RawDataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn episodes_stats_path(&self) -> PathBuf {
        self.meta_dir().join("episodes_stats.jsonl")
    }

    pub fn parquet_path(&self, chunk: &str, episode_index: u64) -> PathBuf {
        self.root
            .join("data")
            .join(chunk_dir_name(chunk))
            .join(format!("{}.parquet", episode_file_stem(episode_index)))
    }

    pub fn video_path(&self, chunk: &str, camera: &str, episode_index: u64) -> PathBuf {
        self.root
            .join("videos")
            .join(chunk_dir_name(chunk))
            .join(camera)
            .join(format!("{}.mp4", episode_file_stem(episode_index)))
    }

    /// Chunks found under either `data/` or `videos/`, sorted.
    pub fn list_chunks(&self) -> Vec<String> {
        let mut chunks = BTreeSet::new();
        for sub in ["data", "videos"] {
            for entry in list_dir_sorted(&self.root.join(sub)) {
                if !entry.is_dir() {
                    continue;
                }
                let name = file_name(&entry);
                match parse_chunk_name(&name) {
                    Some(c) => {
                        chunks.insert(c);
                    }
                    None => warn!("Ignoring unexpected directory {}", entry.display()),
                }
            }
        }
        chunks.into_iter().collect()
    }

    /// Episode parquet files in a chunk, keyed by episode index.
    pub fn list_parquets(&self, chunk: &str) -> BTreeMap<u64, PathBuf> {
        let dir = self.root.join("data").join(chunk_dir_name(chunk));
        episode_files(&dir, "parquet")
    }

    /// Episode video files for one camera in a chunk.
    pub fn list_videos(&self, chunk: &str, camera: &str) -> BTreeMap<u64, PathBuf> {
        let dir = self.root.join("videos").join(chunk_dir_name(chunk)).join(camera);
        episode_files(&dir, "mp4")
    }

    /// Load `meta/episodes.jsonl` (required) and `meta/info.json` (optional).
    pub fn load_meta(&self) -> Result<DatasetMeta> {
        let episodes_path = self.meta_dir().join("episodes.jsonl");
        let lines: Vec<EpisodeMetaLine> = storage::read_jsonl(&episodes_path).map_err(|e| {
            PipelineError::Meta(format!("{}: {}", episodes_path.display(), e))
        })?;
        let lengths = lines
            .into_iter()
            .map(|l| (l.episode_index, l.length))
            .collect();

        let info_path = self.meta_dir().join("info.json");
        let info = storage::read_json_opt::<DatasetInfo>(&info_path)
            .map_err(|e| PipelineError::Meta(format!("{}: {}", info_path.display(), e)))?;

        Ok(DatasetMeta { lengths, info })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn list_dir_sorted(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e.into_path()),
            Err(err) => {
                warn!("Skipping unreadable entry under {}: {}", dir.display(), err);
                None
            }
        })
        .collect()
}

fn episode_files(dir: &Path, extension: &str) -> BTreeMap<u64, PathBuf> {
    let mut out = BTreeMap::new();
    for path in list_dir_sorted(dir) {
        if !path.is_file() {
            continue;
        }
        let name = file_name(&path);
        if !name.ends_with(extension) {
            continue;
        }
        match parse_episode_file_name(&name) {
            Some(idx) => {
                out.insert(idx, path);
            }
            None => warn!("Ignoring badly named episode file {}", path.display()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn parses_layout_names() {
        assert_eq!(parse_chunk_name("chunk-000").as_deref(), Some("000"));
        assert_eq!(parse_chunk_name("chunks"), None);
        assert_eq!(parse_episode_file_name("episode_000042.parquet"), Some(42));
        assert_eq!(parse_episode_file_name("episode_7.mp4"), Some(7));
        assert_eq!(parse_episode_file_name("episode_x.parquet"), None);
        assert_eq!(parse_episode_file_name("episode_000001.parquet.tmp"), None);
    }

    #[test]
    fn lists_chunks_from_data_and_videos() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data/chunk-000")).unwrap();
        fs::create_dir_all(dir.path().join("videos/chunk-001/observation.images.front")).unwrap();
        fs::create_dir_all(dir.path().join("data/scratch")).unwrap();

        let raw = RawDataset::new(dir.path());
        assert_eq!(raw.list_chunks(), vec!["000".to_string(), "001".to_string()]);
    }

    #[test]
    fn missing_episodes_meta_is_fatal() {
        let dir = tempdir().unwrap();
        let raw = RawDataset::new(dir.path());
        assert!(matches!(raw.load_meta(), Err(PipelineError::Meta(_))));
    }

    #[test]
    fn info_overrides_widths_and_fps() {
        let dir = tempdir().unwrap();
        let meta = dir.path().join("meta");
        fs::create_dir_all(&meta).unwrap();
        fs::write(meta.join("episodes.jsonl"), "{\"episode_index\":0,\"length\":10,\"tasks\":[\"pick\"]}\n").unwrap();
        fs::write(
            meta.join("info.json"),
            r#"{"fps": 15, "features": {"action": {"dtype": "float32", "shape": [6]}}}"#,
        )
        .unwrap();

        let meta = RawDataset::new(dir.path()).load_meta().unwrap();
        assert_eq!(meta.lengths.get(&0), Some(&10));
        assert_eq!(meta.action_width(8), 6);
        assert_eq!(meta.state_width(8), 8);
        assert_eq!(meta.fps(30.0), 15.0);
    }
}
