use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Discovery classification of an episode relative to the prior manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    New,
    Unchanged,
    Changed,
    Missing,
    /// A source file was still growing when scanned
    Pending,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::New => "new",
            EpisodeStatus::Unchanged => "unchanged",
            EpisodeStatus::Changed => "changed",
            EpisodeStatus::Missing => "missing",
            EpisodeStatus::Pending => "pending",
        }
    }
}

/// One row of the discovery manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub episode_index: u64,
    pub chunk: String,
    pub parquet_uri: Option<String>,
    pub video_front_uri: Option<String>,
    pub video_wrist_uri: Option<String>,
    pub bytes_total: u64,
    pub fingerprint: Option<String>,
    pub status: EpisodeStatus,
    /// Audit note for incomplete or unreadable sources
    pub errors: Option<String>,
}

/// The durable discovery manifest, entries sorted by `episode_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub fingerprint_algo: String,
    pub stage_version: String,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn get(&self, episode_index: u64) -> Option<&ManifestEntry> {
        self.entries
            .binary_search_by_key(&episode_index, |e| e.episode_index)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn status_counts(&self) -> BTreeMap<EpisodeStatus, u64> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Machine-readable reason codes for validation issues and warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    MissingSource,
    UnreadableTable,
    SchemaMismatch,
    WidthMismatch,
    NullValues,
    BadFrameOrder,
    BadTimestampOrder,
    EpisodeIndexMismatch,
    LengthMismatch,
    EmptyEpisode,
    VideoMissing,
    VideoFpsMismatch,
    VideoFrameCountMismatch,
    // Recoverable during transform; recorded as warnings
    DuplicateFrames,
    FrameIndexGap,
    NullRowsRecoverable,
    MetaLengthMissing,
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub code: IssueCode,
    pub detail: String,
}

impl Issue {
    pub fn new(code: IssueCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Per-episode outcome of the validation battery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub episode_index: u64,
    pub chunk: String,
    pub fingerprint: Option<String>,
    pub passed: bool,
    pub issues: Vec<Issue>,
    pub warnings: Vec<Issue>,
    pub checked_fields: Vec<String>,
    pub rows: Option<u64>,
    pub expected_rows: Option<u64>,
    pub frame_min: Option<i64>,
    pub frame_max: Option<i64>,
    /// Digest of the limits and meta length the verdict was computed under
    #[serde(default)]
    pub checks_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub episode_index: u64,
    pub issues: Vec<Issue>,
}

/// A passing episode, carried to every later stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedEpisode {
    pub episode_index: u64,
    pub chunk: String,
    pub fingerprint: Option<String>,
    pub rows: u64,
    pub parquet_uri: String,
    pub video_front_uri: Option<String>,
    pub video_wrist_uri: Option<String>,
    /// Codes of recoverable defects the transform stage will repair
    pub warnings: Vec<IssueCode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total: u64,
    pub validated: u64,
    pub failed: u64,
    /// Entries skipped because their sources were still being written
    pub pending: u64,
    pub reused: u64,
    pub issue_histogram: BTreeMap<IssueCode, u64>,
    pub warning_histogram: BTreeMap<IssueCode, u64>,
}

/// Aggregated statistics for one feature; every vector has the feature's width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub count: Vec<u64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureStats {
    pub fn dims(&self) -> usize {
        self.mean.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedContribution {
    pub episode_index: u64,
    pub feature: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReductionMeta {
    pub episodes_used: u64,
    pub episodes_without_stats: Vec<u64>,
    pub dropped: Vec<DroppedContribution>,
    /// Per-episode keys that are not merged (quantiles and the like)
    pub ignored_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub stats_version: String,
    pub stats_id: String,
    pub features: BTreeMap<String, FeatureStats>,
    pub meta: ReductionMeta,
}

/// Row accounting for one normalized episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEpisodeReport {
    pub episode_index: u64,
    pub chunk: String,
    pub source_fingerprint: Option<String>,
    pub output_uri: Option<String>,
    pub rows_in: u64,
    pub rows_out: u64,
    pub dropped_width: u64,
    pub dropped_null: u64,
    pub dropped_duplicate: u64,
    pub normalized: bool,
    /// Zero rows survived cleaning
    pub anomalous: bool,
    /// Set when the episode could not be transformed at all
    pub error: Option<String>,
    pub video_front_uri: Option<String>,
    pub video_wrist_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformReport {
    pub stage_version: String,
    pub stats_id: Option<String>,
    pub episodes: Vec<NormalizedEpisodeReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetIndexRow {
    pub split: Split,
    pub chunk: String,
    pub episode_index: u64,
    pub parquet_path: String,
    pub videos: BTreeMap<String, Option<String>>,
    pub num_rows: u64,
    pub anomalous: bool,
}

/// Provenance record written next to the materialized dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub dataset_id: String,
    pub seed: u64,
    pub fractions: BTreeMap<Split, f64>,
    pub counts: BTreeMap<Split, u64>,
    pub link_videos: String,
    pub cameras: Vec<String>,
    pub stats_id: Option<String>,
    pub source_fingerprints: BTreeMap<u64, Option<String>>,
    pub stage_versions: BTreeMap<String, String>,
    pub flagged_episodes: Vec<u64>,
}
