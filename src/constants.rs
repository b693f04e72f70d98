//! Column and file-layout constants shared by every stage.

// Frame table columns (dotted names match the raw parquet schema)
pub const ACTION_COL: &str = "action";
pub const OBS_STATE_COL: &str = "observation.state";
pub const TIMESTAMP_COL: &str = "timestamp";
pub const FRAME_INDEX_COL: &str = "frame_index";
pub const EPISODE_INDEX_COL: &str = "episode_index";
pub const TASK_INDEX_COL: &str = "task_index";
pub const GLOBAL_INDEX_COL: &str = "index";

/// Columns every episode table must carry.
pub const REQUIRED_COLUMNS: [&str; 6] = [
    ACTION_COL,
    OBS_STATE_COL,
    TIMESTAMP_COL,
    FRAME_INDEX_COL,
    EPISODE_INDEX_COL,
    TASK_INDEX_COL,
];

/// Features z-score normalized by the transform stage.
pub const NORMALIZED_FEATURES: [&str; 2] = [ACTION_COL, OBS_STATE_COL];

// Robot state/action width (7 DOF + gripper)
pub const DEFAULT_VECTOR_WIDTH: usize = 8;

// Partition labels added to every materialized episode table
pub const SPLIT_COL: &str = "split";
pub const CHUNK_COL: &str = "chunk";

// Files below this size are never re-stat'ed for stability
pub const STABILITY_MIN_BYTES: u64 = 50 * 1024 * 1024;
pub const STABILITY_PAUSE_MS: u64 = 150;

pub const FRONT_CAMERA: &str = "observation.images.front";
pub const WRIST_CAMERA: &str = "observation.images.wrist";

// Stage versions recorded in artifacts for provenance
pub const FINGERPRINT_ALGO: &str = "sha256-content-v1";
pub const FINGERPRINT_ALGO_SAMPLED: &str = "sha256-size-head-tail-v1";
pub const DISCOVER_VERSION: &str = "discover-v1";
pub const VALIDATE_VERSION: &str = "validate-v1";
pub const STATS_VERSION: &str = "stats-v1";
pub const TRANSFORM_VERSION: &str = "transform-v1";
pub const MATERIALIZE_VERSION: &str = "materialize-v1";

pub fn episode_file_stem(episode_index: u64) -> String {
    format!("episode_{:06}", episode_index)
}

pub fn chunk_dir_name(chunk: &str) -> String {
    format!("chunk-{}", chunk)
}
