use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_VECTOR_WIDTH, FRONT_CAMERA, NORMALIZED_FEATURES, STABILITY_MIN_BYTES,
    STABILITY_PAUSE_MS, WRIST_CAMERA,
};
use crate::error::{PipelineError, Result};

/// Pipeline configuration, usually loaded from `pipeline.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub discover: DiscoverConfig,
    pub validate: ValidateConfig,
    pub stats: StatsConfig,
    pub transform: TransformConfig,
    pub materialize: MaterializeConfig,
    /// Worker threads for per-episode work
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_root: PathBuf,
    pub work_root: PathBuf,
    pub log_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverConfig {
    /// Camera directories under `videos/chunk-*/`. The first one is required.
    pub cameras: Vec<String>,
    /// Treat every camera as required, not just the first
    pub require_all_cameras: bool,
    /// Hash only head/tail windows of this size (0 = hash full contents)
    pub sample_bytes: u64,
    /// Restrict scanning to these chunks; empty scans every chunk
    pub only_chunks: Vec<String>,
    /// Files at least this large are stat'ed twice to catch in-flight copies
    pub stability_min_bytes: u64,
    pub stability_pause_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidateConfig {
    pub target_fps: f64,
    pub fps_tolerance: f64,
    /// Allowed difference between row count and meta length / video frames
    pub frame_tolerance: u64,
    /// Null rows at or below this fraction are recoverable warnings
    pub max_null_row_fraction: f64,
    pub skip_video: bool,
    pub action_dim: usize,
    pub state_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Features to reduce; empty means every feature found
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub normalize: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkMode {
    Symlink,
    Copy,
    Hardlink,
    ManifestOnly,
}

impl LinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMode::Symlink => "symlink",
            LinkMode::Copy => "copy",
            LinkMode::Hardlink => "hardlink",
            LinkMode::ManifestOnly => "manifest-only",
        }
    }
}

impl std::str::FromStr for LinkMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "symlink" => Ok(LinkMode::Symlink),
            "copy" => Ok(LinkMode::Copy),
            "hardlink" => Ok(LinkMode::Hardlink),
            "manifest-only" => Ok(LinkMode::ManifestOnly),
            other => Err(PipelineError::Config(format!("Unknown link mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializeConfig {
    pub seed: u64,
    pub train: f64,
    pub val: f64,
    pub test: f64,
    pub link_videos: LinkMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            discover: DiscoverConfig::default(),
            validate: ValidateConfig::default(),
            stats: StatsConfig::default(),
            transform: TransformConfig::default(),
            materialize: MaterializeConfig::default(),
            workers: 8,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_root: PathBuf::from("robot_data"),
            work_root: PathBuf::from("output"),
            log_dir: "logs".to_string(),
        }
    }
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            cameras: vec![FRONT_CAMERA.to_string(), WRIST_CAMERA.to_string()],
            require_all_cameras: false,
            sample_bytes: 0,
            only_chunks: Vec::new(),
            stability_min_bytes: STABILITY_MIN_BYTES,
            stability_pause_ms: STABILITY_PAUSE_MS,
        }
    }
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            target_fps: 30.0,
            fps_tolerance: 1.0,
            frame_tolerance: 2,
            max_null_row_fraction: 0.05,
            skip_video: false,
            action_dim: DEFAULT_VECTOR_WIDTH,
            state_dim: DEFAULT_VECTOR_WIDTH,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            features: NORMALIZED_FEATURES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self { normalize: true }
    }
}

impl Default for MaterializeConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            train: 0.8,
            val: 0.1,
            test: 0.1,
            link_videos: LinkMode::Symlink,
        }
    }
}

impl Config {
    /// Read a TOML config file. Missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PIPELINE_*` environment overrides.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(v) = std::env::var("PIPELINE_RAW_ROOT") {
            self.paths.raw_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PIPELINE_WORK_ROOT") {
            self.paths.work_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PIPELINE_WORKERS") {
            self.workers = v
                .parse()
                .map_err(|_| PipelineError::Config(format!("PIPELINE_WORKERS='{}' is not a number", v)))?;
        }
        if let Ok(v) = std::env::var("PIPELINE_ONLY_CHUNKS") {
            self.discover.only_chunks = v
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = std::env::var("PIPELINE_SKIP_VIDEO") {
            self.validate.skip_video = matches!(v.as_str(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be at least 1".into()));
        }
        // manifest rows carry a front and an optional wrist reference
        if self.discover.cameras.is_empty() || self.discover.cameras.len() > 2 {
            return Err(PipelineError::Config(
                "cameras must list one or two views (front, then wrist)".into(),
            ));
        }
        if self.validate.action_dim == 0 || self.validate.state_dim == 0 {
            return Err(PipelineError::Config("vector widths must be positive".into()));
        }
        let m = &self.materialize;
        if [m.train, m.val, m.test].iter().any(|f| *f < 0.0) {
            return Err(PipelineError::Config("split fractions must be non-negative".into()));
        }
        if ((m.train + m.val + m.test) - 1.0).abs() > 1e-9 {
            return Err(PipelineError::Config(format!(
                "train+val+test must equal 1.0 (got {})",
                m.train + m.val + m.test
            )));
        }
        Ok(())
    }

    /// Build a thread pool sized by `workers`.
    pub fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        Ok(rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()?)
    }
}
