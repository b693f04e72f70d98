use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Required artifact missing: {0}")]
    MissingArtifact(PathBuf),

    #[error("Artifact {path} is invalid: {reason}")]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("Dataset metadata unavailable: {0}")]
    Meta(String),

    #[error("Episode {episode_index} references missing video {path}")]
    MissingVideo { episode_index: u64, path: PathBuf },

    #[error("Global stats lack feature '{0}' required for normalization")]
    StatsIncomplete(String),

    #[error("Step '{step}' depends on '{dependency}' which has not run earlier in the pipeline")]
    StepOrder { step: String, dependency: String },
}

impl PipelineError {
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::IoAt {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::InvalidArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
