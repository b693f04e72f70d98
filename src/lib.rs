pub mod config;
pub mod constants;
pub mod dataset;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod pipeline;
pub mod run_log;
pub mod storage;
pub mod types;
pub mod video;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineStep, StepContext, StepResult};
