//! The five-stage episode pipeline.
//!
//! Discover → Validate → Stats → Align/Transform → Materialize. Every step
//! reads only the durable artifacts of its predecessors and writes its own,
//! so any step can be rerun on its own.

pub mod moments;
pub mod steps;
pub mod table;

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::dataset::RawDataset;
use crate::error::{PipelineError, Result};
use crate::run_log::{self, RunRecord};
use crate::storage::WorkLayout;
use crate::video::{FfprobeProbe, VideoProbe};

/// Everything a step may read: configuration, the raw tree, the work root
/// and the video probe. Steps share no mutable state.
#[derive(Clone)]
pub struct StepContext {
    pub config: Config,
    pub raw: RawDataset,
    pub layout: WorkLayout,
    pub probe: Arc<dyn VideoProbe>,
}

impl StepContext {
    pub fn new(config: Config) -> Self {
        Self::with_probe(config, Arc::new(FfprobeProbe::default()))
    }

    pub fn with_probe(config: Config, probe: Arc<dyn VideoProbe>) -> Self {
        Self {
            raw: RawDataset::new(&config.paths.raw_root),
            layout: WorkLayout::new(&config.paths.work_root),
            config,
            probe,
        }
    }
}

/// Common trait for all pipeline steps
pub trait PipelineStep: Send + Sync {
    /// Execute this step against durable inputs, writing durable outputs
    fn execute(&self, ctx: &StepContext) -> Result<StepResult>;

    fn step_name(&self) -> &'static str;

    /// Steps whose artifacts this step reads
    fn dependencies(&self) -> Vec<&'static str>;
}

/// Terminal summary of one step: what was processed, excluded or flagged and why.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub processed: u64,
    pub excluded: u64,
    pub flagged: u64,
    pub reasons: BTreeMap<String, u64>,
    pub message: String,
}

impl StepResult {
    pub fn new(step: &str, processed: u64, message: String) -> Self {
        Self {
            step: step.to_string(),
            processed,
            excluded: 0,
            flagged: 0,
            reasons: BTreeMap::new(),
            message,
        }
    }

    pub fn with_excluded(mut self, excluded: u64) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn with_flagged(mut self, flagged: u64) -> Self {
        self.flagged = flagged;
        self
    }

    pub fn with_reasons(mut self, reasons: BTreeMap<String, u64>) -> Self {
        self.reasons = reasons;
        self
    }
}

/// Runs steps in order after checking that each dependency ran earlier.
pub struct Pipeline {
    steps: Vec<Box<dyn PipelineStep>>,
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn PipelineStep>>) -> Self {
        Self { steps }
    }

    /// All five stages in canonical order.
    pub fn full() -> Self {
        Self::new(vec![
            Box::new(steps::DiscoverStep),
            Box::new(steps::ValidateStep),
            Box::new(steps::StatsStep),
            Box::new(steps::AlignTransformStep),
            Box::new(steps::MaterializeStep),
        ])
    }

    /// Check that no step depends on one scheduled after it. Dependencies
    /// not scheduled at all are satisfied by artifacts from earlier runs.
    pub fn check_order(&self) -> Result<()> {
        let scheduled: HashSet<&str> = self.steps.iter().map(|s| s.step_name()).collect();
        let mut seen = HashSet::new();
        for step in &self.steps {
            for dep in step.dependencies() {
                if scheduled.contains(dep) && !seen.contains(dep) {
                    return Err(PipelineError::StepOrder {
                        step: step.step_name().to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
            seen.insert(step.step_name());
        }
        Ok(())
    }

    pub fn run(&self, ctx: &StepContext) -> Result<Vec<StepResult>> {
        self.check_order()?;
        let mut results = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            results.push(run_step(step.as_ref(), ctx)?);
        }
        Ok(results)
    }
}

/// Execute one step, timing it and appending it to the run ledger.
pub fn run_step(step: &dyn PipelineStep, ctx: &StepContext) -> Result<StepResult> {
    let started_at = chrono::Utc::now();
    let t = Instant::now();
    info!("▶️ Running step {}", step.step_name());

    let result = step.execute(ctx)?;

    let secs = t.elapsed().as_secs_f64();
    metrics::histogram!("pipeline_stage_duration_seconds", "stage" => step.step_name()).record(secs);
    info!(
        "✅ Step {} finished in {:.2}s: processed={} excluded={} flagged={}",
        step.step_name(),
        secs,
        result.processed,
        result.excluded,
        result.flagged
    );

    let record = RunRecord {
        stage: step.step_name().to_string(),
        started_at,
        finished_at: chrono::Utc::now(),
        processed: result.processed,
        excluded: result.excluded,
        flagged: result.flagged,
    };
    if let Err(e) = run_log::append(&ctx.layout.run_log(), &record) {
        warn!("Could not append to run ledger: {}", e);
    }
    Ok(result)
}
