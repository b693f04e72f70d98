use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::{reason_histogram, STATS_STEP, TRANSFORM_STEP, VALIDATE_STEP};
use crate::constants::{chunk_dir_name, episode_file_stem, NORMALIZED_FEATURES, TRANSFORM_VERSION};
use crate::error::{PipelineError, Result};
use crate::pipeline::table::{read_episode_table, write_episode_table, EpisodeTable, Frame};
use crate::pipeline::{PipelineStep, StepContext, StepResult};
use crate::storage::{self, WorkLayout};
use crate::types::{FeatureStats, GlobalStats, NormalizedEpisodeReport, TransformReport, ValidatedEpisode};

/// Declared vector widths for the two normalized features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Widths {
    pub action: usize,
    pub state: usize,
}

/// Row accounting for one cleaned episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformCounts {
    pub rows_in: u64,
    pub dropped_width: u64,
    pub dropped_null: u64,
    pub dropped_duplicate: u64,
    pub rows_out: u64,
}

pub fn normalize_value(x: f64, mean: f64, std: f64) -> f64 {
    if std == 0.0 {
        x - mean
    } else {
        (x - mean) / std
    }
}

pub fn denormalize_value(z: f64, mean: f64, std: f64) -> f64 {
    if std == 0.0 {
        z + mean
    } else {
        z * std + mean
    }
}

/// Per-dimension z-scoring for `action` and `observation.state`.
#[derive(Debug, Clone)]
pub struct Normalizer {
    action: FeatureStats,
    state: FeatureStats,
}

impl Normalizer {
    /// Fails with `StatsIncomplete` when a feature is absent or has the wrong width.
    pub fn from_global(stats: &GlobalStats, widths: Widths) -> Result<Self> {
        let pick = |name: &str, width: usize| -> Result<FeatureStats> {
            match stats.features.get(name) {
                Some(f) if f.dims() == width => Ok(f.clone()),
                Some(f) => Err(PipelineError::StatsIncomplete(format!(
                    "{} has {} dims, expected {}",
                    name,
                    f.dims(),
                    width
                ))),
                None => Err(PipelineError::StatsIncomplete(name.to_string())),
            }
        };
        let [action, state] = NORMALIZED_FEATURES;
        Ok(Self {
            action: pick(action, widths.action)?,
            state: pick(state, widths.state)?,
        })
    }

    fn apply(values: &mut [f64], stats: &FeatureStats, f: fn(f64, f64, f64) -> f64) {
        for (i, v) in values.iter_mut().enumerate() {
            *v = f(*v, stats.mean[i], stats.std[i]);
        }
    }

    pub fn normalize(&self, frame: &mut Frame) {
        if let Some(a) = frame.action.as_mut() {
            Self::apply(a, &self.action, normalize_value);
        }
        if let Some(s) = frame.observation_state.as_mut() {
            Self::apply(s, &self.state, normalize_value);
        }
    }

    pub fn denormalize(&self, frame: &mut Frame) {
        if let Some(a) = frame.action.as_mut() {
            Self::apply(a, &self.action, denormalize_value);
        }
        if let Some(s) = frame.observation_state.as_mut() {
            Self::apply(s, &self.state, denormalize_value);
        }
    }
}

fn width_ok(v: &Option<Vec<f64>>, width: usize) -> bool {
    v.as_ref().map_or(true, |v| v.len() == width)
}

/// Clean, reindex and (optionally) normalize one episode.
///
/// Order: drop wrong-width rows, drop rows with required nulls, stable sort
/// by `frame_index` keeping the first of each value, renumber `0..K-1`,
/// then z-score. Every step is total; an empty result is valid output, and
/// the output always carries the full column set whatever the input lacked.
pub fn transform(
    table: &EpisodeTable,
    widths: Widths,
    normalizer: Option<&Normalizer>,
) -> (EpisodeTable, TransformCounts) {
    let mut counts = TransformCounts {
        rows_in: table.len() as u64,
        ..Default::default()
    };

    let mut frames: Vec<Frame> = table
        .frames
        .iter()
        .filter(|f| width_ok(&f.action, widths.action) && width_ok(&f.observation_state, widths.state))
        .cloned()
        .collect();
    counts.dropped_width = counts.rows_in - frames.len() as u64;

    let before = frames.len();
    frames.retain(|f| !f.has_required_null());
    counts.dropped_null = (before - frames.len()) as u64;

    // sort_by_key is stable, so the first occurrence of a frame_index leads
    frames.sort_by_key(|f| f.frame_index);
    let before = frames.len();
    frames.dedup_by_key(|f| f.frame_index);
    counts.dropped_duplicate = (before - frames.len()) as u64;

    for (i, frame) in frames.iter_mut().enumerate() {
        frame.frame_index = Some(i as i64);
        if let Some(n) = normalizer {
            n.normalize(frame);
        }
    }
    counts.rows_out = frames.len() as u64;

    (EpisodeTable::new(frames), counts)
}

/// Where the normalized copy of an episode lives.
pub fn normalized_path(layout: &WorkLayout, chunk: &str, episode_index: u64) -> PathBuf {
    layout
        .normalized_dir()
        .join(chunk_dir_name(chunk))
        .join(format!("{}.parquet", episode_file_stem(episode_index)))
}

fn transform_one(
    episode: &ValidatedEpisode,
    layout: &WorkLayout,
    widths: Widths,
    normalizer: Option<&Normalizer>,
) -> NormalizedEpisodeReport {
    let mut report = NormalizedEpisodeReport {
        episode_index: episode.episode_index,
        chunk: episode.chunk.clone(),
        source_fingerprint: episode.fingerprint.clone(),
        output_uri: None,
        rows_in: 0,
        rows_out: 0,
        dropped_width: 0,
        dropped_null: 0,
        dropped_duplicate: 0,
        normalized: normalizer.is_some(),
        anomalous: false,
        error: None,
        video_front_uri: episode.video_front_uri.clone(),
        video_wrist_uri: episode.video_wrist_uri.clone(),
    };

    let out_path = normalized_path(layout, &episode.chunk, episode.episode_index);
    let written = read_episode_table(Path::new(&episode.parquet_uri)).and_then(|table| {
        let (cleaned, counts) = transform(&table, widths, normalizer);
        write_episode_table(&out_path, &cleaned)?;
        Ok(counts)
    });

    match written {
        Ok(c) => {
            report.output_uri = Some(out_path.display().to_string());
            report.rows_in = c.rows_in;
            report.rows_out = c.rows_out;
            report.dropped_width = c.dropped_width;
            report.dropped_null = c.dropped_null;
            report.dropped_duplicate = c.dropped_duplicate;
            report.anomalous = c.rows_out == 0;
        }
        Err(e) => {
            warn!("Episode {} could not be transformed: {}", episode.episode_index, e);
            report.normalized = false;
            report.error = Some(e.to_string());
        }
    }
    report
}

/// Normalize every validated episode into the work root.
pub fn transform_all(
    episodes: &[ValidatedEpisode],
    layout: &WorkLayout,
    widths: Widths,
    normalizer: Option<&Normalizer>,
    pool: &rayon::ThreadPool,
) -> Vec<NormalizedEpisodeReport> {
    let mut reports: Vec<NormalizedEpisodeReport> = pool.install(|| {
        episodes
            .par_iter()
            .map(|e| transform_one(e, layout, widths, normalizer))
            .collect()
    });
    reports.sort_by_key(|r| r.episode_index);
    reports
}

/// Delete normalized files left behind by episodes no longer validated.
fn remove_stale_outputs(dir: &Path, keep: &BTreeSet<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(dir).min_depth(2).max_depth(2) {
        let path = match entry {
            Ok(e) => e.into_path(),
            Err(err) => {
                warn!("Skipping unreadable entry under {}: {}", dir.display(), err);
                continue;
            }
        };
        let is_parquet = path.extension().is_some_and(|x| x == "parquet");
        if is_parquet && path.is_file() && !keep.contains(&path) {
            debug!("Removing stale normalized file {}", path.display());
            std::fs::remove_file(&path).map_err(|e| PipelineError::io_at(&path, e))?;
        }
    }
    Ok(())
}

pub struct AlignTransformStep;

impl PipelineStep for AlignTransformStep {
    #[instrument(skip_all, name = "align_transform")]
    fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
        let layout = &ctx.layout;
        let episodes: Vec<ValidatedEpisode> = storage::read_jsonl(&layout.validated_episodes())?;
        let meta = ctx.raw.load_meta()?;
        let widths = Widths {
            action: meta.action_width(ctx.config.validate.action_dim),
            state: meta.state_width(ctx.config.validate.state_dim),
        };

        let (normalizer, stats_id) = if ctx.config.transform.normalize {
            let stats: GlobalStats = storage::read_json(&layout.global_stats())?;
            let normalizer = if episodes.is_empty() {
                None
            } else {
                Some(Normalizer::from_global(&stats, widths)?)
            };
            (normalizer, Some(stats.stats_id))
        } else {
            (None, None)
        };
        info!(
            "🧹 Transforming {} episodes (normalize: {})",
            episodes.len(),
            normalizer.is_some()
        );

        let pool = ctx.config.thread_pool()?;
        let reports = transform_all(&episodes, layout, widths, normalizer.as_ref(), &pool);

        let keep: BTreeSet<PathBuf> = reports
            .iter()
            .filter_map(|r| r.output_uri.as_ref().map(PathBuf::from))
            .collect();
        remove_stale_outputs(&layout.normalized_dir(), &keep)?;

        let mut errors = 0u64;
        let mut anomalous = 0u64;
        for r in &reports {
            let outcome = if r.error.is_some() {
                errors += 1;
                "error"
            } else if r.anomalous {
                anomalous += 1;
                warn!("Episode {} has no rows left after cleaning", r.episode_index);
                "anomalous"
            } else {
                "normalized"
            };
            metrics::counter!("pipeline_episodes_total", "stage" => TRANSFORM_STEP, "outcome" => outcome)
                .increment(1);
        }
        let dropped_rows: u64 = reports
            .iter()
            .map(|r| r.dropped_width + r.dropped_null + r.dropped_duplicate)
            .sum();

        let report = TransformReport {
            stage_version: TRANSFORM_VERSION.to_string(),
            stats_id,
            episodes: reports,
        };
        storage::write_json(&layout.transform_report(), &report)?;

        let reasons = reason_histogram([
            ("unreadable".to_string(), errors),
            ("anomalous".to_string(), anomalous),
        ]);
        Ok(StepResult::new(
            TRANSFORM_STEP,
            report.episodes.len() as u64,
            format!("{} rows dropped during cleaning", dropped_rows),
        )
        .with_excluded(errors)
        .with_flagged(anomalous)
        .with_reasons(reasons))
    }

    fn step_name(&self) -> &'static str {
        TRANSFORM_STEP
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![VALIDATE_STEP, STATS_STEP]
    }
}
