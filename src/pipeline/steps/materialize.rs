//! Split assignment and the final partitioned dataset.
//!
//! ```text
//! dataset/
//!   split=train/chunk=000/episode_000001.parquet
//!   split=train/chunk=000/videos/observation.images.front/episode_000001.mp4
//!   dataset_index.json
//!   _manifest.json
//! ```
//!
//! Each episode table gains constant `split` and `chunk` columns so a single
//! file still says where it belongs. The tree is assembled in a staging
//! sibling and renamed into place.

use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{reason_histogram, MATERIALIZE_STEP, TRANSFORM_STEP};
use crate::config::{LinkMode, MaterializeConfig};
use crate::constants::{
    episode_file_stem, CHUNK_COL, DISCOVER_VERSION, SPLIT_COL, MATERIALIZE_VERSION, STATS_VERSION, TRANSFORM_VERSION,
    VALIDATE_VERSION,
};
use crate::error::{PipelineError, Result};
use crate::pipeline::table::write_labeled_copy;
use crate::pipeline::{PipelineStep, StepContext, StepResult};
use crate::storage;
use crate::types::{DatasetIndexRow, DatasetManifest, NormalizedEpisodeReport, Split, TransformReport};

pub const INDEX_FILE: &str = "dataset_index.json";
pub const MANIFEST_FILE: &str = "_manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SplitFractions {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl From<&MaterializeConfig> for SplitFractions {
    fn from(c: &MaterializeConfig) -> Self {
        Self {
            train: c.train,
            val: c.val,
            test: c.test,
        }
    }
}

/// Position of an episode on `[0, 1)`, a pure function of seed and index.
pub fn split_point(episode_index: u64, seed: u64) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_be_bytes());
    hasher.update(episode_index.to_be_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    // 53 high bits keep the division exact in f64
    (u64::from_be_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
}

pub fn assign_split(episode_index: u64, seed: u64, fractions: &SplitFractions) -> Split {
    let u = split_point(episode_index, seed);
    if u < fractions.train {
        Split::Train
    } else if u < fractions.train + fractions.val {
        Split::Val
    } else {
        Split::Test
    }
}

/// Path from directory `from` to `to`; both absolute.
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component> = from.components().collect();
    let to: Vec<Component> = to.components().collect();
    let shared = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut out = PathBuf::new();
    for _ in shared..from.len() {
        out.push("..");
    }
    for c in &to[shared..] {
        out.push(c.as_os_str());
    }
    out
}

#[derive(Debug, Clone)]
pub struct MaterializeOptions {
    pub seed: u64,
    pub fractions: SplitFractions,
    pub link_mode: LinkMode,
    /// Camera names for the front and wrist references, in that order
    pub cameras: Vec<String>,
    pub stats_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MaterializeOutcome {
    pub index: Vec<DatasetIndexRow>,
    pub manifest: DatasetManifest,
    /// Episodes left out because their transform failed
    pub skipped: Vec<u64>,
}

fn video_refs<'a>(report: &'a NormalizedEpisodeReport, cameras: &'a [String]) -> Vec<(&'a str, Option<&'a str>)> {
    let uris = [report.video_front_uri.as_deref(), report.video_wrist_uri.as_deref()];
    cameras
        .iter()
        .zip(uris)
        .map(|(cam, uri)| (cam.as_str(), uri))
        .collect()
}

/// Every referenced video and normalized file must exist before anything is written.
fn preflight(episodes: &[&NormalizedEpisodeReport], cameras: &[String]) -> Result<()> {
    for report in episodes {
        for (_, uri) in video_refs(report, cameras) {
            if let Some(uri) = uri {
                if !Path::new(uri).is_file() {
                    return Err(PipelineError::MissingVideo {
                        episode_index: report.episode_index,
                        path: PathBuf::from(uri),
                    });
                }
            }
        }
        if let Some(out) = &report.output_uri {
            if !Path::new(out).is_file() {
                return Err(PipelineError::MissingArtifact(PathBuf::from(out)));
            }
        }
    }
    Ok(())
}

fn place_video(source: &Path, dest: &Path, final_dir: &Path, mode: LinkMode) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io_at(parent, e))?;
    }
    match mode {
        LinkMode::Copy => {
            fs::copy(source, dest).map_err(|e| PipelineError::io_at(dest, e))?;
        }
        LinkMode::Hardlink => {
            fs::hard_link(source, dest).map_err(|e| PipelineError::io_at(dest, e))?;
        }
        LinkMode::Symlink => {
            let absolute = fs::canonicalize(source).map_err(|e| PipelineError::io_at(source, e))?;
            let target = relative_path(final_dir, &absolute);
            symlink(&target, dest)?;
        }
        LinkMode::ManifestOnly => {}
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dest).map_err(|e| PipelineError::io_at(dest, e))
}

#[cfg(not(unix))]
fn symlink(target: &Path, dest: &Path) -> Result<()> {
    warn!("Symlinks unsupported here; copying {}", dest.display());
    let source = dest.parent().map(|p| p.join(target)).unwrap_or_default();
    fs::copy(&source, dest).map_err(|e| PipelineError::io_at(dest, e))?;
    Ok(())
}

fn place_episode(
    report: &NormalizedEpisodeReport,
    options: &MaterializeOptions,
    staging: &Path,
    final_root: &Path,
) -> Result<DatasetIndexRow> {
    let split = assign_split(report.episode_index, options.seed, &options.fractions);
    let partition = PathBuf::from(format!("split={}", split)).join(format!("chunk={}", report.chunk));
    let stem = episode_file_stem(report.episode_index);

    let parquet_rel = partition.join(format!("{}.parquet", stem));
    let parquet_dest = staging.join(&parquet_rel);
    if let Some(parent) = parquet_dest.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io_at(parent, e))?;
    }
    if let Some(source) = &report.output_uri {
        write_labeled_copy(
            Path::new(source),
            &parquet_dest,
            &[(SPLIT_COL, split.as_str()), (CHUNK_COL, report.chunk.as_str())],
        )?;
    }

    let mut videos = BTreeMap::new();
    for (camera, uri) in video_refs(report, &options.cameras) {
        let Some(uri) = uri else {
            videos.insert(camera.to_string(), None);
            continue;
        };
        if options.link_mode == LinkMode::ManifestOnly {
            videos.insert(camera.to_string(), Some(uri.to_string()));
            continue;
        }
        let rel = partition
            .join("videos")
            .join(camera)
            .join(format!("{}.mp4", stem));
        let final_dir = final_root.join(&rel);
        let final_dir = final_dir.parent().unwrap_or(final_root);
        place_video(Path::new(uri), &staging.join(&rel), final_dir, options.link_mode)?;
        videos.insert(camera.to_string(), Some(rel.display().to_string()));
    }

    Ok(DatasetIndexRow {
        split,
        chunk: report.chunk.clone(),
        episode_index: report.episode_index,
        parquet_path: parquet_rel.display().to_string(),
        videos,
        num_rows: report.rows_out,
        anomalous: report.anomalous,
    })
}

fn stage_versions() -> BTreeMap<String, String> {
    [
        ("discover", DISCOVER_VERSION),
        ("validate", VALIDATE_VERSION),
        ("stats", STATS_VERSION),
        ("align_transform", TRANSFORM_VERSION),
        ("materialize", MATERIALIZE_VERSION),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Serialize)]
struct DatasetIdentity<'a> {
    seed: u64,
    fractions: &'a SplitFractions,
    stats_id: &'a Option<String>,
    source_fingerprints: &'a BTreeMap<u64, Option<String>>,
    stage_versions: &'a BTreeMap<String, String>,
}

fn swap_into_place(staging: &Path, dataset_dir: &Path) -> Result<()> {
    let old = dataset_dir.with_extension("old");
    if old.exists() {
        fs::remove_dir_all(&old).map_err(|e| PipelineError::io_at(&old, e))?;
    }
    if dataset_dir.exists() {
        fs::rename(dataset_dir, &old).map_err(|e| PipelineError::io_at(dataset_dir, e))?;
    }
    fs::rename(staging, dataset_dir).map_err(|e| PipelineError::io_at(staging, e))?;
    if old.exists() {
        fs::remove_dir_all(&old).map_err(|e| PipelineError::io_at(&old, e))?;
    }
    Ok(())
}

/// Build the split dataset under `dataset_dir` from normalized episodes.
///
/// Aborts before writing anything if a referenced video is missing. Episodes
/// whose transform failed are skipped; zero-row episodes are kept and flagged.
pub fn materialize(
    reports: &[NormalizedEpisodeReport],
    options: &MaterializeOptions,
    dataset_dir: &Path,
    pool: &rayon::ThreadPool,
) -> Result<MaterializeOutcome> {
    let (eligible, failed): (Vec<&NormalizedEpisodeReport>, Vec<&NormalizedEpisodeReport>) =
        reports.iter().partition(|r| r.error.is_none() && r.output_uri.is_some());
    let skipped: Vec<u64> = failed.iter().map(|r| r.episode_index).collect();
    for id in &skipped {
        warn!("Episode {} has no normalized output; leaving it out", id);
    }

    preflight(&eligible, &options.cameras)?;

    let parent = dataset_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|e| PipelineError::io_at(parent, e))?;
    let final_root = fs::canonicalize(parent)
        .map_err(|e| PipelineError::io_at(parent, e))?
        .join(dataset_dir.file_name().unwrap_or_default());

    let staging = dataset_dir.with_extension("staging");
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| PipelineError::io_at(&staging, e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| PipelineError::io_at(&staging, e))?;

    let placed: Vec<Result<DatasetIndexRow>> = pool.install(|| {
        eligible
            .par_iter()
            .map(|r| place_episode(r, options, &staging, &final_root))
            .collect()
    });
    let mut index = placed.into_iter().collect::<Result<Vec<_>>>()?;
    index.sort_by(|a, b| {
        (a.split, &a.chunk, a.episode_index).cmp(&(b.split, &b.chunk, b.episode_index))
    });

    let mut counts: BTreeMap<Split, u64> = [Split::Train, Split::Val, Split::Test]
        .into_iter()
        .map(|s| (s, 0))
        .collect();
    for row in &index {
        *counts.entry(row.split).or_insert(0) += 1;
    }

    let source_fingerprints: BTreeMap<u64, Option<String>> = eligible
        .iter()
        .map(|r| (r.episode_index, r.source_fingerprint.clone()))
        .collect();
    let versions = stage_versions();
    let identity = storage::to_canonical_json(&DatasetIdentity {
        seed: options.seed,
        fractions: &options.fractions,
        stats_id: &options.stats_id,
        source_fingerprints: &source_fingerprints,
        stage_versions: &versions,
    })?;

    let f = &options.fractions;
    let manifest = DatasetManifest {
        dataset_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, &identity).to_string(),
        seed: options.seed,
        fractions: [(Split::Train, f.train), (Split::Val, f.val), (Split::Test, f.test)]
            .into_iter()
            .collect(),
        counts,
        link_videos: options.link_mode.as_str().to_string(),
        cameras: options.cameras.clone(),
        stats_id: options.stats_id.clone(),
        source_fingerprints,
        stage_versions: versions,
        flagged_episodes: index
            .iter()
            .filter(|r| r.anomalous)
            .map(|r| r.episode_index)
            .collect(),
    };

    storage::write_json(&staging.join(INDEX_FILE), &index)?;
    storage::write_json(&staging.join(MANIFEST_FILE), &manifest)?;
    swap_into_place(&staging, dataset_dir)?;

    Ok(MaterializeOutcome {
        index,
        manifest,
        skipped,
    })
}

pub struct MaterializeStep;

impl PipelineStep for MaterializeStep {
    #[instrument(skip_all, name = "materialize")]
    fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
        let report: TransformReport = storage::read_json(&ctx.layout.transform_report())?;
        let m = &ctx.config.materialize;
        let options = MaterializeOptions {
            seed: m.seed,
            fractions: SplitFractions::from(m),
            link_mode: m.link_videos,
            cameras: ctx.config.discover.cameras.clone(),
            stats_id: report.stats_id.clone(),
        };
        info!(
            "📦 Materializing {} episodes (seed {}, videos: {})",
            report.episodes.len(),
            options.seed,
            options.link_mode.as_str()
        );

        let pool = ctx.config.thread_pool()?;
        let outcome = materialize(&report.episodes, &options, &ctx.layout.dataset_dir(), &pool)?;

        for row in &outcome.index {
            metrics::counter!("pipeline_episodes_total", "stage" => MATERIALIZE_STEP, "outcome" => row.split.as_str())
                .increment(1);
        }
        let counts = &outcome.manifest.counts;
        info!(
            "✅ Dataset {}: train={} val={} test={}",
            outcome.manifest.dataset_id,
            counts.get(&Split::Train).unwrap_or(&0),
            counts.get(&Split::Val).unwrap_or(&0),
            counts.get(&Split::Test).unwrap_or(&0)
        );

        let flagged = outcome.manifest.flagged_episodes.len() as u64;
        let reasons = reason_histogram([
            ("no_normalized_output".to_string(), outcome.skipped.len() as u64),
            ("anomalous".to_string(), flagged),
        ]);
        Ok(StepResult::new(
            MATERIALIZE_STEP,
            outcome.index.len() as u64,
            format!("dataset {}", outcome.manifest.dataset_id),
        )
        .with_excluded(outcome.skipped.len() as u64)
        .with_flagged(flagged)
        .with_reasons(reasons))
    }

    fn step_name(&self) -> &'static str {
        MATERIALIZE_STEP
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![TRANSFORM_STEP]
    }
}
