use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{info, instrument, warn};

use super::{reason_histogram, DISCOVER_STEP};
use crate::config::DiscoverConfig;
use crate::constants::DISCOVER_VERSION;
use crate::dataset::RawDataset;
use crate::error::Result;
use crate::fingerprint::{self, FingerprintMode, StabilityCheck};
use crate::pipeline::{PipelineStep, StepContext, StepResult};
use crate::storage;
use crate::types::{EpisodeStatus, Manifest, ManifestEntry};

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub cameras: Vec<String>,
    pub require_all_cameras: bool,
    pub mode: FingerprintMode,
    /// Chunks to rescan; empty means all of them
    pub only_chunks: BTreeSet<String>,
    pub stability: StabilityCheck,
}

impl DiscoverOptions {
    fn in_scope(&self, chunk: &str) -> bool {
        self.only_chunks.is_empty() || self.only_chunks.contains(chunk)
    }
}

impl From<&DiscoverConfig> for DiscoverOptions {
    fn from(c: &DiscoverConfig) -> Self {
        Self {
            cameras: c.cameras.clone(),
            require_all_cameras: c.require_all_cameras,
            mode: FingerprintMode::from_sample_bytes(c.sample_bytes),
            only_chunks: c.only_chunks.iter().cloned().collect(),
            stability: StabilityCheck::new(c.stability_min_bytes, c.stability_pause_ms),
        }
    }
}

/// Files found on disk for one episode index.
#[derive(Debug, Clone)]
struct Candidate {
    episode_index: u64,
    chunk: String,
    parquet: Option<PathBuf>,
    /// One slot per configured camera, in configuration order
    videos: Vec<Option<PathBuf>>,
    notes: Vec<String>,
}

fn collect_candidates(raw: &RawDataset, options: &DiscoverOptions) -> Vec<Candidate> {
    let cameras = &options.cameras;
    let mut found: BTreeMap<u64, Candidate> = BTreeMap::new();

    for chunk in raw.list_chunks().into_iter().filter(|c| options.in_scope(c)) {
        let parquets = raw.list_parquets(&chunk);
        let videos: Vec<BTreeMap<u64, PathBuf>> =
            cameras.iter().map(|cam| raw.list_videos(&chunk, cam)).collect();

        let mut indices: BTreeSet<u64> = parquets.keys().copied().collect();
        for per_cam in &videos {
            indices.extend(per_cam.keys().copied());
        }

        for idx in indices {
            if let Some(existing) = found.get_mut(&idx) {
                warn!(
                    "Episode {} appears in chunk {} and chunk {}; keeping chunk {}",
                    idx, existing.chunk, chunk, existing.chunk
                );
                existing
                    .notes
                    .push(format!("duplicate episode_index also found in chunk {}", chunk));
                continue;
            }
            found.insert(
                idx,
                Candidate {
                    episode_index: idx,
                    chunk: chunk.clone(),
                    parquet: parquets.get(&idx).cloned(),
                    videos: videos.iter().map(|v| v.get(&idx).cloned()).collect(),
                    notes: Vec::new(),
                },
            );
        }
    }

    found.into_values().collect()
}

fn path_string(p: &Option<PathBuf>) -> Option<String> {
    p.as_ref().map(|p| p.display().to_string())
}

fn classify(
    candidate: &Candidate,
    prior: Option<&ManifestEntry>,
    options: &DiscoverOptions,
    algo_changed: bool,
) -> ManifestEntry {
    let mut files: Vec<(String, &std::path::Path)> = Vec::new();
    if let Some(p) = &candidate.parquet {
        files.push(("parquet".to_string(), p.as_path()));
    }
    for (cam, video) in options.cameras.iter().zip(&candidate.videos) {
        if let Some(v) = video {
            files.push((cam.clone(), v.as_path()));
        }
    }

    let mut absent = Vec::new();
    if candidate.parquet.is_none() {
        absent.push("parquet".to_string());
    }
    for (i, (cam, video)) in options.cameras.iter().zip(&candidate.videos).enumerate() {
        let required = i == 0 || options.require_all_cameras;
        if required && video.is_none() {
            absent.push(cam.clone());
        }
    }

    let mut notes = candidate.notes.clone();
    let unsettled: Vec<&str> = files
        .iter()
        .filter(|(_, path)| !options.stability.is_settled(path))
        .map(|(role, _)| role.as_str())
        .collect();
    if !unsettled.is_empty() {
        info!(
            "⏳ Episode {} is still being written ({})",
            candidate.episode_index,
            unsettled.join(", ")
        );
        notes.insert(0, format!("still being written: {}", unsettled.join(", ")));
        return ManifestEntry {
            episode_index: candidate.episode_index,
            chunk: candidate.chunk.clone(),
            parquet_uri: path_string(&candidate.parquet),
            video_front_uri: candidate.videos.first().and_then(path_string),
            video_wrist_uri: candidate.videos.get(1).and_then(path_string),
            bytes_total: 0,
            fingerprint: None,
            status: EpisodeStatus::Pending,
            errors: Some(notes.join("; ")),
        };
    }

    let (fingerprint, bytes_total) = match fingerprint::fingerprint(&files, options.mode) {
        Ok((fp, bytes)) => (Some(fp), bytes),
        Err(e) => {
            notes.push(format!("fingerprint failed: {}", e));
            (None, 0)
        }
    };

    let status = if !absent.is_empty() {
        notes.insert(0, format!("missing files: {}", absent.join(", ")));
        EpisodeStatus::Missing
    } else if fingerprint.is_none() {
        EpisodeStatus::Missing
    } else {
        match prior {
            None => EpisodeStatus::New,
            // first settled sighting of an episode that was mid-copy
            Some(p) if p.status == EpisodeStatus::Pending => EpisodeStatus::New,
            Some(_) if algo_changed => EpisodeStatus::Changed,
            Some(p) if p.fingerprint == fingerprint => EpisodeStatus::Unchanged,
            Some(_) => EpisodeStatus::Changed,
        }
    };

    ManifestEntry {
        episode_index: candidate.episode_index,
        chunk: candidate.chunk.clone(),
        parquet_uri: path_string(&candidate.parquet),
        video_front_uri: candidate.videos.first().and_then(path_string),
        video_wrist_uri: candidate.videos.get(1).and_then(path_string),
        bytes_total,
        fingerprint,
        status,
        errors: if notes.is_empty() {
            None
        } else {
            Some(notes.join("; "))
        },
    }
}

/// Scan the raw tree and classify every episode against `existing`.
///
/// The result supersedes `existing`: one row per episode index, sorted.
/// Entries whose sources vanished are kept as `missing`, never dropped.
/// Prior entries outside `only_chunks` are carried over as they were.
pub fn discover(
    raw: &RawDataset,
    existing: Option<&Manifest>,
    options: &DiscoverOptions,
    pool: &rayon::ThreadPool,
) -> Manifest {
    let algo_changed = existing.is_some_and(|prev| prev.fingerprint_algo != options.mode.algo());
    if let Some(prev) = existing.filter(|_| algo_changed) {
        warn!(
            "Prior manifest used {}; current mode is {}, every episode will read as changed",
            prev.fingerprint_algo,
            options.mode.algo()
        );
    }
    if !options.only_chunks.is_empty() {
        info!("Scanning only chunks {:?}", options.only_chunks);
    }

    let candidates = collect_candidates(raw, options);
    let mut entries: Vec<ManifestEntry> = pool.install(|| {
        candidates
            .par_iter()
            .map(|c| {
                let prior = existing.and_then(|m| m.get(c.episode_index));
                classify(c, prior, options, algo_changed)
            })
            .collect()
    });

    if let Some(prev) = existing {
        let seen: BTreeSet<u64> = entries.iter().map(|e| e.episode_index).collect();
        for old in prev.entries.iter().filter(|e| !seen.contains(&e.episode_index)) {
            if !options.in_scope(&old.chunk) {
                entries.push(old.clone());
                continue;
            }
            warn!("Episode {} no longer has any source files", old.episode_index);
            entries.push(ManifestEntry {
                episode_index: old.episode_index,
                chunk: old.chunk.clone(),
                parquet_uri: None,
                video_front_uri: None,
                video_wrist_uri: None,
                bytes_total: 0,
                fingerprint: None,
                status: EpisodeStatus::Missing,
                errors: Some("source files absent".to_string()),
            });
        }
    }

    entries.sort_by_key(|e| e.episode_index);
    for entry in &entries {
        metrics::counter!(
            "pipeline_episodes_total",
            "stage" => DISCOVER_STEP,
            "outcome" => entry.status.as_str()
        )
        .increment(1);
    }

    Manifest {
        fingerprint_algo: options.mode.algo().to_string(),
        stage_version: DISCOVER_VERSION.to_string(),
        entries,
    }
}

pub struct DiscoverStep;

impl PipelineStep for DiscoverStep {
    #[instrument(skip_all, name = "discover")]
    fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
        let manifest_path = ctx.layout.manifest();
        let existing: Option<Manifest> = storage::read_json_opt(&manifest_path)?;
        info!(
            "🔎 Discovering episodes under {} (prior manifest: {})",
            ctx.raw.root().display(),
            if existing.is_some() { "yes" } else { "no" }
        );

        let options = DiscoverOptions::from(&ctx.config.discover);
        let pool = ctx.config.thread_pool()?;
        let manifest = discover(&ctx.raw, existing.as_ref(), &options, &pool);
        storage::write_json(&manifest_path, &manifest)?;

        let counts = manifest.status_counts();
        let missing = counts.get(&EpisodeStatus::Missing).copied().unwrap_or(0);
        let pending = counts.get(&EpisodeStatus::Pending).copied().unwrap_or(0);
        for entry in manifest.entries.iter().filter(|e| e.status == EpisodeStatus::Missing) {
            warn!(
                "Episode {} is missing sources: {}",
                entry.episode_index,
                entry.errors.as_deref().unwrap_or("unknown")
            );
        }

        let reasons = reason_histogram(counts.iter().map(|(s, n)| (s.as_str().to_string(), *n)));
        Ok(StepResult::new(
            DISCOVER_STEP,
            manifest.entries.len() as u64,
            format!("wrote {}", manifest_path.display()),
        )
        .with_excluded(missing)
        .with_flagged(pending)
        .with_reasons(reasons))
    }

    fn step_name(&self) -> &'static str {
        DISCOVER_STEP
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![]
    }
}
