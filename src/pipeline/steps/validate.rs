//! Structural and semantic checks over every manifest entry.
//!
//! Every check runs independently and all problems for an episode are
//! collected before the verdict. `passed` is true iff `issues` is empty;
//! `warnings` record defects the transform stage repairs.

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, instrument, warn};

use super::{reason_histogram, DISCOVER_STEP, VALIDATE_STEP};
use crate::config::ValidateConfig;
use crate::constants::{
    ACTION_COL, EPISODE_INDEX_COL, FRAME_INDEX_COL, OBS_STATE_COL, REQUIRED_COLUMNS,
    TASK_INDEX_COL, TIMESTAMP_COL, VALIDATE_VERSION,
};
use crate::dataset::DatasetMeta;
use crate::error::{PipelineError, Result};
use crate::pipeline::table::{read_episode_table, EpisodeTable, Frame};
use crate::pipeline::{PipelineStep, StepContext, StepResult};
use crate::storage;
use crate::types::{
    EpisodeStatus, Issue, IssueCode, Manifest, ManifestEntry, ValidatedEpisode, ValidationFailure,
    ValidationResult, ValidationSummary,
};
use crate::video::VideoProbe;

/// Limits resolved from configuration and `meta/info.json`.
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub action_width: usize,
    pub state_width: usize,
    pub target_fps: f64,
    pub fps_tolerance: f64,
    pub frame_tolerance: u64,
    pub max_null_row_fraction: f64,
    pub check_video: bool,
}

impl ValidationLimits {
    pub fn resolve(config: &ValidateConfig, meta: &DatasetMeta) -> Self {
        Self {
            action_width: meta.action_width(config.action_dim),
            state_width: meta.state_width(config.state_dim),
            target_fps: meta.fps(config.target_fps),
            fps_tolerance: config.fps_tolerance,
            frame_tolerance: config.frame_tolerance,
            max_null_row_fraction: config.max_null_row_fraction,
            check_video: !config.skip_video,
        }
    }

    /// Identifies every input of a verdict besides the episode's own files.
    /// A prior result is only reusable under the same id.
    pub fn checks_id(&self, expected_rows: Option<u64>) -> String {
        let key = format!(
            "{}|action={}|state={}|fps={}|fps_tol={}|frame_tol={}|nulls={}|video={}|length={:?}",
            VALIDATE_VERSION,
            self.action_width,
            self.state_width,
            self.target_fps,
            self.fps_tolerance,
            self.frame_tolerance,
            self.max_null_row_fraction,
            self.check_video,
            expected_rows
        );
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}

/// Everything the validation stage produces.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub results: Vec<ValidationResult>,
    pub failures: Vec<ValidationFailure>,
    pub validated: Vec<ValidatedEpisode>,
    pub summary: ValidationSummary,
}

impl ValidationOutcome {
    pub fn validated_ids(&self) -> Vec<u64> {
        self.validated.iter().map(|v| v.episode_index).collect()
    }
}

fn abs_diff(a: u64, b: u64) -> u64 {
    a.max(b) - a.min(b)
}

/// Null in any usable required column. Missing columns are reported as
/// schema problems, not as nulls.
fn row_has_null(frame: &Frame, table: &EpisodeTable) -> bool {
    let null = |col: &str, is_none: bool| table.usable(col) && is_none;
    null(ACTION_COL, frame.action.is_none())
        || null(OBS_STATE_COL, frame.observation_state.is_none())
        || null(TIMESTAMP_COL, frame.timestamp.is_none())
        || null(FRAME_INDEX_COL, frame.frame_index.is_none())
        || null(EPISODE_INDEX_COL, frame.episode_index.is_none())
        || null(TASK_INDEX_COL, frame.task_index.is_none())
}

fn check_width(
    table: &EpisodeTable,
    column: &str,
    width: usize,
    pick: impl Fn(&Frame) -> &Option<Vec<f64>>,
) -> Option<Issue> {
    if !table.usable(column) {
        return None;
    }
    let bad: Vec<usize> = table
        .frames
        .iter()
        .filter_map(|f| pick(f).as_ref().map(Vec::len))
        .filter(|w| *w != width)
        .collect();
    if bad.is_empty() {
        return None;
    }
    let seen: BTreeSet<usize> = bad.iter().copied().collect();
    Some(Issue::new(
        IssueCode::WidthMismatch,
        format!(
            "{}: {} rows with width other than {} (saw {:?})",
            column,
            bad.len(),
            width,
            seen
        ),
    ))
}

fn check_frame_order(frames: &[i64], issues: &mut Vec<Issue>, warnings: &mut Vec<Issue>) {
    let Some(first) = frames.first() else {
        return;
    };
    if *first != 0 {
        warnings.push(Issue::new(
            IssueCode::FrameIndexGap,
            format!("frame_index starts at {}", first),
        ));
    }

    let (mut decreasing, mut duplicates, mut gaps) = (0u64, 0u64, 0u64);
    for pair in frames.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if next < prev {
            decreasing += 1;
        } else if next == prev {
            duplicates += 1;
        } else if next > prev + 1 {
            gaps += 1;
        }
    }

    if decreasing > 0 {
        issues.push(Issue::new(
            IssueCode::BadFrameOrder,
            format!("frame_index decreases {} times", decreasing),
        ));
    }
    if duplicates > 0 {
        warnings.push(Issue::new(
            IssueCode::DuplicateFrames,
            format!("{} repeated frame_index values", duplicates),
        ));
    }
    if gaps > 0 {
        warnings.push(Issue::new(
            IssueCode::FrameIndexGap,
            format!("{} gaps in frame_index", gaps),
        ));
    }
}

fn check_video(
    role: &str,
    uri: Option<&str>,
    required: bool,
    expected_frames: u64,
    limits: &ValidationLimits,
    probe: &dyn VideoProbe,
    issues: &mut Vec<Issue>,
) {
    let Some(uri) = uri else {
        if required {
            issues.push(Issue::new(IssueCode::VideoMissing, format!("{}: no video", role)));
        }
        return;
    };
    let Some(meta) = probe.probe(Path::new(uri)) else {
        issues.push(Issue::new(
            IssueCode::VideoMissing,
            format!("{}: could not probe {}", role, uri),
        ));
        return;
    };

    if let Some(fps) = meta.fps {
        if (fps - limits.target_fps).abs() > limits.fps_tolerance {
            issues.push(Issue::new(
                IssueCode::VideoFpsMismatch,
                format!("{}: {:.3} fps, expected {}", role, fps, limits.target_fps),
            ));
        }
    }
    if let Some(frames) = meta.frame_count {
        if abs_diff(frames, expected_frames) > limits.frame_tolerance {
            issues.push(Issue::new(
                IssueCode::VideoFrameCountMismatch,
                format!("{}: {} frames, expected {}", role, frames, expected_frames),
            ));
        }
    }
}

/// Run the full battery for one manifest entry.
pub fn validate_episode(
    entry: &ManifestEntry,
    meta: &DatasetMeta,
    limits: &ValidationLimits,
    probe: &dyn VideoProbe,
) -> ValidationResult {
    let expected_rows = meta.lengths.get(&entry.episode_index).copied();
    let mut result = ValidationResult {
        episode_index: entry.episode_index,
        chunk: entry.chunk.clone(),
        fingerprint: entry.fingerprint.clone(),
        passed: false,
        issues: Vec::new(),
        warnings: Vec::new(),
        checked_fields: Vec::new(),
        rows: None,
        expected_rows,
        frame_min: None,
        frame_max: None,
        checks_id: limits.checks_id(expected_rows),
    };

    let parquet = match (&entry.status, &entry.parquet_uri) {
        (EpisodeStatus::Missing | EpisodeStatus::Pending, _) | (_, None) => {
            result.issues.push(Issue::new(
                IssueCode::MissingSource,
                entry.errors.clone().unwrap_or_else(|| "source files absent".into()),
            ));
            return result;
        }
        (_, Some(p)) => p,
    };

    let table = match read_episode_table(Path::new(parquet)) {
        Ok(t) => t,
        Err(e) => {
            result
                .issues
                .push(Issue::new(IssueCode::UnreadableTable, e.to_string()));
            return result;
        }
    };
    result.checked_fields = REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect();
    result.rows = Some(table.len() as u64);

    let problems = table.schema_problems();
    if !problems.is_empty() {
        result
            .issues
            .push(Issue::new(IssueCode::SchemaMismatch, problems.join("; ")));
    }

    if table.is_empty() {
        result
            .issues
            .push(Issue::new(IssueCode::EmptyEpisode, "no rows"));
    }

    result.issues.extend(check_width(&table, ACTION_COL, limits.action_width, |f| &f.action));
    result.issues.extend(check_width(&table, OBS_STATE_COL, limits.state_width, |f| {
        &f.observation_state
    }));

    let null_rows = table.frames.iter().filter(|f| row_has_null(f, &table)).count();
    if null_rows > 0 {
        let fraction = null_rows as f64 / table.len() as f64;
        let detail = format!("{} of {} rows have nulls", null_rows, table.len());
        if fraction > limits.max_null_row_fraction {
            result.issues.push(Issue::new(IssueCode::NullValues, detail));
        } else {
            result
                .warnings
                .push(Issue::new(IssueCode::NullRowsRecoverable, detail));
        }
    }

    if table.usable(FRAME_INDEX_COL) {
        let frames: Vec<i64> = table.frames.iter().filter_map(|f| f.frame_index).collect();
        result.frame_min = frames.iter().copied().min();
        result.frame_max = frames.iter().copied().max();
        check_frame_order(&frames, &mut result.issues, &mut result.warnings);
    }

    if table.usable(TIMESTAMP_COL) {
        let ts: Vec<f64> = table.frames.iter().filter_map(|f| f.timestamp).collect();
        let backwards = ts.windows(2).filter(|w| w[1] < w[0]).count();
        if backwards > 0 {
            result.issues.push(Issue::new(
                IssueCode::BadTimestampOrder,
                format!("timestamp decreases {} times", backwards),
            ));
        }
    }

    if table.usable(EPISODE_INDEX_COL) {
        let expected = entry.episode_index as i64;
        let foreign: BTreeSet<i64> = table
            .frames
            .iter()
            .filter_map(|f| f.episode_index)
            .filter(|e| *e != expected)
            .collect();
        if !foreign.is_empty() {
            result.issues.push(Issue::new(
                IssueCode::EpisodeIndexMismatch,
                format!("rows claim episode_index {:?}", foreign),
            ));
        }
    }

    let rows = table.len() as u64;
    match result.expected_rows {
        Some(len) if abs_diff(len, rows) > limits.frame_tolerance => {
            result.issues.push(Issue::new(
                IssueCode::LengthMismatch,
                format!("meta length {} but {} rows", len, rows),
            ));
        }
        Some(_) => {}
        None => result.warnings.push(Issue::new(
            IssueCode::MetaLengthMissing,
            "episode not listed in meta/episodes.jsonl",
        )),
    }

    if limits.check_video {
        let expected_frames = result.expected_rows.unwrap_or(rows);
        for (role, uri, required) in [
            ("front", entry.video_front_uri.as_deref(), true),
            ("wrist", entry.video_wrist_uri.as_deref(), false),
        ] {
            if uri.is_some() || required {
                result.checked_fields.push(format!("video:{}", role));
            }
            check_video(role, uri, required, expected_frames, limits, probe, &mut result.issues);
        }
    }

    result.passed = result.issues.is_empty();
    result
}

fn distinct_codes(issues: &[Issue]) -> BTreeSet<IssueCode> {
    issues.iter().map(|i| i.code).collect()
}

/// Validate every manifest entry, reusing `previous` results for unchanged
/// episodes whose fingerprint and checks id still match.
///
/// `pending` entries are left out entirely; they are picked up once a later
/// discovery sees their files settle.
pub fn validate_manifest(
    manifest: &Manifest,
    meta: &DatasetMeta,
    limits: &ValidationLimits,
    probe: &dyn VideoProbe,
    previous: Option<&[ValidationResult]>,
    pool: &rayon::ThreadPool,
) -> ValidationOutcome {
    let prior: BTreeMap<u64, &ValidationResult> = previous
        .unwrap_or_default()
        .iter()
        .map(|r| (r.episode_index, r))
        .collect();

    let (pending, ready): (Vec<&ManifestEntry>, Vec<&ManifestEntry>) = manifest
        .entries
        .iter()
        .partition(|e| e.status == EpisodeStatus::Pending);
    for entry in &pending {
        info!("⏳ Episode {} is still being written; skipping", entry.episode_index);
    }

    let checked: Vec<(ValidationResult, bool)> = pool.install(|| {
        ready
            .par_iter()
            .map(|entry| {
                let checks_id = limits.checks_id(meta.lengths.get(&entry.episode_index).copied());
                let reusable = prior.get(&entry.episode_index).filter(|r| {
                    entry.status == EpisodeStatus::Unchanged
                        && entry.fingerprint.is_some()
                        && r.fingerprint == entry.fingerprint
                        && r.chunk == entry.chunk
                        && r.checks_id == checks_id
                });
                match reusable {
                    Some(r) => ((*r).clone(), true),
                    None => (validate_episode(entry, meta, limits, probe), false),
                }
            })
            .collect()
    });

    let mut summary = ValidationSummary {
        total: manifest.entries.len() as u64,
        pending: pending.len() as u64,
        ..Default::default()
    };
    let mut results = Vec::with_capacity(checked.len());
    let mut failures = Vec::new();
    let mut validated = Vec::new();

    for ((result, reused), entry) in checked.into_iter().zip(ready) {
        if reused {
            summary.reused += 1;
        }
        for code in distinct_codes(&result.issues) {
            *summary.issue_histogram.entry(code).or_insert(0) += 1;
        }
        let warning_codes = distinct_codes(&result.warnings);
        for code in &warning_codes {
            *summary.warning_histogram.entry(*code).or_insert(0) += 1;
        }

        let outcome = if result.passed { "passed" } else { "failed" };
        metrics::counter!("pipeline_episodes_total", "stage" => VALIDATE_STEP, "outcome" => outcome)
            .increment(1);

        match (&entry.parquet_uri, result.passed) {
            (Some(parquet_uri), true) => {
                summary.validated += 1;
                validated.push(ValidatedEpisode {
                    episode_index: entry.episode_index,
                    chunk: entry.chunk.clone(),
                    fingerprint: entry.fingerprint.clone(),
                    rows: result.rows.unwrap_or(0),
                    parquet_uri: parquet_uri.clone(),
                    video_front_uri: entry.video_front_uri.clone(),
                    video_wrist_uri: entry.video_wrist_uri.clone(),
                    warnings: warning_codes.into_iter().collect(),
                });
            }
            _ => {
                summary.failed += 1;
                warn!(
                    "Episode {} failed validation: {}",
                    result.episode_index,
                    result
                        .issues
                        .iter()
                        .map(|i| i.code.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                failures.push(ValidationFailure {
                    episode_index: result.episode_index,
                    issues: result.issues.clone(),
                });
            }
        }
        results.push(result);
    }

    ValidationOutcome {
        results,
        failures,
        validated,
        summary,
    }
}

pub struct ValidateStep;

impl PipelineStep for ValidateStep {
    #[instrument(skip_all, name = "validate")]
    fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
        let layout = &ctx.layout;
        let manifest: Manifest = storage::read_json(&layout.manifest())?;
        let meta = ctx.raw.load_meta()?;
        let limits = ValidationLimits::resolve(&ctx.config.validate, &meta);
        info!(
            "🧪 Validating {} episodes (widths {}/{}, video checks {})",
            manifest.entries.len(),
            limits.action_width,
            limits.state_width,
            if limits.check_video { "on" } else { "off" }
        );

        let previous: Option<Vec<ValidationResult>> =
            match storage::read_json_opt(&layout.validation_results()) {
                Ok(p) => p,
                Err(PipelineError::InvalidArtifact { path, reason }) => {
                    warn!("Ignoring unreadable prior results {}: {}", path.display(), reason);
                    None
                }
                Err(e) => return Err(e),
            };

        let pool = ctx.config.thread_pool()?;
        let outcome = validate_manifest(
            &manifest,
            &meta,
            &limits,
            ctx.probe.as_ref(),
            previous.as_deref(),
            &pool,
        );

        storage::write_json(&layout.validation_results(), &outcome.results)?;
        storage::write_jsonl(&layout.validation_failures(), &outcome.failures)?;
        storage::write_jsonl(&layout.validated_episodes(), &outcome.validated)?;
        storage::write_json(&layout.validated_ids(), &outcome.validated_ids())?;
        storage::write_json(&layout.validation_summary(), &outcome.summary)?;

        let s = &outcome.summary;
        info!(
            "📋 Validation: {} passed, {} failed, {} pending, {} reused of {}",
            s.validated, s.failed, s.pending, s.reused, s.total
        );
        let flagged = outcome.validated.iter().filter(|v| !v.warnings.is_empty()).count() as u64;
        let reasons = reason_histogram(
            s.issue_histogram
                .iter()
                .map(|(code, n)| (code.to_string(), *n))
                .chain(std::iter::once(("pending".to_string(), s.pending))),
        );
        Ok(StepResult::new(
            VALIDATE_STEP,
            s.total,
            format!("{} episodes validated", s.validated),
        )
        .with_excluded(s.failed)
        .with_flagged(flagged)
        .with_reasons(reasons))
    }

    fn step_name(&self) -> &'static str {
        VALIDATE_STEP
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![DISCOVER_STEP]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::table::write_episode_table;
    use crate::video::VideoMeta;
    use tempfile::tempdir;

    struct FixedProbe(Option<VideoMeta>);

    impl VideoProbe for FixedProbe {
        fn probe(&self, _path: &Path) -> Option<VideoMeta> {
            self.0
        }
    }

    fn limits() -> ValidationLimits {
        ValidationLimits {
            action_width: 3,
            state_width: 3,
            target_fps: 30.0,
            fps_tolerance: 1.0,
            frame_tolerance: 2,
            max_null_row_fraction: 0.05,
            check_video: false,
        }
    }

    fn frames(n: i64) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame {
                action: Some(vec![0.1; 3]),
                observation_state: Some(vec![0.2; 3]),
                timestamp: Some(i as f64 / 30.0),
                frame_index: Some(i),
                episode_index: Some(3),
                task_index: Some(0),
                index: Some(i),
            })
            .collect()
    }

    fn entry(parquet: &Path) -> ManifestEntry {
        ManifestEntry {
            episode_index: 3,
            chunk: "000".into(),
            parquet_uri: Some(parquet.display().to_string()),
            video_front_uri: Some("front.mp4".into()),
            video_wrist_uri: None,
            bytes_total: 0,
            fingerprint: Some("abc".into()),
            status: EpisodeStatus::New,
            errors: None,
        }
    }

    fn meta(len: u64) -> DatasetMeta {
        DatasetMeta {
            lengths: [(3, len)].into_iter().collect(),
            info: None,
        }
    }

    fn codes(issues: &[Issue]) -> Vec<IssueCode> {
        issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn clean_episode_passes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.parquet");
        write_episode_table(&path, &EpisodeTable::new(frames(40))).unwrap();

        let r = validate_episode(&entry(&path), &meta(40), &limits(), &FixedProbe(None));
        assert!(r.passed, "{:?}", r.issues);
        assert!(r.warnings.is_empty());
        assert_eq!(r.rows, Some(40));
        assert_eq!((r.frame_min, r.frame_max), (Some(0), Some(39)));
    }

    #[test]
    fn all_issues_are_collected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.parquet");
        let mut f = frames(20);
        f[4].action = Some(vec![0.0; 5]);
        f[10].frame_index = Some(2);
        f[11].episode_index = Some(9);
        write_episode_table(&path, &EpisodeTable::new(f)).unwrap();

        let r = validate_episode(&entry(&path), &meta(30), &limits(), &FixedProbe(None));
        assert!(!r.passed);
        assert_eq!(
            codes(&r.issues),
            vec![
                IssueCode::WidthMismatch,
                IssueCode::BadFrameOrder,
                IssueCode::EpisodeIndexMismatch,
                IssueCode::LengthMismatch,
            ]
        );
    }

    #[test]
    fn duplicates_and_sparse_nulls_are_warnings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.parquet");
        let mut f = frames(40);
        f[5].frame_index = Some(4);
        f[20].observation_state = None;
        write_episode_table(&path, &EpisodeTable::new(f)).unwrap();

        let r = validate_episode(&entry(&path), &meta(40), &limits(), &FixedProbe(None));
        assert!(r.passed, "{:?}", r.issues);
        assert_eq!(
            codes(&r.warnings),
            vec![IssueCode::NullRowsRecoverable, IssueCode::DuplicateFrames, IssueCode::FrameIndexGap]
        );
    }

    #[test]
    fn dense_nulls_fail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.parquet");
        let mut f = frames(10);
        f[1].timestamp = None;
        write_episode_table(&path, &EpisodeTable::new(f)).unwrap();

        let r = validate_episode(&entry(&path), &meta(10), &limits(), &FixedProbe(None));
        assert_eq!(codes(&r.issues), vec![IssueCode::NullValues]);
    }

    #[test]
    fn video_checks_use_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.parquet");
        write_episode_table(&path, &EpisodeTable::new(frames(50))).unwrap();
        let mut l = limits();
        l.check_video = true;

        let good = FixedProbe(Some(VideoMeta {
            fps: Some(30.0),
            frame_count: Some(51),
        }));
        assert!(validate_episode(&entry(&path), &meta(50), &l, &good).passed);

        let bad = FixedProbe(Some(VideoMeta {
            fps: Some(15.0),
            frame_count: Some(20),
        }));
        let r = validate_episode(&entry(&path), &meta(50), &l, &bad);
        assert_eq!(
            codes(&r.issues),
            vec![IssueCode::VideoFpsMismatch, IssueCode::VideoFrameCountMismatch]
        );

        let r = validate_episode(&entry(&path), &meta(50), &l, &FixedProbe(None));
        assert_eq!(codes(&r.issues), vec![IssueCode::VideoMissing]);
    }

    #[test]
    fn missing_entry_fails_without_reading() {
        let mut e = entry(Path::new("/nonexistent.parquet"));
        e.status = EpisodeStatus::Missing;
        e.errors = Some("missing files: parquet".into());
        let r = validate_episode(&e, &meta(10), &limits(), &FixedProbe(None));
        assert_eq!(codes(&r.issues), vec![IssueCode::MissingSource]);
        assert_eq!(r.issues[0].detail, "missing files: parquet");
    }

    fn unchanged_manifest(parquet: &Path) -> Manifest {
        let mut e = entry(parquet);
        e.status = EpisodeStatus::Unchanged;
        Manifest {
            fingerprint_algo: "x".into(),
            stage_version: "x".into(),
            entries: vec![e],
        }
    }

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap()
    }

    fn prior_pass() -> ValidationResult {
        ValidationResult {
            episode_index: 3,
            chunk: "000".into(),
            fingerprint: Some("abc".into()),
            passed: true,
            issues: vec![],
            warnings: vec![],
            checked_fields: vec![],
            rows: Some(10),
            expected_rows: Some(10),
            frame_min: Some(0),
            frame_max: Some(9),
            checks_id: limits().checks_id(Some(10)),
        }
    }

    #[test]
    fn unchanged_entries_reuse_prior_results() {
        let manifest = unchanged_manifest(Path::new("/nonexistent.parquet"));
        let prior = prior_pass();
        let out = validate_manifest(
            &manifest,
            &meta(10),
            &limits(),
            &FixedProbe(None),
            Some(std::slice::from_ref(&prior)),
            &pool(),
        );
        assert_eq!(out.summary.reused, 1);
        assert_eq!(out.results, vec![prior]);
        assert_eq!(out.validated_ids(), vec![3]);
    }

    #[test]
    fn changed_limits_or_meta_length_force_revalidation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("e.parquet");
        write_episode_table(&path, &EpisodeTable::new(frames(10))).unwrap();
        let manifest = unchanged_manifest(&path);
        let prior = prior_pass();
        let short_video = FixedProbe(Some(VideoMeta {
            fps: Some(30.0),
            frame_count: Some(3),
        }));

        let mut with_video = limits();
        with_video.check_video = true;
        let out = validate_manifest(
            &manifest,
            &meta(10),
            &with_video,
            &short_video,
            Some(std::slice::from_ref(&prior)),
            &pool(),
        );
        assert_eq!(out.summary.reused, 0);
        assert_eq!(codes(&out.results[0].issues), vec![IssueCode::VideoFrameCountMismatch]);
        assert_eq!(out.results[0].checks_id, with_video.checks_id(Some(10)));

        let out = validate_manifest(
            &manifest,
            &meta(40),
            &limits(),
            &short_video,
            Some(std::slice::from_ref(&prior)),
            &pool(),
        );
        assert_eq!(out.summary.reused, 0);
        assert_eq!(codes(&out.results[0].issues), vec![IssueCode::LengthMismatch]);
        assert_eq!(out.results[0].expected_rows, Some(40));
    }

    #[test]
    fn checks_id_tracks_every_limit() {
        let base = limits();
        let id = base.checks_id(Some(10));
        assert_eq!(id, limits().checks_id(Some(10)));
        assert_ne!(id, base.checks_id(None));

        let mut wider = limits();
        wider.action_width = 4;
        let mut looser = limits();
        looser.max_null_row_fraction = 0.5;
        let mut slower = limits();
        slower.target_fps = 15.0;
        for other in [wider, looser, slower] {
            assert_ne!(id, other.checks_id(Some(10)));
        }
    }

    #[test]
    fn pending_entries_are_skipped() {
        let mut manifest = unchanged_manifest(Path::new("/nonexistent.parquet"));
        manifest.entries[0].status = EpisodeStatus::Pending;
        let out = validate_manifest(&manifest, &meta(10), &limits(), &FixedProbe(None), None, &pool());
        assert!(out.results.is_empty());
        assert!(out.failures.is_empty());
        assert_eq!((out.summary.total, out.summary.pending, out.summary.failed), (1, 1, 0));
    }
}
