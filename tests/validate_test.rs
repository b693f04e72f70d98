mod common;

use anyhow::Result;

use common::{episode, Fixture};
use episode_pipeline::config::Config;
use episode_pipeline::pipeline::steps::{DiscoverStep, ValidateStep};
use episode_pipeline::pipeline::{PipelineStep, StepContext};
use episode_pipeline::storage;
use episode_pipeline::types::{IssueCode, ValidationResult, ValidationSummary};

/// One 50-row episode whose stub videos hold `video_frames` frames.
fn one_episode(video_frames: u64) -> Result<Fixture> {
    let fx = Fixture::new()?;
    fx.write_episode(0, episode(0, 50), video_frames)?;
    fx.write_meta(&[(0, 50)])?;
    Ok(fx)
}

fn validate(fx: &Fixture, config: Config) -> Result<(ValidationResult, ValidationSummary, Vec<u64>)> {
    let ctx: StepContext = fx.ctx_with(config);
    ValidateStep.execute(&ctx)?;
    let mut results: Vec<ValidationResult> = storage::read_json(&ctx.layout.validation_results())?;
    let summary = storage::read_json(&ctx.layout.validation_summary())?;
    let ids = storage::read_json(&ctx.layout.validated_ids())?;
    Ok((results.remove(0), summary, ids))
}

fn codes(result: &ValidationResult) -> Vec<IssueCode> {
    result.issues.iter().map(|i| i.code).collect()
}

/// Discover twice so the entry is `unchanged` and eligible for reuse.
fn settle(fx: &Fixture) -> Result<()> {
    let ctx = fx.ctx();
    DiscoverStep.execute(&ctx)?;
    DiscoverStep.execute(&ctx)?;
    Ok(())
}

#[test]
fn enabling_video_checks_revalidates_unchanged_episodes() -> Result<()> {
    let fx = one_episode(5)?;
    let mut lenient = fx.config();
    lenient.validate.skip_video = true;

    settle(&fx)?;
    let (first, _, ids) = validate(&fx, lenient.clone())?;
    assert!(first.passed);
    assert_eq!(ids, vec![0]);

    let (again, summary, _) = validate(&fx, lenient)?;
    assert_eq!(summary.reused, 1);
    assert_eq!(again, first);

    let (strict, summary, ids) = validate(&fx, fx.config())?;
    assert!(!strict.passed);
    assert!(!codes(&strict).is_empty());
    assert!(codes(&strict)
        .iter()
        .all(|c| *c == IssueCode::VideoFrameCountMismatch));
    assert_ne!(strict.checks_id, first.checks_id);
    assert_eq!(summary.reused, 0);
    assert!(ids.is_empty());
    Ok(())
}

#[test]
fn edited_meta_length_revalidates_unchanged_episodes() -> Result<()> {
    let fx = one_episode(50)?;
    settle(&fx)?;
    let (first, _, _) = validate(&fx, fx.config())?;
    assert!(first.passed);
    let (_, summary, _) = validate(&fx, fx.config())?;
    assert_eq!(summary.reused, 1);

    // the episode's own files are untouched, only the recorded length moves
    fx.write_meta(&[(0, 10)])?;
    let (result, summary, ids) = validate(&fx, fx.config())?;
    assert!(!result.passed);
    assert!(codes(&result).contains(&IssueCode::LengthMismatch));
    assert_eq!(result.expected_rows, Some(10));
    assert_eq!(summary.reused, 0);
    assert!(ids.is_empty());
    Ok(())
}

#[test]
fn changed_expected_width_revalidates_unchanged_episodes() -> Result<()> {
    let fx = one_episode(50)?;
    settle(&fx)?;
    let (first, _, _) = validate(&fx, fx.config())?;
    assert!(first.passed);

    let mut narrower = fx.config();
    narrower.validate.action_dim = 7;
    let (result, summary, _) = validate(&fx, narrower)?;
    assert!(!result.passed);
    assert!(codes(&result).contains(&IssueCode::WidthMismatch));
    assert_eq!(summary.reused, 0);
    Ok(())
}
