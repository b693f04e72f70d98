mod common;

use anyhow::Result;
use std::fs;

use common::{episode, stats_line, Fixture};
use episode_pipeline::config::LinkMode;
use episode_pipeline::constants::FRONT_CAMERA;
use episode_pipeline::error::PipelineError;
use episode_pipeline::pipeline::steps::MaterializeStep;
use episode_pipeline::pipeline::{Pipeline, PipelineStep};
use episode_pipeline::storage;
use episode_pipeline::pipeline::steps::materialize::MANIFEST_FILE;
use episode_pipeline::types::{DatasetIndexRow, DatasetManifest, Split};

const EPISODES: u64 = 24;

fn many_episodes() -> Result<Fixture> {
    let fx = Fixture::new()?;
    let mut lengths = Vec::new();
    let mut stats = Vec::new();
    for idx in 0..EPISODES {
        let rows = 8 + (idx as i64 % 5);
        let frames = episode(idx, rows);
        fx.write_episode(idx, frames.clone(), rows as u64)?;
        lengths.push((idx, rows as u64));
        stats.push(stats_line(idx, &frames));
    }
    fx.write_meta(&lengths)?;
    fx.write_stats(&stats)?;
    Ok(fx)
}

fn assignments(index: &[DatasetIndexRow]) -> Vec<(u64, Split)> {
    let mut out: Vec<(u64, Split)> = index.iter().map(|r| (r.episode_index, r.split)).collect();
    out.sort();
    out
}

#[test]
fn splits_do_not_depend_on_worker_count() -> Result<()> {
    let fx = many_episodes()?;

    let mut single = fx.config();
    single.workers = 1;
    single.paths.work_root = fx.dir.path().join("work-1");
    let mut wide = fx.config();
    wide.workers = 8;
    wide.paths.work_root = fx.dir.path().join("work-8");

    let a = fx.ctx_with(single);
    let b = fx.ctx_with(wide);
    Pipeline::full().run(&a)?;
    Pipeline::full().run(&b)?;

    let ia: Vec<DatasetIndexRow> = storage::read_json(&a.layout.dataset_dir().join("dataset_index.json"))?;
    let ib: Vec<DatasetIndexRow> = storage::read_json(&b.layout.dataset_dir().join("dataset_index.json"))?;
    assert_eq!(ia.len() as u64, EPISODES);
    assert_eq!(assignments(&ia), assignments(&ib));
    assert_eq!(
        fs::read(a.layout.dataset_dir().join("_manifest.json"))?,
        fs::read(b.layout.dataset_dir().join("_manifest.json"))?
    );
    Ok(())
}

#[test]
fn seed_changes_assignment() -> Result<()> {
    let fx = many_episodes()?;
    let ctx = fx.ctx();
    Pipeline::full().run(&ctx)?;
    let before: Vec<DatasetIndexRow> =
        storage::read_json(&ctx.layout.dataset_dir().join("dataset_index.json"))?;

    let mut config = fx.config();
    config.materialize.seed = 1234;
    let reseeded = fx.ctx_with(config);
    MaterializeStep.execute(&reseeded)?;
    let after: Vec<DatasetIndexRow> =
        storage::read_json(&ctx.layout.dataset_dir().join("dataset_index.json"))?;

    assert_eq!(before.len(), after.len());
    assert_ne!(assignments(&before), assignments(&after));
    Ok(())
}

#[test]
fn missing_video_aborts_and_keeps_previous_dataset() -> Result<()> {
    let fx = many_episodes()?;
    let ctx = fx.ctx();
    Pipeline::full().run(&ctx)?;
    let index_path = ctx.layout.dataset_dir().join("dataset_index.json");
    let before = fs::read(&index_path)?;

    fs::remove_file(fx.video_path(FRONT_CAMERA, 5))?;
    let err = MaterializeStep.execute(&ctx).unwrap_err();
    assert!(matches!(err, PipelineError::MissingVideo { episode_index: 5, .. }));
    assert_eq!(fs::read(&index_path)?, before);
    Ok(())
}

#[test]
fn manifest_only_mode_records_sources() -> Result<()> {
    let fx = many_episodes()?;
    let mut config = fx.config();
    config.materialize.link_videos = LinkMode::ManifestOnly;
    let ctx = fx.ctx_with(config);
    Pipeline::full().run(&ctx)?;

    let index: Vec<DatasetIndexRow> =
        storage::read_json(&ctx.layout.dataset_dir().join("dataset_index.json"))?;
    let row = index.iter().find(|r| r.episode_index == 3).unwrap();
    let front = row.videos[FRONT_CAMERA].as_deref().unwrap();
    assert_eq!(front, fx.video_path(FRONT_CAMERA, 3).display().to_string());
    let partition = ctx
        .layout
        .dataset_dir()
        .join(format!("split={}", row.split))
        .join("chunk=000");
    assert!(partition.join("episode_000003.parquet").is_file());
    assert!(!partition.join("videos").exists());
    Ok(())
}

#[cfg(unix)]
#[test]
fn hardlink_mode_shares_the_source_inode() -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let fx = many_episodes()?;
    let mut config = fx.config();
    config.materialize.link_videos = LinkMode::Hardlink;
    let ctx = fx.ctx_with(config);
    Pipeline::full().run(&ctx)?;

    let dataset = ctx.layout.dataset_dir();
    let index: Vec<DatasetIndexRow> = storage::read_json(&dataset.join("dataset_index.json"))?;
    assert_eq!(index.len() as u64, EPISODES);
    for row in &index {
        let placed = dataset.join(row.videos[FRONT_CAMERA].as_deref().unwrap());
        assert!(!fs::symlink_metadata(&placed)?.file_type().is_symlink());
        let linked = fs::metadata(&placed)?;
        let source = fs::metadata(fx.video_path(FRONT_CAMERA, row.episode_index))?;
        assert_eq!(linked.ino(), source.ino());
        assert!(source.nlink() >= 2);
    }

    let manifest: DatasetManifest = storage::read_json(&dataset.join(MANIFEST_FILE))?;
    assert_eq!(manifest.link_videos, "hardlink");
    Ok(())
}
