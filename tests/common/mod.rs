//! Synthetic raw datasets for integration tests.
#![allow(dead_code)]

use anyhow::Result;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

use episode_pipeline::config::Config;
use episode_pipeline::constants::{FRONT_CAMERA, WRIST_CAMERA};
use episode_pipeline::dataset::RawDataset;
use episode_pipeline::pipeline::moments::Moments;
use episode_pipeline::pipeline::table::{write_episode_table, EpisodeTable, Frame};
use episode_pipeline::pipeline::StepContext;
use episode_pipeline::video::{VideoMeta, VideoProbe};

pub const WIDTH: usize = 8;

/// Reads `frames=<n>;...` stub video files instead of running ffprobe.
pub struct StubProbe;

impl VideoProbe for StubProbe {
    fn probe(&self, path: &Path) -> Option<VideoMeta> {
        let text = fs::read_to_string(path).ok()?;
        let frames = text.strip_prefix("frames=")?.split(';').next()?.parse().ok()?;
        Some(VideoMeta {
            fps: Some(30.0),
            frame_count: Some(frames),
        })
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub raw: PathBuf,
    pub work: PathBuf,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let dir = tempdir()?;
        let raw = dir.path().join("raw");
        let work = dir.path().join("work");
        fs::create_dir_all(raw.join("meta"))?;
        Ok(Self { dir, raw, work })
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.paths.raw_root = self.raw.clone();
        config.paths.work_root = self.work.clone();
        config.workers = 2;
        config
    }

    pub fn ctx(&self) -> StepContext {
        self.ctx_with(self.config())
    }

    pub fn ctx_with(&self, config: Config) -> StepContext {
        StepContext::with_probe(config, Arc::new(StubProbe))
    }

    pub fn dataset(&self) -> RawDataset {
        RawDataset::new(&self.raw)
    }

    pub fn parquet_path(&self, episode_index: u64) -> PathBuf {
        self.dataset().parquet_path("000", episode_index)
    }

    pub fn video_path(&self, camera: &str, episode_index: u64) -> PathBuf {
        self.dataset().video_path("000", camera, episode_index)
    }

    /// Parquet plus front and wrist stub videos in chunk 000.
    pub fn write_episode(&self, episode_index: u64, frames: Vec<Frame>, video_frames: u64) -> Result<()> {
        self.write_episode_in("000", episode_index, frames, video_frames)
    }

    pub fn write_episode_in(
        &self,
        chunk: &str,
        episode_index: u64,
        frames: Vec<Frame>,
        video_frames: u64,
    ) -> Result<()> {
        let dataset = self.dataset();
        write_episode_table(&dataset.parquet_path(chunk, episode_index), &EpisodeTable::new(frames))?;
        for camera in [FRONT_CAMERA, WRIST_CAMERA] {
            let path = dataset.video_path(chunk, camera, episode_index);
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(&path, format!("frames={};episode={};camera={}", video_frames, episode_index, camera))?;
        }
        Ok(())
    }

    pub fn write_meta(&self, lengths: &[(u64, u64)]) -> Result<()> {
        let mut out = String::new();
        for (idx, len) in lengths {
            out.push_str(&json!({"episode_index": idx, "length": len, "tasks": ["pick cube"]}).to_string());
            out.push('\n');
        }
        fs::write(self.raw.join("meta/episodes.jsonl"), out)?;
        Ok(())
    }

    pub fn write_stats(&self, lines: &[Value]) -> Result<()> {
        let mut out = String::new();
        for line in lines {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        fs::write(self.raw.join("meta/episodes_stats.jsonl"), out)?;
        Ok(())
    }
}

/// Values are multiples of 0.25 so they survive the f32 parquet column exactly.
pub fn value(episode_index: u64, i: i64, d: usize) -> f64 {
    ((episode_index as i64 * 7 + i * 3 + d as i64) % 11) as f64 * 0.25 - 1.0
}

pub fn frame(episode_index: u64, i: i64) -> Frame {
    Frame {
        action: Some((0..WIDTH).map(|d| value(episode_index, i, d)).collect()),
        observation_state: Some((0..WIDTH).map(|d| value(episode_index, i + 5, d) * 2.0).collect()),
        timestamp: Some(i as f64 / 30.0),
        frame_index: Some(i),
        episode_index: Some(episode_index as i64),
        task_index: Some(0),
        index: Some(episode_index as i64 * 1000 + i),
    }
}

pub fn episode(episode_index: u64, rows: i64) -> Vec<Frame> {
    (0..rows).map(|i| frame(episode_index, i)).collect()
}

pub fn action_samples(frames: &[Frame]) -> Vec<Vec<f64>> {
    frames
        .iter()
        .filter_map(|f| f.action.clone())
        .filter(|a| a.len() == WIDTH)
        .collect()
}

pub fn state_samples(frames: &[Frame]) -> Vec<Vec<f64>> {
    frames
        .iter()
        .filter_map(|f| f.observation_state.clone())
        .filter(|s| s.len() == WIDTH)
        .collect()
}

/// Per-episode stats the way the recorder writes them: a scalar count for
/// `action`, a per-dimension count for `observation.state`, plus quantiles.
pub fn stats_line(episode_index: u64, frames: &[Frame]) -> Value {
    let a = Moments::from_samples(&action_samples(frames)).unwrap().finalize();
    let s = Moments::from_samples(&state_samples(frames)).unwrap().finalize();
    json!({
        "episode_index": episode_index,
        "stats": {
            "action": {
                "count": a.count[0],
                "min": a.min, "max": a.max, "mean": a.mean, "std": a.std,
                "q01": a.min, "q99": a.max,
            },
            "observation.state": {
                "count": s.count,
                "min": s.min, "max": s.max, "mean": s.mean, "std": s.std,
            },
        }
    })
}
