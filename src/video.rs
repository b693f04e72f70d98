use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Stream metadata needed by the video consistency check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMeta {
    pub fps: Option<f64>,
    pub frame_count: Option<u64>,
}

/// Source of video metadata. `None` means the file could not be probed.
pub trait VideoProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Option<VideoMeta>;
}

/// Probe backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    pub binary: String,
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self {
            binary: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    nb_frames: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Parse an ffprobe rate such as `30000/1001`.
pub fn parse_rate(rate: &str) -> Option<f64> {
    let (n, d) = rate.split_once('/')?;
    let n: f64 = n.trim().parse().ok()?;
    let d: f64 = d.trim().parse().ok()?;
    if d == 0.0 {
        return None;
    }
    Some(n / d)
}

fn parse_probe_output(bytes: &[u8]) -> Option<VideoMeta> {
    let out: ProbeOutput = serde_json::from_slice(bytes).ok()?;
    let stream = out.streams.into_iter().next()?;
    let avg = stream.avg_frame_rate.as_deref().and_then(parse_rate);
    let real = stream.r_frame_rate.as_deref().and_then(parse_rate);
    Some(VideoMeta {
        fps: avg.filter(|f| *f > 0.0).or(real),
        frame_count: stream.nb_frames.and_then(|n| n.parse().ok()),
    })
}

impl VideoProbe for FfprobeProbe {
    fn probe(&self, path: &Path) -> Option<VideoMeta> {
        if !path.exists() {
            return None;
        }
        let output = Command::new(&self.binary)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=nb_frames,r_frame_rate,avg_frame_rate",
                "-of",
                "json",
            ])
            .arg(path)
            .output();

        match output {
            Ok(out) if out.status.success() => parse_probe_output(&out.stdout),
            Ok(out) => {
                debug!("ffprobe exited with {} for {}", out.status, path.display());
                None
            }
            Err(e) => {
                debug!("ffprobe could not run for {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ntsc_rate() {
        let fps = parse_rate("30000/1001").unwrap();
        assert!((fps - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("30/0"), None);
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn parses_ffprobe_json() {
        let json = br#"{"streams":[{"nb_frames":"50","r_frame_rate":"30/1","avg_frame_rate":"0/0"}]}"#;
        let meta = parse_probe_output(json).unwrap();
        assert_eq!(meta.frame_count, Some(50));
        assert_eq!(meta.fps, Some(30.0));
    }
}
