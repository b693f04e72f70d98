//! Global statistics from per-episode summaries.
//!
//! Per-episode records come from `meta/episodes_stats.jsonl`. Their shapes
//! vary: `count` may be a scalar or a per-dimension list, and vector values
//! may be nested (image features). Everything is normalized to flat
//! per-dimension vectors before merging through [`Moments`].

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};

use super::{reason_histogram, STATS_STEP, VALIDATE_STEP};
use crate::constants::STATS_VERSION;
use crate::error::{PipelineError, Result};
use crate::pipeline::moments::{Moments, ShapeMismatch};
use crate::pipeline::{PipelineStep, StepContext, StepResult};
use crate::storage;
use crate::types::{DroppedContribution, FeatureStats, GlobalStats, ReductionMeta};

const MOMENT_KEYS: [&str; 5] = ["count", "min", "max", "mean", "std"];

/// One line of `meta/episodes_stats.jsonl`.
#[derive(Debug, Clone, Deserialize)]
pub struct EpisodeStatsLine {
    pub episode_index: u64,
    #[serde(default)]
    pub stats: BTreeMap<String, Value>,
}

/// Sample count as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Count {
    Scalar(u64),
    PerDim(Vec<u64>),
}

impl Count {
    /// Per-dimension counts for a feature of width `dims`. Scalars and
    /// single-element lists are broadcast.
    pub fn per_dim(&self, dims: usize) -> std::result::Result<Vec<u64>, ShapeMismatch> {
        match self {
            Count::Scalar(n) => Ok(vec![*n; dims]),
            Count::PerDim(v) if v.len() == 1 => Ok(vec![v[0]; dims]),
            Count::PerDim(v) if v.len() == dims => Ok(v.clone()),
            Count::PerDim(v) => Err(ShapeMismatch {
                expected: dims,
                found: v.len(),
            }),
        }
    }
}

/// A single episode's summary for one feature, flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSummary {
    pub count: Count,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureSummary {
    pub fn dims(&self) -> usize {
        self.mean.len()
    }

    pub fn to_moments(&self) -> std::result::Result<Moments, ShapeMismatch> {
        let count = self.count.per_dim(self.dims())?;
        Moments::from_summary(&count, &self.mean, &self.std, &self.min, &self.max)
    }
}

fn flatten_into(value: &Value, out: &mut Vec<f64>) -> bool {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(x) => {
                out.push(x);
                true
            }
            None => false,
        },
        Value::Array(items) => items.iter().all(|v| flatten_into(v, out)),
        _ => false,
    }
}

/// Numbers and arbitrarily nested numeric arrays, flattened row-major.
pub fn flatten_numbers(value: &Value) -> Option<Vec<f64>> {
    let mut out = Vec::new();
    flatten_into(value, &mut out).then_some(out)
}

fn parse_count(value: &Value) -> std::result::Result<Count, String> {
    let values = flatten_numbers(value).ok_or("count is not numeric")?;
    let counts = values
        .iter()
        .map(|c| {
            if *c >= 0.0 && c.fract() == 0.0 {
                Ok(*c as u64)
            } else {
                Err(format!("count {} is not a non-negative integer", c))
            }
        })
        .collect::<std::result::Result<Vec<u64>, String>>()?;
    match (value, counts.as_slice()) {
        (Value::Number(_), [n]) => Ok(Count::Scalar(*n)),
        _ => Ok(Count::PerDim(counts)),
    }
}

/// Parse one feature object, returning the summary and any keys it does not merge.
pub fn parse_feature(value: &Value) -> std::result::Result<(FeatureSummary, Vec<String>), String> {
    let obj = value.as_object().ok_or("feature stats are not an object")?;
    let field = |key: &str| -> std::result::Result<Vec<f64>, String> {
        let v = obj.get(key).ok_or_else(|| format!("{} missing", key))?;
        flatten_numbers(v).ok_or_else(|| format!("{} is not numeric", key))
    };

    let count = parse_count(obj.get("count").ok_or("count missing")?)?;
    let summary = FeatureSummary {
        count,
        min: field("min")?,
        max: field("max")?,
        mean: field("mean")?,
        std: field("std")?,
    };
    let ignored = obj
        .keys()
        .filter(|k| !MOMENT_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    Ok((summary, ignored))
}

/// Most common width; ties go to the smaller width.
fn consensus_dims(dims: impl Iterator<Item = usize>) -> Option<usize> {
    let mut freq: BTreeMap<usize, usize> = BTreeMap::new();
    for d in dims {
        *freq.entry(d).or_insert(0) += 1;
    }
    let best = freq.values().copied().max()?;
    freq.into_iter().find(|(_, n)| *n == best).map(|(d, _)| d)
}

/// SHA-256 over the canonical serialization of the merged features.
pub fn stats_id(features: &BTreeMap<String, FeatureStats>) -> Result<String> {
    let bytes = storage::to_canonical_json(features)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Merge per-episode summaries of validated episodes into one global object.
///
/// `features` restricts the reduction; an empty list reduces every feature
/// seen. Episodes fold in ascending `episode_index` order, so the output is
/// bit-identical for the same inputs regardless of line order.
pub fn reduce(
    per_episode: &[EpisodeStatsLine],
    validated_ids: &[u64],
    features: &[String],
) -> Result<GlobalStats> {
    let validated: BTreeSet<u64> = validated_ids.iter().copied().collect();
    let mut lines: BTreeMap<u64, &EpisodeStatsLine> = BTreeMap::new();
    for line in per_episode.iter().filter(|l| validated.contains(&l.episode_index)) {
        if lines.insert(line.episode_index, line).is_some() {
            warn!("Episode {} has several stats lines; using the last", line.episode_index);
        }
    }

    let mut meta = ReductionMeta {
        episodes_used: lines.len() as u64,
        episodes_without_stats: validated
            .iter()
            .filter(|id| !lines.contains_key(id))
            .copied()
            .collect(),
        ..Default::default()
    };

    let wanted: BTreeSet<String> = if features.is_empty() {
        lines.values().flat_map(|l| l.stats.keys().cloned()).collect()
    } else {
        features.iter().cloned().collect()
    };

    let mut ignored: BTreeSet<String> = BTreeSet::new();
    let mut merged = BTreeMap::new();

    for feature in &wanted {
        let mut parsed: Vec<(u64, FeatureSummary)> = Vec::new();
        for (idx, line) in &lines {
            let Some(raw) = line.stats.get(feature) else {
                continue;
            };
            match parse_feature(raw) {
                Ok((summary, extra)) => {
                    ignored.extend(extra);
                    parsed.push((*idx, summary));
                }
                Err(reason) => meta.dropped.push(DroppedContribution {
                    episode_index: *idx,
                    feature: feature.clone(),
                    reason,
                }),
            }
        }

        let Some(dims) = consensus_dims(parsed.iter().map(|(_, s)| s.dims())) else {
            debug!("No episode reports feature {}", feature);
            continue;
        };

        let mut acc = Moments::empty();
        for (idx, summary) in &parsed {
            let folded = if summary.dims() != dims {
                Err(ShapeMismatch {
                    expected: dims,
                    found: summary.dims(),
                })
            } else {
                summary.to_moments().and_then(|m| acc.merge(&m))
            };
            match folded {
                Ok(next) => acc = next,
                Err(e) => {
                    warn!("Dropping episode {} from {}: {}", idx, feature, e);
                    meta.dropped.push(DroppedContribution {
                        episode_index: *idx,
                        feature: feature.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        if acc.is_empty() {
            debug!("Feature {} has no samples to merge", feature);
            continue;
        }
        merged.insert(feature.clone(), acc.finalize());
    }

    meta.dropped.sort_by(|a, b| {
        (a.episode_index, &a.feature).cmp(&(b.episode_index, &b.feature))
    });
    meta.ignored_fields = ignored.into_iter().collect();

    Ok(GlobalStats {
        stats_version: STATS_VERSION.to_string(),
        stats_id: stats_id(&merged)?,
        features: merged,
        meta,
    })
}

pub struct StatsStep;

impl PipelineStep for StatsStep {
    #[instrument(skip_all, name = "stats")]
    fn execute(&self, ctx: &StepContext) -> Result<StepResult> {
        let validated_ids: Vec<u64> = storage::read_json(&ctx.layout.validated_ids())?;
        let stats_path = ctx.raw.episodes_stats_path();
        let lines: Vec<EpisodeStatsLine> = storage::read_jsonl(&stats_path)
            .map_err(|e| PipelineError::Meta(format!("{}: {}", stats_path.display(), e)))?;
        info!(
            "📊 Reducing stats for {} validated episodes from {} records",
            validated_ids.len(),
            lines.len()
        );

        let global = reduce(&lines, &validated_ids, &ctx.config.stats.features)?;
        storage::write_json(&ctx.layout.global_stats(), &global)?;

        let m = &global.meta;
        for id in &m.episodes_without_stats {
            warn!("Validated episode {} has no stats record", id);
        }
        let flagged: BTreeSet<u64> = m.dropped.iter().map(|d| d.episode_index).collect();
        info!(
            "✅ Global stats {} over {} features ({} contributions dropped)",
            &global.stats_id[..12],
            global.features.len(),
            m.dropped.len()
        );

        let reasons = reason_histogram([
            ("no_stats".to_string(), m.episodes_without_stats.len() as u64),
            ("dropped_contribution".to_string(), m.dropped.len() as u64),
        ]);
        Ok(StepResult::new(
            STATS_STEP,
            m.episodes_used,
            format!("stats_id {}", global.stats_id),
        )
        .with_excluded(m.episodes_without_stats.len() as u64)
        .with_flagged(flagged.len() as u64)
        .with_reasons(reasons))
    }

    fn step_name(&self) -> &'static str {
        STATS_STEP
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec![VALIDATE_STEP]
    }
}
