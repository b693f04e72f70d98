//! Mergeable per-dimension moments.
//!
//! `Moments` is a commutative monoid under [`Moments::merge`] with
//! [`Moments::empty`] as identity. Each dimension carries its own count, so
//! dimensions with differing valid-sample counts combine correctly. Means and
//! second moments merge with the pairwise update of Chan et al.:
//!
//! ```text
//! n    = na + nb
//! d    = mean_b - mean_a
//! mean = mean_a + d * nb / n
//! M2   = M2_a + M2_b + d^2 * na * nb / n
//! ```
//!
//! which equals `sum n_i * (std_i^2 + (mean_i - mean)^2)` over the parts.

use thiserror::Error;

use crate::types::FeatureStats;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dimension mismatch: expected {expected}, found {found}")]
pub struct ShapeMismatch {
    pub expected: usize,
    pub found: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Moments {
    count: Vec<u64>,
    mean: Vec<f64>,
    /// Sum of squared deviations from the mean
    m2: Vec<f64>,
    min: Vec<f64>,
    max: Vec<f64>,
}

impl Default for Moments {
    fn default() -> Self {
        Self::empty()
    }
}

impl Moments {
    /// The identity element: no dimensions, no samples.
    pub fn empty() -> Self {
        Self {
            count: Vec::new(),
            mean: Vec::new(),
            m2: Vec::new(),
            min: Vec::new(),
            max: Vec::new(),
        }
    }

    /// True when no dimension holds a sample.
    pub fn is_empty(&self) -> bool {
        self.count.iter().all(|c| *c == 0)
    }

    pub fn dims(&self) -> usize {
        self.count.len()
    }

    /// Build from an already-aggregated summary (population std).
    pub fn from_summary(
        count: &[u64],
        mean: &[f64],
        std: &[f64],
        min: &[f64],
        max: &[f64],
    ) -> Result<Self, ShapeMismatch> {
        let d = mean.len();
        for len in [count.len(), std.len(), min.len(), max.len()] {
            if len != d {
                return Err(ShapeMismatch {
                    expected: d,
                    found: len,
                });
            }
        }

        let mut m = Self {
            count: count.to_vec(),
            mean: mean.to_vec(),
            m2: count
                .iter()
                .zip(std)
                .map(|(n, s)| *n as f64 * s * s)
                .collect(),
            min: min.to_vec(),
            max: max.to_vec(),
        };
        // a zero-count dimension contributes nothing, whatever it reported
        for i in 0..d {
            if m.count[i] == 0 {
                m.mean[i] = 0.0;
                m.m2[i] = 0.0;
                m.min[i] = f64::INFINITY;
                m.max[i] = f64::NEG_INFINITY;
            }
        }
        Ok(m)
    }

    /// Moments of raw samples, one vector per frame.
    pub fn from_samples(samples: &[Vec<f64>]) -> Result<Self, ShapeMismatch> {
        let mut acc = Self::empty();
        for sample in samples {
            let ones = vec![1u64; sample.len()];
            let zeros = vec![0.0; sample.len()];
            let one = Self::from_summary(&ones, sample, &zeros, sample, sample)?;
            acc = acc.merge(&one)?;
        }
        Ok(acc)
    }

    /// Combine two partial aggregates.
    pub fn merge(&self, other: &Self) -> Result<Self, ShapeMismatch> {
        if self.dims() == 0 {
            return Ok(other.clone());
        }
        if other.dims() == 0 {
            return Ok(self.clone());
        }
        if self.dims() != other.dims() {
            return Err(ShapeMismatch {
                expected: self.dims(),
                found: other.dims(),
            });
        }

        let d = self.dims();
        let mut out = Self {
            count: vec![0; d],
            mean: vec![0.0; d],
            m2: vec![0.0; d],
            min: vec![0.0; d],
            max: vec![0.0; d],
        };
        for i in 0..d {
            let (na, nb) = (self.count[i], other.count[i]);
            out.min[i] = self.min[i].min(other.min[i]);
            out.max[i] = self.max[i].max(other.max[i]);
            out.count[i] = na + nb;
            if na == 0 {
                out.mean[i] = other.mean[i];
                out.m2[i] = other.m2[i];
                continue;
            }
            if nb == 0 {
                out.mean[i] = self.mean[i];
                out.m2[i] = self.m2[i];
                continue;
            }
            let (na, nb) = (na as f64, nb as f64);
            let n = na + nb;
            let delta = other.mean[i] - self.mean[i];
            out.mean[i] = (na * self.mean[i] + nb * other.mean[i]) / n;
            out.m2[i] = self.m2[i] + other.m2[i] + delta * delta * na * nb / n;
        }
        Ok(out)
    }

    /// Final statistics. Zero-count dimensions report zeros.
    pub fn finalize(&self) -> FeatureStats {
        let d = self.dims();
        let mut stats = FeatureStats {
            count: self.count.clone(),
            min: vec![0.0; d],
            max: vec![0.0; d],
            mean: vec![0.0; d],
            std: vec![0.0; d],
        };
        for i in 0..d {
            let n = self.count[i];
            if n == 0 {
                continue;
            }
            stats.min[i] = self.min[i];
            stats.max[i] = self.max[i];
            stats.mean[i] = self.mean[i];
            stats.std[i] = (self.m2[i] / n as f64).max(0.0).sqrt();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-6 * (1.0 + a.abs().max(b.abs()))
    }

    fn assert_close(a: &FeatureStats, b: &FeatureStats) {
        assert_eq!(a.count, b.count);
        for i in 0..a.dims() {
            assert!(close(a.mean[i], b.mean[i]), "mean {} vs {}", a.mean[i], b.mean[i]);
            assert!(close(a.std[i], b.std[i]), "std {} vs {}", a.std[i], b.std[i]);
            assert_eq!(a.min[i], b.min[i]);
            assert_eq!(a.max[i], b.max[i]);
        }
    }

    #[test]
    fn merged_summaries_match_concatenated_samples() {
        let a: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64, 1.0]).collect();
        let b: Vec<Vec<f64>> = (0..3).map(|i| vec![100.0 + i as f64, 1.0]).collect();

        let direct = {
            let mut all = a.clone();
            all.extend(b.clone());
            Moments::from_samples(&all).unwrap().finalize()
        };

        let sa = Moments::from_samples(&a).unwrap().finalize();
        let sb = Moments::from_samples(&b).unwrap().finalize();
        let merged = Moments::from_summary(&sa.count, &sa.mean, &sa.std, &sa.min, &sa.max)
            .unwrap()
            .merge(&Moments::from_summary(&sb.count, &sb.mean, &sb.std, &sb.min, &sb.max).unwrap())
            .unwrap()
            .finalize();

        assert_close(&merged, &direct);
        // not the mean of means
        assert!((merged.mean[0] - (sa.mean[0] + sb.mean[0]) / 2.0).abs() > 1.0);
        assert_eq!(merged.std[1], 0.0);
    }

    #[test]
    fn empty_is_identity() {
        let m = Moments::from_samples(&[vec![1.0, 2.0], vec![3.0, 5.0]]).unwrap();
        assert_eq!(Moments::empty().merge(&m).unwrap(), m);
        assert_eq!(m.merge(&Moments::empty()).unwrap(), m);
    }

    #[test]
    fn per_dimension_counts_are_respected() {
        let a = Moments::from_summary(&[2, 0], &[1.0, 99.0], &[0.0, 99.0], &[1.0, 99.0], &[1.0, 99.0]).unwrap();
        let b = Moments::from_summary(&[2, 2], &[3.0, 4.0], &[0.0, 0.0], &[3.0, 4.0], &[3.0, 4.0]).unwrap();
        let s = a.merge(&b).unwrap().finalize();
        assert_eq!(s.count, vec![4, 2]);
        assert_eq!(s.mean, vec![2.0, 4.0]);
        assert_eq!(s.std, vec![1.0, 0.0]);
        assert_eq!(s.min, vec![1.0, 4.0]);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let a = Moments::from_samples(&[vec![1.0, 2.0]]).unwrap();
        let b = Moments::from_samples(&[vec![1.0]]).unwrap();
        assert_eq!(a.merge(&b), Err(ShapeMismatch { expected: 2, found: 1 }));
    }

    fn part() -> impl Strategy<Value = Vec<Vec<f64>>> {
        prop::collection::vec(prop::collection::vec(-1e3f64..1e3, 3), 1..20)
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in part(), b in part()) {
            let ma = Moments::from_samples(&a).unwrap();
            let mb = Moments::from_samples(&b).unwrap();
            let x = ma.merge(&mb).unwrap().finalize();
            let y = mb.merge(&ma).unwrap().finalize();
            for i in 0..3 {
                prop_assert!(close(x.mean[i], y.mean[i]));
                prop_assert!(close(x.std[i], y.std[i]));
            }
            prop_assert_eq!(x.count, y.count);
        }

        #[test]
        fn merge_is_associative(a in part(), b in part(), c in part()) {
            let ma = Moments::from_samples(&a).unwrap();
            let mb = Moments::from_samples(&b).unwrap();
            let mc = Moments::from_samples(&c).unwrap();
            let left = ma.merge(&mb).unwrap().merge(&mc).unwrap().finalize();
            let right = ma.merge(&mb.merge(&mc).unwrap()).unwrap().finalize();
            for i in 0..3 {
                prop_assert!(close(left.mean[i], right.mean[i]));
                prop_assert!(close(left.std[i], right.std[i]));
                prop_assert_eq!(left.min[i], right.min[i]);
                prop_assert_eq!(left.max[i], right.max[i]);
            }
        }
    }
}
