pub mod align;
pub mod discover;
pub mod materialize;
pub mod stats;
pub mod validate;

use std::collections::BTreeMap;

pub use align::AlignTransformStep;
pub use discover::DiscoverStep;
pub use materialize::MaterializeStep;
pub use stats::StatsStep;
pub use validate::ValidateStep;

pub const DISCOVER_STEP: &str = "discover";
pub const VALIDATE_STEP: &str = "validate";
pub const STATS_STEP: &str = "stats";
pub const TRANSFORM_STEP: &str = "align_transform";
pub const MATERIALIZE_STEP: &str = "materialize";

/// Fold `(reason, count)` pairs into a sorted histogram, dropping zeros.
pub(crate) fn reason_histogram(pairs: impl IntoIterator<Item = (String, u64)>) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for (reason, n) in pairs {
        if n > 0 {
            *out.entry(reason).or_insert(0) += n;
        }
    }
    out
}
