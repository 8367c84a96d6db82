// Per-paper recency and per-cluster popularity.

use crate::config::{PopularityConfig, RecencyConfig};
use chrono::{DateTime, Utc};

const SECONDS_PER_DAY: f64 = 86_400.0;

impl RecencyConfig {
    /// Linear decay over `horizon_days`, floored at `floor`, capped at 1.0.
    /// Missing dates score `missing_score`.
    pub fn score(&self, published: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f32 {
        let Some(published) = published else {
            return self.missing_score;
        };
        let age_days = (now - published).num_seconds() as f64 / SECONDS_PER_DAY;
        let raw = (1.0 - age_days / self.horizon_days) as f32;
        if raw.is_nan() {
            return self.floor.min(1.0);
        }
        // f32::clamp panics on a NaN or inverted range
        raw.clamp(self.floor.min(1.0), 1.0)
    }
}

impl PopularityConfig {
    /// Blend of mean member recency and saturating cluster size, in [0, 1].
    pub fn score(&self, member_recency: &[f32]) -> f32 {
        if member_recency.is_empty() {
            return 0.0;
        }
        let mean_recency = member_recency.iter().sum::<f32>() / member_recency.len() as f32;
        let size_weight = (member_recency.len() as f32 / self.size_saturation.max(1) as f32).min(1.0);
        (self.recency_weight * mean_recency + self.size_weight * size_weight).clamp(0.0, 1.0)
    }
}
