use serde::{Deserialize, Serialize};

use crate::wire::SessionKey;

/// Traffic direction from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

/// One parsed interval record. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub session: SessionKey,
    pub timestamp_ms: u64,
    pub interval_start: f64,
    pub interval_end: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_pct: Option<f64>,
}

impl MetricSample {
    #[must_use]
    pub fn direction(&self) -> Option<Direction> {
        match (self.up_mbps, self.down_mbps) {
            (Some(_), None) => Some(Direction::Upload),
            (None, Some(_)) => Some(Direction::Download),
            (Some(_), Some(_)) | (None, None) => None,
        }
    }

    /// Same measured interval and direction, as a `[SUM]` line shares with
    /// the per-stream lines it adds up.
    #[must_use]
    pub fn same_interval(&self, other: &Self) -> bool {
        const EPSILON: f64 = 1e-6;
        (self.interval_start - other.interval_start).abs() < EPSILON
            && (self.interval_end - other.interval_end).abs() < EPSILON
            && self.direction() == other.direction()
    }
}
