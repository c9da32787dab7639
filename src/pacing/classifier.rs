//! Traffic climate classification.

use std::fmt;

use serde::Serialize;

use super::recorder::RollingStats;
use crate::config::ControllerConfig;

/// Coarse classification of recent request health, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficPattern {
    Calm,
    Cautious,
    Degraded,
    Critical,
}

impl fmt::Display for TrafficPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficPattern::Calm => write!(f, "calm"),
            TrafficPattern::Cautious => write!(f, "cautious"),
            TrafficPattern::Degraded => write!(f, "degraded"),
            TrafficPattern::Critical => write!(f, "critical"),
        }
    }
}

/// Maps [`RollingStats`] to a [`TrafficPattern`].
///
/// Holds only thresholds. `classify` is deterministic and never gets less
/// severe as the success rate drops or the failure/429 streaks grow.
#[derive(Debug, Clone)]
pub struct TrafficPatternClassifier {
    calm_min_success_rate: f64,
    cautious_min_success_rate: f64,
    degraded_min_success_rate: f64,
    degraded_consecutive_failures: u32,
    critical_consecutive_failures: u32,
    critical_consecutive_429s: u32,
}

impl TrafficPatternClassifier {
    pub fn new(config: &ControllerConfig) -> Self {
        let c = &config.classifier;
        Self {
            calm_min_success_rate: c.calm_min_success_rate,
            cautious_min_success_rate: c.cautious_min_success_rate,
            degraded_min_success_rate: c.degraded_min_success_rate,
            degraded_consecutive_failures: c.degraded_consecutive_failures,
            critical_consecutive_failures: c.critical_consecutive_failures,
            critical_consecutive_429s: config.state.warning_429s,
        }
    }

    pub fn classify(&self, stats: &RollingStats) -> TrafficPattern {
        if stats.success_rate < self.degraded_min_success_rate
            || stats.consecutive_429s >= self.critical_consecutive_429s
            || stats.consecutive_failures >= self.critical_consecutive_failures
        {
            TrafficPattern::Critical
        } else if stats.success_rate < self.cautious_min_success_rate
            || stats.recent_429s > 0
            || stats.consecutive_failures >= self.degraded_consecutive_failures
        {
            TrafficPattern::Degraded
        } else if stats.success_rate < self.calm_min_success_rate
            || stats.consecutive_failures > 0
        {
            TrafficPattern::Cautious
        } else {
            TrafficPattern::Calm
        }
    }
}
