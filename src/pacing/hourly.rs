//! Hour-of-day block statistics.
//!
//! Some targets throttle harder at certain times of day. Every outcome is
//! counted against its UTC hour; hours with enough samples get a risk level
//! that scales the delay and feeds the blocking report.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::Serialize;

use super::outcome::OutcomeKind;
use crate::config::{ControllerConfig, HourlyConfig};

const HOURS: usize = 24;

/// Block rate band of one hour, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HourRisk {
    VeryLow,
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl fmt::Display for HourRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HourRisk::VeryLow => write!(f, "very_low"),
            HourRisk::Low => write!(f, "low"),
            HourRisk::Moderate => write!(f, "moderate"),
            HourRisk::High => write!(f, "high"),
            HourRisk::VeryHigh => write!(f, "very_high"),
        }
    }
}

impl HourRisk {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HourCounts {
    requests: u64,
    blocks: u64,
}

/// One hour as shown in the blocking report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourSummary {
    pub hour: u32,
    pub requests: u64,
    pub blocks: u64,
    pub block_rate: f64,
    /// None until the hour has `hourly.min_samples` requests.
    pub risk: Option<HourRisk>,
}

/// Per-hour request and block counters.
///
/// A block is a 429 or a ban status. Server errors and transport failures
/// say little about the time of day and are not counted as blocks.
/// Counters live for the whole process and survive an operator reset.
#[derive(Debug, Clone)]
pub struct HourlyLedger {
    config: HourlyConfig,
    hours: [HourCounts; HOURS],
}

impl HourlyLedger {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            config: config.hourly.clone(),
            hours: [HourCounts::default(); HOURS],
        }
    }

    pub fn record(&mut self, kind: OutcomeKind, at: DateTime<Utc>) {
        let counts = &mut self.hours[at.hour() as usize];
        counts.requests += 1;
        if matches!(kind, OutcomeKind::RateLimited | OutcomeKind::Banned) {
            counts.blocks += 1;
        }
    }

    pub fn summary(&self, hour: u32) -> HourSummary {
        let counts = self.hours[hour as usize % HOURS];
        let block_rate = if counts.requests == 0 {
            0.0
        } else {
            counts.blocks as f64 / counts.requests as f64
        };
        let risk = (counts.requests >= self.config.min_samples).then(|| self.band(block_rate));
        HourSummary {
            hour: hour % HOURS as u32,
            requests: counts.requests,
            blocks: counts.blocks,
            block_rate,
            risk,
        }
    }

    /// Delay multiplier for requests sent at `at`. 1.0 while disabled or
    /// until the hour has enough samples.
    pub fn multiplier(&self, at: DateTime<Utc>) -> f64 {
        if !self.config.enabled {
            return 1.0;
        }
        self.summary(at.hour())
            .risk
            .map_or(1.0, |risk| self.config.multipliers[risk.index()])
    }

    /// Up to `n` rated hours with the lowest block rate.
    pub fn best_hours(&self, n: usize) -> Vec<HourSummary> {
        let mut rated = self.rated();
        rated.sort_by(|a, b| by_rate(a, b).then(b.requests.cmp(&a.requests)));
        rated.truncate(n);
        rated
    }

    /// Up to `n` rated hours with the highest block rate.
    pub fn worst_hours(&self, n: usize) -> Vec<HourSummary> {
        let mut rated = self.rated();
        rated.sort_by(|a, b| by_rate(b, a).then(b.requests.cmp(&a.requests)));
        rated.truncate(n);
        rated
    }

    /// Start of the next occurrence of the best rated hour, or `now` if we
    /// are already in it. None until some hour has enough samples.
    pub fn optimal_request_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let best = self.best_hours(1).into_iter().next()?;
        if best.hour == now.hour() {
            return Some(now);
        }
        let start = now
            .with_hour(best.hour)?
            .with_minute(0)?
            .with_second(0)?
            .with_nanosecond(0)?;
        if start < now {
            Some(start + ChronoDuration::days(1))
        } else {
            Some(start)
        }
    }

    fn rated(&self) -> Vec<HourSummary> {
        (0..HOURS as u32)
            .map(|hour| self.summary(hour))
            .filter(|s| s.risk.is_some())
            .collect()
    }

    fn band(&self, block_rate: f64) -> HourRisk {
        let [very_low, low, moderate, high] = self.config.risk_bounds;
        if block_rate <= very_low {
            HourRisk::VeryLow
        } else if block_rate <= low {
            HourRisk::Low
        } else if block_rate <= moderate {
            HourRisk::Moderate
        } else if block_rate <= high {
            HourRisk::High
        } else {
            HourRisk::VeryHigh
        }
    }
}

fn by_rate(a: &HourSummary, b: &HourSummary) -> Ordering {
    a.block_rate.total_cmp(&b.block_rate)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 30, 0).unwrap()
    }

    fn ledger() -> HourlyLedger {
        HourlyLedger::new(&ControllerConfig::default())
    }

    fn fill(ledger: &mut HourlyLedger, hour: u32, requests: u32, blocks: u32) {
        for i in 0..requests {
            let kind = if i < blocks {
                OutcomeKind::RateLimited
            } else {
                OutcomeKind::Success
            };
            ledger.record(kind, at(hour));
        }
    }

    #[test]
    fn test_sparse_hour_is_neutral() {
        let mut ledger = ledger();
        fill(&mut ledger, 3, 9, 9);
        assert_eq!(ledger.summary(3).risk, None);
        assert_eq!(ledger.multiplier(at(3)), 1.0);
    }

    #[test]
    fn test_multiplier_follows_block_rate() {
        let mut ledger = ledger();
        fill(&mut ledger, 1, 20, 0);
        fill(&mut ledger, 2, 20, 2);
        fill(&mut ledger, 3, 20, 4);
        fill(&mut ledger, 4, 20, 6);
        fill(&mut ledger, 5, 20, 10);

        let risks: Vec<_> = (1..=5).map(|h| ledger.summary(h).risk).collect();
        assert_eq!(
            risks,
            vec![
                Some(HourRisk::VeryLow),
                Some(HourRisk::Low),
                Some(HourRisk::Moderate),
                Some(HourRisk::High),
                Some(HourRisk::VeryHigh),
            ]
        );
        let multipliers: Vec<_> = (1..=5).map(|h| ledger.multiplier(at(h))).collect();
        assert_eq!(multipliers, vec![0.8, 0.9, 1.0, 1.3, 1.6]);
    }

    #[test]
    fn test_server_errors_are_not_blocks() {
        let mut ledger = ledger();
        for _ in 0..10 {
            ledger.record(OutcomeKind::ServerError, at(7));
        }
        ledger.record(OutcomeKind::Banned, at(7));
        let summary = ledger.summary(7);
        assert_eq!(summary.requests, 11);
        assert_eq!(summary.blocks, 1);
    }

    #[test]
    fn test_disabled_ledger_keeps_counting_but_does_not_scale() {
        let mut config = ControllerConfig::default();
        config.hourly.enabled = false;
        let mut ledger = HourlyLedger::new(&config);
        fill(&mut ledger, 9, 20, 20);
        assert_eq!(ledger.summary(9).risk, Some(HourRisk::VeryHigh));
        assert_eq!(ledger.multiplier(at(9)), 1.0);
    }

    #[test]
    fn test_best_and_worst_hours() {
        let mut ledger = ledger();
        fill(&mut ledger, 2, 10, 0);
        fill(&mut ledger, 14, 10, 5);
        fill(&mut ledger, 20, 10, 1);
        fill(&mut ledger, 22, 3, 3);

        let best: Vec<_> = ledger.best_hours(2).iter().map(|s| s.hour).collect();
        let worst: Vec<_> = ledger.worst_hours(3).iter().map(|s| s.hour).collect();
        assert_eq!(best, vec![2, 20]);
        // Hour 22 has too few samples to rank.
        assert_eq!(worst, vec![14, 20, 2]);
    }

    #[test]
    fn test_optimal_request_time() {
        let mut ledger = ledger();
        assert_eq!(ledger.optimal_request_time(at(12)), None);

        fill(&mut ledger, 4, 10, 0);
        fill(&mut ledger, 12, 10, 5);

        // 04:00 has passed at 12:30, so tomorrow.
        assert_eq!(
            ledger.optimal_request_time(at(12)),
            Some(Utc.with_ymd_and_hms(2026, 3, 15, 4, 0, 0).unwrap())
        );
        assert_eq!(
            ledger.optimal_request_time(at(1)),
            Some(Utc.with_ymd_and_hms(2026, 3, 14, 4, 0, 0).unwrap())
        );
        assert_eq!(ledger.optimal_request_time(at(4)), Some(at(4)));
    }
}
