//! The pacing controller: the single entry point used by a crawl loop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::burst::BurstController;
use super::classifier::{TrafficPattern, TrafficPatternClassifier};
use super::delay::{DelayCalculator, DelayRequest};
use super::hourly::{HourSummary, HourlyLedger};
use super::outcome::{OutcomeKind, RequestOutcome};
use super::recorder::{OutcomeRecorder, RollingStats, SessionTotals};
use super::state_machine::{
    AntiBlockingStateMachine, ControllerState, Transition, TransitionInput, TransitionReason,
};
use crate::config::{ConfigError, ControllerConfig};

/// Hours listed on each side of the blocking report.
const REPORT_HOURS: usize = 3;

/// A state change with its wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub at: DateTime<Utc>,
    pub from: ControllerState,
    pub to: ControllerState,
    pub reason: TransitionReason,
}

/// Read-only view for metrics and logging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub state: ControllerState,
    pub pattern: TrafficPattern,
    pub success_rate: f64,
    pub consecutive_429s: u32,
    pub consecutive_failures: u32,
    pub burst_eligible: bool,
    pub samples: usize,
    pub totals: SessionTotals,
    pub burst_activations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlFailures {
    pub url: String,
    pub consecutive_failures: u32,
}

/// Summary of how hard the target is pushing back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingReport {
    pub state: ControllerState,
    pub totals: SessionTotals,
    pub requests_per_minute: f64,
    /// Share of all requests answered with 429.
    pub rate_limit_ratio: f64,
    /// Share of all requests answered with a ban status.
    pub ban_ratio: f64,
    pub transitions: usize,
    pub most_failing_urls: Vec<UrlFailures>,
    /// Rated hours with the lowest block rate, best first.
    pub best_hours: Vec<HourSummary>,
    /// Rated hours with the highest block rate, worst first.
    pub worst_hours: Vec<HourSummary>,
    /// Start of the next best hour, if any hour is rated yet.
    pub optimal_request_time: Option<DateTime<Utc>>,
}

/// Composes the recorder, classifier, state machine, delay calculator and
/// burst gate.
///
/// Not thread-safe by itself. Several workers pacing one host should share a
/// [`super::PacerHandle`] rather than wrapping this in a lock.
#[derive(Debug)]
pub struct PacingController<R: Rng = StdRng> {
    recorder: OutcomeRecorder,
    classifier: TrafficPatternClassifier,
    machine: AntiBlockingStateMachine,
    delay: DelayCalculator<R>,
    burst: BurstController,
    hourly: HourlyLedger,
    pattern: TrafficPattern,
    /// Last delay handed out during the current 429 streak.
    escalation_floor: Option<Duration>,
    max_consecutive_failures: u32,
    history: VecDeque<TransitionRecord>,
    history_capacity: usize,
}

impl PacingController<StdRng> {
    /// Validate `config` and build a controller with the configured jitter
    /// source.
    pub fn new(config: ControllerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let delay = DelayCalculator::new(&config);
        Ok(Self::build(&config, delay))
    }
}

impl<R: Rng> PacingController<R> {
    /// Validate `config` and build a controller that draws jitter from `rng`.
    pub fn with_rng(config: ControllerConfig, rng: R) -> Result<Self, ConfigError> {
        config.validate()?;
        let delay = DelayCalculator::with_rng(&config, rng);
        Ok(Self::build(&config, delay))
    }

    fn build(config: &ControllerConfig, delay: DelayCalculator<R>) -> Self {
        Self {
            recorder: OutcomeRecorder::new(config),
            classifier: TrafficPatternClassifier::new(config),
            machine: AntiBlockingStateMachine::new(config),
            delay,
            burst: BurstController::new(config),
            hourly: HourlyLedger::new(config),
            pattern: TrafficPattern::Calm,
            escalation_floor: None,
            max_consecutive_failures: config.state.max_consecutive_failures,
            history: VecDeque::with_capacity(config.window.history_capacity),
            history_capacity: config.window.history_capacity,
        }
    }

    /// Absorb one outcome: stats, then pattern, then state, then burst.
    pub fn record_result(&mut self, outcome: &RequestOutcome) {
        let kind = self.recorder.record(outcome);
        self.hourly.record(kind, outcome.wall_time);
        if kind != OutcomeKind::RateLimited {
            self.escalation_floor = None;
        }
        let stats = self.recorder.stats();
        self.pattern = self.classifier.classify(stats);

        let transition = self.machine.evaluate(&TransitionInput {
            kind,
            at: outcome.timestamp,
            stats,
            pattern: self.pattern,
        });
        self.burst.observe(self.pattern, stats, self.machine.state());

        if let Some(t) = transition {
            self.log_transition(t, stats);
            self.push_history(t);
        }
    }

    /// Delay to wait before requesting `url`.
    ///
    /// Takes `&mut self` to draw jitter and to track the escalation floor;
    /// state, pattern and burst decisions are untouched. While 429s keep
    /// arriving back to back, no delay is shorter than the one before it.
    pub fn next_delay(&mut self, url: &str) -> Duration {
        self.next_delay_at(url, Instant::now(), Utc::now())
    }

    /// Same as [`Self::next_delay`] with explicit clock readings, for
    /// replaying recorded traffic.
    pub fn next_delay_at(&mut self, url: &str, now: Instant, wall: DateTime<Utc>) -> Duration {
        let state = self.machine.state();
        let burst_eligible = self.should_burst();
        let req = DelayRequest {
            state,
            pattern: self.pattern,
            stats: self.recorder.stats(),
            burst_eligible,
            url_failures: self.recorder.url_failures(url),
            cooldown_remaining: self.machine.cooldown_remaining(now),
            hour_multiplier: self.hourly.multiplier(wall),
        };
        let mut delay = self.delay.delay_for(&req);
        if req.stats.consecutive_429s > 0 {
            if let Some(floor) = self.escalation_floor {
                delay = delay.max(floor);
            }
            self.escalation_floor = Some(delay);
        }
        debug!(
            url,
            %state,
            pattern = %self.pattern,
            burst = burst_eligible,
            delay_ms = delay.as_millis() as u64,
            "Computed next delay"
        );
        delay
    }

    pub fn current_state(&self) -> ControllerState {
        self.machine.state()
    }

    pub fn current_pattern(&self) -> TrafficPattern {
        self.pattern
    }

    pub fn should_burst(&self) -> bool {
        self.machine.state() == ControllerState::Healthy && self.burst.eligible()
    }

    pub fn stats(&self) -> &RollingStats {
        self.recorder.stats()
    }

    /// False once the target has blocked us, or while the failure streak
    /// is at `state.max_consecutive_failures`.
    pub fn should_continue(&self) -> bool {
        !self.machine.state().is_terminal() && !self.failure_limit_reached()
    }

    /// True while the newest outcomes are an unbroken run of at least
    /// `state.max_consecutive_failures` failures. A success clears it.
    pub fn failure_limit_reached(&self) -> bool {
        self.max_consecutive_failures != 0
            && self.recorder.stats().consecutive_failures >= self.max_consecutive_failures
    }

    pub fn hourly(&self) -> &HourlyLedger {
        &self.hourly
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let stats = self.recorder.stats();
        ControllerSnapshot {
            state: self.machine.state(),
            pattern: self.pattern,
            success_rate: stats.success_rate,
            consecutive_429s: stats.consecutive_429s,
            consecutive_failures: stats.consecutive_failures,
            burst_eligible: self.should_burst(),
            samples: stats.samples,
            totals: self.recorder.totals().clone(),
            burst_activations: self.burst.activations(),
        }
    }

    /// Most recent transitions, oldest first.
    pub fn transitions(&self) -> impl Iterator<Item = &TransitionRecord> + '_ {
        self.history.iter()
    }

    pub fn blocking_report(&self, top_n: usize) -> BlockingReport {
        self.blocking_report_at(top_n, Utc::now())
    }

    /// Report with the optimal request time computed from `now`.
    pub fn blocking_report_at(&self, top_n: usize, now: DateTime<Utc>) -> BlockingReport {
        let totals = self.recorder.totals().clone();
        let ratio = |n: u64| {
            if totals.total == 0 {
                0.0
            } else {
                n as f64 / totals.total as f64
            }
        };
        BlockingReport {
            state: self.machine.state(),
            requests_per_minute: totals.requests_per_minute(),
            rate_limit_ratio: ratio(totals.rate_limited),
            ban_ratio: ratio(totals.banned),
            transitions: self.history.len(),
            most_failing_urls: self
                .recorder
                .most_failing_urls(top_n)
                .into_iter()
                .map(|(url, consecutive_failures)| UrlFailures {
                    url,
                    consecutive_failures,
                })
                .collect(),
            best_hours: self.hourly.best_hours(REPORT_HOURS),
            worst_hours: self.hourly.worst_hours(REPORT_HOURS),
            optimal_request_time: self.hourly.optimal_request_time(now),
            totals,
        }
    }

    /// Operator reset: back to Healthy with an empty window. Lifetime totals,
    /// hourly counters and transition history are kept.
    pub fn reset(&mut self) {
        let from = self.machine.state();
        self.recorder.clear();
        self.machine.reset();
        self.burst.reset();
        self.pattern = TrafficPattern::Calm;
        self.escalation_floor = None;
        info!(%from, "Pacing controller reset by operator");
    }

    fn log_transition(&self, t: Transition, stats: &RollingStats) {
        if t.to == ControllerState::Blocked {
            error!(
                from = %t.from,
                reason = %t.reason,
                "Target has blocked this client, pacing stopped"
            );
        } else if t.to > t.from {
            warn!(
                from = %t.from,
                to = %t.to,
                reason = %t.reason,
                consecutive_429s = stats.consecutive_429s,
                success_rate = stats.success_rate,
                "Escalating pacing state"
            );
        } else {
            info!(
                from = %t.from,
                to = %t.to,
                reason = %t.reason,
                success_rate = stats.success_rate,
                "Pacing state recovered"
            );
        }
    }

    fn push_history(&mut self, t: Transition) {
        if self.history_capacity == 0 {
            return;
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            at: Utc::now(),
            from: t.from,
            to: t.to,
            reason: t.reason,
        });
    }
}
