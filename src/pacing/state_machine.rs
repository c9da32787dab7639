//! Anti-blocking state machine.
//!
//! Owns the risk posture of the controller. All transition logic lives in the
//! pure [`step`] function; [`AntiBlockingStateMachine`] only stores the result.
//! At most one transition happens per evaluation, so a single outcome can
//! never skip a level.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::classifier::TrafficPattern;
use super::outcome::OutcomeKind;
use super::recorder::RollingStats;
use crate::config::ControllerConfig;

/// Risk posture, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Healthy,
    Warning,
    Throttled,
    Backoff,
    /// Terminal for the lifetime of the controller.
    Blocked,
}

impl ControllerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ControllerState::Blocked)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Healthy => write!(f, "healthy"),
            ControllerState::Warning => write!(f, "warning"),
            ControllerState::Throttled => write!(f, "throttled"),
            ControllerState::Backoff => write!(f, "backoff"),
            ControllerState::Blocked => write!(f, "blocked"),
        }
    }
}

/// Why a transition fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Consecutive 429s reached the threshold for the current state.
    RateLimitThreshold,
    /// Pattern stayed Degraded or worse for the sustain window.
    SustainedDegradation,
    /// A ban status was received.
    BanSignal,
    /// Enough distinct URLs were answered with ban statuses.
    ForbiddenPattern,
    /// Pattern stayed Calm for the sustain window.
    CalmSustained,
    /// Success rate stayed above the recovery threshold for the sustain window.
    RecoverySustained,
    /// First request after the cool-down succeeded.
    ProbeSucceeded,
    /// Too many probes failed.
    ProbeBudgetExhausted,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionReason::RateLimitThreshold => "rate limit threshold",
            TransitionReason::SustainedDegradation => "sustained degradation",
            TransitionReason::BanSignal => "ban signal",
            TransitionReason::ForbiddenPattern => "forbidden pattern",
            TransitionReason::CalmSustained => "calm sustained",
            TransitionReason::RecoverySustained => "recovery sustained",
            TransitionReason::ProbeSucceeded => "probe succeeded",
            TransitionReason::ProbeBudgetExhausted => "probe budget exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ControllerState,
    pub to: ControllerState,
    pub reason: TransitionReason,
}

/// Everything a transition may depend on.
#[derive(Debug, Clone, Copy)]
pub struct TransitionInput<'a> {
    pub kind: OutcomeKind,
    pub at: Instant,
    pub stats: &'a RollingStats,
    pub pattern: TrafficPattern,
}

/// Thresholds consumed by [`step`].
#[derive(Debug, Clone)]
pub struct StateThresholds {
    pub warning_429s: u32,
    pub throttle_429s: u32,
    pub backoff_429s: u32,
    pub sustain_window: u32,
    pub recovery_success_rate: f64,
    pub forbidden_threshold: usize,
    pub cooldown: Duration,
    pub probe_budget: u32,
}

impl StateThresholds {
    pub fn from_config(config: &ControllerConfig) -> Self {
        let s = &config.state;
        Self {
            warning_429s: s.warning_429s,
            throttle_429s: s.throttle_429s,
            backoff_429s: s.backoff_429s,
            sustain_window: s.sustain_window,
            recovery_success_rate: s.recovery_success_rate,
            forbidden_threshold: s.forbidden_threshold,
            cooldown: s.backoff_cooldown(),
            probe_budget: s.probe_budget,
        }
    }
}

/// Full machine data: the posture plus the streaks that drive sustained
/// transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub state: ControllerState,
    pub degraded_streak: u32,
    pub calm_streak: u32,
    pub recovery_streak: u32,
    pub backoff_since: Option<Instant>,
    pub probe_failures: u32,
}

impl MachineState {
    pub fn healthy() -> Self {
        Self::entered(ControllerState::Healthy, None)
    }

    fn entered(state: ControllerState, at: Option<Instant>) -> Self {
        Self {
            state,
            degraded_streak: 0,
            calm_streak: 0,
            recovery_streak: 0,
            backoff_since: if state == ControllerState::Backoff {
                at
            } else {
                None
            },
            probe_failures: 0,
        }
    }
}

fn bump(streak: u32, holds: bool) -> u32 {
    if holds {
        streak.saturating_add(1)
    } else {
        0
    }
}

/// Compute the machine state that follows `current` given one evaluation.
pub fn step(
    current: &MachineState,
    input: &TransitionInput<'_>,
    t: &StateThresholds,
) -> (MachineState, Option<Transition>) {
    use ControllerState::*;

    let stats = input.stats;
    let mut next = current.clone();

    let target = match current.state {
        Healthy => {
            next.degraded_streak = bump(
                current.degraded_streak,
                input.pattern >= TrafficPattern::Degraded,
            );
            if stats.consecutive_429s >= t.warning_429s {
                Some((Warning, TransitionReason::RateLimitThreshold))
            } else if input.kind == OutcomeKind::Banned {
                Some((Warning, TransitionReason::BanSignal))
            } else if next.degraded_streak >= t.sustain_window {
                Some((Warning, TransitionReason::SustainedDegradation))
            } else {
                None
            }
        }
        Warning => {
            next.calm_streak = bump(current.calm_streak, input.pattern == TrafficPattern::Calm);
            if stats.consecutive_429s >= t.throttle_429s {
                Some((Throttled, TransitionReason::RateLimitThreshold))
            } else if stats.forbidden_urls >= t.forbidden_threshold {
                Some((Throttled, TransitionReason::ForbiddenPattern))
            } else if next.calm_streak >= t.sustain_window {
                Some((Healthy, TransitionReason::CalmSustained))
            } else {
                None
            }
        }
        Throttled => {
            next.recovery_streak = bump(
                current.recovery_streak,
                input.kind.is_success() && stats.success_rate >= t.recovery_success_rate,
            );
            if stats.consecutive_429s >= t.backoff_429s {
                Some((Backoff, TransitionReason::RateLimitThreshold))
            } else if input.kind == OutcomeKind::Banned {
                Some((Backoff, TransitionReason::BanSignal))
            } else if next.recovery_streak >= t.sustain_window {
                Some((Warning, TransitionReason::RecoverySustained))
            } else {
                None
            }
        }
        Backoff => {
            let since = current.backoff_since.unwrap_or(input.at);
            if input.at.saturating_duration_since(since) < t.cooldown {
                // Still cooling down; stray outcomes are not probes.
                None
            } else if input.kind.is_success() {
                Some((Throttled, TransitionReason::ProbeSucceeded))
            } else {
                next.probe_failures = current.probe_failures.saturating_add(1);
                next.backoff_since = Some(input.at);
                if next.probe_failures > t.probe_budget {
                    Some((Blocked, TransitionReason::ProbeBudgetExhausted))
                } else {
                    None
                }
            }
        }
        Blocked => None,
    };

    match target {
        Some((to, reason)) => (
            MachineState::entered(to, Some(input.at)),
            Some(Transition {
                from: current.state,
                to,
                reason,
            }),
        ),
        None => (next, None),
    }
}

/// Holds the current [`MachineState`] and applies [`step`] to it.
#[derive(Debug, Clone)]
pub struct AntiBlockingStateMachine {
    machine: MachineState,
    thresholds: StateThresholds,
}

impl AntiBlockingStateMachine {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            machine: MachineState::healthy(),
            thresholds: StateThresholds::from_config(config),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.machine.state
    }

    pub fn machine(&self) -> &MachineState {
        &self.machine
    }

    pub fn thresholds(&self) -> &StateThresholds {
        &self.thresholds
    }

    pub fn evaluate(&mut self, input: &TransitionInput<'_>) -> Option<Transition> {
        let (next, transition) = step(&self.machine, input, &self.thresholds);
        self.machine = next;
        transition
    }

    /// Time left before a Backoff probe is allowed. Zero in any other state.
    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        match (self.machine.state, self.machine.backoff_since) {
            (ControllerState::Backoff, Some(since)) => self
                .thresholds
                .cooldown
                .saturating_sub(now.saturating_duration_since(since)),
            _ => Duration::ZERO,
        }
    }

    /// Operator reset back to Healthy.
    pub fn reset(&mut self) {
        self.machine = MachineState::healthy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> StateThresholds {
        StateThresholds::from_config(&ControllerConfig::default())
    }

    fn machine_in(state: ControllerState, at: Instant) -> MachineState {
        MachineState::entered(state, Some(at))
    }

    fn input<'a>(
        kind: OutcomeKind,
        at: Instant,
        stats: &'a RollingStats,
        pattern: TrafficPattern,
    ) -> TransitionInput<'a> {
        TransitionInput {
            kind,
            at,
            stats,
            pattern,
        }
    }

    #[test]
    fn test_healthy_to_warning_on_429_threshold() {
        let now = Instant::now();
        let stats = RollingStats {
            consecutive_429s: 2,
            ..Default::default()
        };
        let (next, transition) = step(
            &MachineState::healthy(),
            &input(OutcomeKind::RateLimited, now, &stats, TrafficPattern::Critical),
            &thresholds(),
        );
        assert_eq!(next.state, ControllerState::Warning);
        assert_eq!(
            transition.map(|t| t.reason),
            Some(TransitionReason::RateLimitThreshold)
        );
    }

    #[test]
    fn test_healthy_to_warning_on_sustained_degradation() {
        let now = Instant::now();
        let stats = RollingStats {
            success_rate: 0.6,
            ..Default::default()
        };
        let t = thresholds();
        let mut machine = MachineState::healthy();
        for i in 1..=t.sustain_window {
            let (next, transition) = step(
                &machine,
                &input(OutcomeKind::Success, now, &stats, TrafficPattern::Degraded),
                &t,
            );
            machine = next;
            if i < t.sustain_window {
                assert!(transition.is_none());
                assert_eq!(machine.degraded_streak, i);
            } else {
                assert_eq!(
                    transition.map(|t| t.reason),
                    Some(TransitionReason::SustainedDegradation)
                );
            }
        }
        assert_eq!(machine.state, ControllerState::Warning);
    }

    #[test]
    fn test_degraded_streak_resets_on_better_pattern() {
        let now = Instant::now();
        let stats = RollingStats::default();
        let t = thresholds();
        let (machine, _) = step(
            &MachineState::healthy(),
            &input(OutcomeKind::Success, now, &stats, TrafficPattern::Degraded),
            &t,
        );
        assert_eq!(machine.degraded_streak, 1);
        let (machine, _) = step(
            &machine,
            &input(OutcomeKind::Success, now, &stats, TrafficPattern::Cautious),
            &t,
        );
        assert_eq!(machine.degraded_streak, 0);
    }

    #[test]
    fn test_ban_signal_escalates_one_level() {
        let now = Instant::now();
        let stats = RollingStats::default();
        let (next, _) = step(
            &MachineState::healthy(),
            &input(OutcomeKind::Banned, now, &stats, TrafficPattern::Cautious),
            &thresholds(),
        );
        assert_eq!(next.state, ControllerState::Warning);

        let (next, transition) = step(
            &machine_in(ControllerState::Throttled, now),
            &input(OutcomeKind::Banned, now, &stats, TrafficPattern::Cautious),
            &thresholds(),
        );
        assert_eq!(next.state, ControllerState::Backoff);
        assert_eq!(next.backoff_since, Some(now));
        assert_eq!(
            transition.map(|t| t.reason),
            Some(TransitionReason::BanSignal)
        );
    }

    #[test]
    fn test_warning_to_throttled_on_forbidden_pattern() {
        let now = Instant::now();
        let stats = RollingStats {
            forbidden_urls: 3,
            ..Default::default()
        };
        let (next, transition) = step(
            &machine_in(ControllerState::Warning, now),
            &input(OutcomeKind::Banned, now, &stats, TrafficPattern::Degraded),
            &thresholds(),
        );
        assert_eq!(next.state, ControllerState::Throttled);
        assert_eq!(
            transition.map(|t| t.reason),
            Some(TransitionReason::ForbiddenPattern)
        );
    }

    #[test]
    fn test_warning_recovers_after_calm_window() {
        let now = Instant::now();
        let stats = RollingStats::default();
        let t = thresholds();
        let mut machine = machine_in(ControllerState::Warning, now);
        for _ in 0..t.sustain_window {
            machine = step(
                &machine,
                &input(OutcomeKind::Success, now, &stats, TrafficPattern::Calm),
                &t,
            )
            .0;
        }
        assert_eq!(machine.state, ControllerState::Healthy);
    }

    #[test]
    fn test_throttled_recovers_when_success_rate_holds() {
        let now = Instant::now();
        let good = RollingStats {
            success_rate: 0.95,
            ..Default::default()
        };
        let poor = RollingStats {
            success_rate: 0.80,
            ..Default::default()
        };
        let t = thresholds();

        let mut machine = machine_in(ControllerState::Throttled, now);
        for _ in 0..t.sustain_window - 1 {
            machine = step(
                &machine,
                &input(OutcomeKind::Success, now, &good, TrafficPattern::Calm),
                &t,
            )
            .0;
        }
        // A success below the recovery rate breaks the streak.
        machine = step(
            &machine,
            &input(OutcomeKind::Success, now, &poor, TrafficPattern::Cautious),
            &t,
        )
        .0;
        assert_eq!(machine.state, ControllerState::Throttled);
        assert_eq!(machine.recovery_streak, 0);

        for _ in 0..t.sustain_window {
            machine = step(
                &machine,
                &input(OutcomeKind::Success, now, &good, TrafficPattern::Calm),
                &t,
            )
            .0;
        }
        assert_eq!(machine.state, ControllerState::Warning);
    }

    #[test]
    fn test_backoff_ignores_outcomes_during_cooldown() {
        let start = Instant::now();
        let stats = RollingStats::default();
        let t = thresholds();
        let machine = machine_in(ControllerState::Backoff, start);
        let early = start + t.cooldown / 2;

        let (next, transition) = step(
            &machine,
            &input(OutcomeKind::Success, early, &stats, TrafficPattern::Calm),
            &t,
        );
        assert!(transition.is_none());
        assert_eq!(next, machine);
    }

    #[test]
    fn test_backoff_probe_success_returns_to_throttled() {
        let start = Instant::now();
        let stats = RollingStats::default();
        let t = thresholds();
        let (next, transition) = step(
            &machine_in(ControllerState::Backoff, start),
            &input(
                OutcomeKind::Success,
                start + t.cooldown,
                &stats,
                TrafficPattern::Calm,
            ),
            &t,
        );
        assert_eq!(next.state, ControllerState::Throttled);
        assert_eq!(
            transition.map(|t| t.reason),
            Some(TransitionReason::ProbeSucceeded)
        );
    }

    #[test]
    fn test_backoff_exhausts_probe_budget() {
        let start = Instant::now();
        let stats = RollingStats::default();
        let t = thresholds();
        let mut machine = machine_in(ControllerState::Backoff, start);
        let mut at = start;

        for attempt in 1..=t.probe_budget + 1 {
            at += t.cooldown;
            let (next, transition) = step(
                &machine,
                &input(OutcomeKind::RateLimited, at, &stats, TrafficPattern::Critical),
                &t,
            );
            machine = next;
            if attempt <= t.probe_budget {
                assert_eq!(machine.state, ControllerState::Backoff);
                assert_eq!(machine.probe_failures, attempt);
                assert_eq!(machine.backoff_since, Some(at));
            } else {
                assert_eq!(
                    transition.map(|t| t.reason),
                    Some(TransitionReason::ProbeBudgetExhausted)
                );
            }
        }
        assert_eq!(machine.state, ControllerState::Blocked);
    }

    #[test]
    fn test_blocked_is_terminal() {
        let now = Instant::now();
        let stats = RollingStats::default();
        let blocked = machine_in(ControllerState::Blocked, now);
        let (next, transition) = step(
            &blocked,
            &input(
                OutcomeKind::Success,
                now + Duration::from_secs(3600),
                &stats,
                TrafficPattern::Calm,
            ),
            &thresholds(),
        );
        assert!(transition.is_none());
        assert_eq!(next.state, ControllerState::Blocked);
    }

    #[test]
    fn test_step_is_idempotent() {
        let now = Instant::now();
        let stats = RollingStats {
            consecutive_429s: 1,
            recent_429s: 1,
            ..Default::default()
        };
        let machine = MachineState::healthy();
        let i = input(OutcomeKind::RateLimited, now, &stats, TrafficPattern::Degraded);
        assert_eq!(step(&machine, &i, &thresholds()), step(&machine, &i, &thresholds()));
    }

    #[test]
    fn test_cooldown_remaining() {
        let mut sm = AntiBlockingStateMachine::new(&ControllerConfig::default());
        let now = Instant::now();
        assert_eq!(sm.cooldown_remaining(now), Duration::ZERO);

        sm.machine = machine_in(ControllerState::Backoff, now);
        let cooldown = sm.thresholds().cooldown;
        assert_eq!(sm.cooldown_remaining(now), cooldown);
        assert_eq!(
            sm.cooldown_remaining(now + cooldown / 4),
            cooldown - cooldown / 4
        );
        assert_eq!(sm.cooldown_remaining(now + cooldown * 2), Duration::ZERO);

        sm.reset();
        assert_eq!(sm.state(), ControllerState::Healthy);
    }
}
