//! Delay computation.
//!
//! Maps the current posture to a wait before the next request. All arithmetic
//! is done in floating point milliseconds and clamped to the configured
//! `[min_delay, max_delay]` range at the end, so no input can produce a zero
//! or unbounded delay.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::classifier::TrafficPattern;
use super::recorder::RollingStats;
use super::state_machine::ControllerState;
use crate::config::{ControllerConfig, DelayConfig};

/// Full input to [`DelayCalculator::delay_for`].
#[derive(Debug, Clone, Copy)]
pub struct DelayRequest<'a> {
    pub state: ControllerState,
    pub pattern: TrafficPattern,
    pub stats: &'a RollingStats,
    pub burst_eligible: bool,
    /// Consecutive failures of the URL about to be requested.
    pub url_failures: u32,
    /// Time left before a Backoff probe is allowed.
    pub cooldown_remaining: Duration,
    /// Hour-of-day risk scaling, 1.0 when neutral.
    pub hour_multiplier: f64,
}

/// Computes delays with upward jitter from an injectable random source.
#[derive(Debug, Clone)]
pub struct DelayCalculator<R: Rng = StdRng> {
    config: DelayConfig,
    burst_multiplier: f64,
    rng: R,
}

impl DelayCalculator<StdRng> {
    /// Seeded from `delay.jitter_seed` when set, otherwise from OS entropy.
    pub fn new(config: &ControllerConfig) -> Self {
        let rng = match config.delay.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::with_rng(config, rng)
    }
}

impl<R: Rng> DelayCalculator<R> {
    pub fn with_rng(config: &ControllerConfig, rng: R) -> Self {
        Self {
            config: config.delay.clone(),
            burst_multiplier: config.burst.multiplier,
            rng,
        }
    }

    /// Delay for a request with no URL history and no pending cool-down.
    pub fn delay(
        &mut self,
        state: ControllerState,
        pattern: TrafficPattern,
        stats: &RollingStats,
        burst_eligible: bool,
    ) -> Duration {
        self.delay_for(&DelayRequest {
            state,
            pattern,
            stats,
            burst_eligible,
            url_failures: 0,
            cooldown_remaining: Duration::ZERO,
            hour_multiplier: 1.0,
        })
    }

    pub fn delay_for(&mut self, req: &DelayRequest<'_>) -> Duration {
        let c = &self.config;

        let mut ms = self.base_ms(req.state)
            * self.pattern_multiplier(req.pattern)
            * req.hour_multiplier;

        if req.burst_eligible && req.state == ControllerState::Healthy {
            ms *= self.burst_multiplier;
        } else {
            if matches!(
                req.state,
                ControllerState::Throttled | ControllerState::Backoff
            ) {
                let exp = req.stats.consecutive_429s.min(c.backoff_exponent_cap);
                ms *= c.backoff_factor.powi(exp as i32);
            }
            let exp = req.url_failures.min(c.url_penalty_cap);
            ms *= c.url_penalty_factor.powi(exp as i32);
        }

        // Clamp before jitter so the jitter range stays finite.
        let max_ms = c.max_delay_ms as f64;
        if ms.is_nan() || ms > max_ms {
            ms = max_ms;
        }

        let span = ms * c.jitter_fraction;
        if span > 0.0 {
            ms += self.rng.random_range(0.0..span);
        }

        let mut delay = millis_to_duration(ms);
        if let Some(hint) = req.stats.retry_after_hint {
            delay = delay.max(hint);
        }
        delay = delay.max(req.cooldown_remaining);

        delay.clamp(c.min_delay(), c.max_delay())
    }

    fn base_ms(&self, state: ControllerState) -> f64 {
        let c = &self.config;
        let ms = match state {
            ControllerState::Healthy => c.healthy_base_ms,
            ControllerState::Warning => c.warning_base_ms,
            ControllerState::Throttled => c.throttled_base_ms,
            ControllerState::Backoff => c.backoff_base_ms,
            // Callers should stop; anyone still asking waits the longest.
            ControllerState::Blocked => c.max_delay_ms,
        };
        ms as f64
    }

    fn pattern_multiplier(&self, pattern: TrafficPattern) -> f64 {
        let c = &self.config;
        match pattern {
            TrafficPattern::Calm => c.calm_multiplier,
            TrafficPattern::Cautious => c.cautious_multiplier,
            TrafficPattern::Degraded => c.degraded_multiplier,
            TrafficPattern::Critical => c.critical_multiplier,
        }
    }
}

fn millis_to_duration(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        return Duration::ZERO;
    }
    if ms.is_infinite() {
        return Duration::MAX;
    }
    let micros = (ms * 1000.0).round();
    if micros >= u64::MAX as f64 {
        Duration::MAX
    } else {
        Duration::from_micros(micros as u64)
    }
}
