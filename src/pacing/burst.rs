//! Burst mode gating.

use tracing::{debug, info};

use super::classifier::TrafficPattern;
use super::recorder::RollingStats;
use super::state_machine::ControllerState;
use crate::config::ControllerConfig;

/// Tracks consecutive qualifying evaluations and decides when the delay may
/// be reduced.
///
/// An evaluation qualifies when the pattern is Calm, the success rate meets
/// the configured minimum and the machine is Healthy. Anything else drops
/// the streak to zero at once. A burst lasts at most `max_run` evaluations,
/// after which the streak has to be rebuilt from scratch.
#[derive(Debug, Clone)]
pub struct BurstController {
    required: u32,
    min_success_rate: f64,
    max_run: u32,
    streak: u32,
    run: u32,
    healthy: bool,
    activations: u64,
}

impl BurstController {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            required: config.burst.streak,
            min_success_rate: config.burst.min_success_rate,
            max_run: config.burst.max_run,
            streak: 0,
            run: 0,
            healthy: true,
            activations: 0,
        }
    }

    /// Feed one evaluation. Returns true when this evaluation starts a burst.
    pub fn observe(
        &mut self,
        pattern: TrafficPattern,
        stats: &RollingStats,
        state: ControllerState,
    ) -> bool {
        self.healthy = state == ControllerState::Healthy;
        let qualifies = self.healthy
            && pattern == TrafficPattern::Calm
            && stats.success_rate >= self.min_success_rate;

        if !qualifies {
            if self.run > 0 {
                debug!(%pattern, %state, "Burst cancelled");
            }
            self.streak = 0;
            self.run = 0;
            return false;
        }

        self.streak = self.streak.saturating_add(1);
        if self.streak < self.required {
            return false;
        }

        if self.run >= self.max_run {
            debug!(run = self.run, "Burst run exhausted, rebuilding streak");
            self.streak = 0;
            self.run = 0;
            return false;
        }

        self.run += 1;
        if self.run == 1 {
            self.activations += 1;
            info!(
                streak = self.streak,
                success_rate = stats.success_rate,
                "Entering burst mode"
            );
            return true;
        }
        false
    }

    pub fn eligible(&self) -> bool {
        self.healthy && self.streak >= self.required
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Number of bursts started so far.
    pub fn activations(&self) -> u64 {
        self.activations
    }

    pub fn reset(&mut self) {
        self.streak = 0;
        self.run = 0;
        self.healthy = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(streak: u32, max_run: u32) -> BurstController {
        let mut config = ControllerConfig::default();
        config.burst.streak = streak;
        config.burst.max_run = max_run;
        BurstController::new(&config)
    }

    fn calm(b: &mut BurstController) -> bool {
        b.observe(
            TrafficPattern::Calm,
            &RollingStats::default(),
            ControllerState::Healthy,
        )
    }

    #[test]
    fn test_eligible_after_streak() {
        let mut b = controller(5, 20);
        for _ in 0..4 {
            assert!(!calm(&mut b));
            assert!(!b.eligible());
        }
        assert!(calm(&mut b));
        assert!(b.eligible());
        assert_eq!(b.activations(), 1);
    }

    #[test]
    fn test_non_calm_resets_immediately() {
        let mut b = controller(3, 20);
        for _ in 0..10 {
            calm(&mut b);
        }
        assert!(b.eligible());

        b.observe(
            TrafficPattern::Cautious,
            &RollingStats::default(),
            ControllerState::Healthy,
        );
        assert!(!b.eligible());
        assert_eq!(b.streak(), 0);
    }

    #[test]
    fn test_leaving_healthy_resets() {
        let mut b = controller(3, 20);
        for _ in 0..3 {
            calm(&mut b);
        }
        b.observe(
            TrafficPattern::Calm,
            &RollingStats::default(),
            ControllerState::Warning,
        );
        assert!(!b.eligible());
    }

    #[test]
    fn test_low_success_rate_disqualifies() {
        let mut b = controller(1, 20);
        let stats = RollingStats {
            success_rate: 0.85,
            ..Default::default()
        };
        b.observe(TrafficPattern::Calm, &stats, ControllerState::Healthy);
        assert!(!b.eligible());
    }

    #[test]
    fn test_burst_run_is_bounded() {
        let mut b = controller(2, 3);
        let eligible: Vec<bool> = (0..8)
            .map(|_| {
                calm(&mut b);
                b.eligible()
            })
            .collect();
        // Two to qualify, three in burst, one to reset, then rebuild.
        assert_eq!(
            eligible,
            vec![false, true, true, true, false, false, true, true]
        );
        assert_eq!(b.activations(), 2);
    }
}
