//! Controller configuration.
//!
//! Every threshold the pacing controller uses lives here. The configuration is
//! loaded once at startup (TOML, YAML or JSON), optionally overridden from the
//! environment, validated, and then handed to the controller by value. There
//! is no runtime reconfiguration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest growth a capped exponential factor may reach.
const MAX_GROWTH: f64 = 1_000.0;

/// Errors raised while loading or validating a [`ControllerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse {format} config: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },
    #[error("Invalid config `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Outcome window sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Number of most recent outcomes retained (FIFO eviction).
    pub capacity: usize,
    /// Number of URLs tracked by the per-URL failure ledger.
    pub url_ledger_capacity: usize,
    /// Number of state transitions kept for inspection.
    pub history_capacity: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            url_ledger_capacity: 1024,
            history_capacity: 64,
        }
    }
}

/// Traffic pattern bucket boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Minimum success rate for `Calm`.
    pub calm_min_success_rate: f64,
    /// Minimum success rate for `Cautious`.
    pub cautious_min_success_rate: f64,
    /// Minimum success rate for `Degraded`; anything lower is `Critical`.
    pub degraded_min_success_rate: f64,
    /// Consecutive failures that force at least `Degraded`.
    pub degraded_consecutive_failures: u32,
    /// Consecutive failures that force `Critical`.
    pub critical_consecutive_failures: u32,
    /// How many of the newest outcomes are scanned for any 429.
    pub rate_limit_lookback: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            calm_min_success_rate: 0.90,
            cautious_min_success_rate: 0.75,
            degraded_min_success_rate: 0.50,
            degraded_consecutive_failures: 3,
            critical_consecutive_failures: 5,
            rate_limit_lookback: 10,
        }
    }
}

/// State machine thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Consecutive 429s that move Healthy to Warning (k1). Also the
    /// classifier's `Critical` trigger.
    pub warning_429s: u32,
    /// Consecutive 429s that move Warning to Throttled (k2).
    pub throttle_429s: u32,
    /// Consecutive 429s that move Throttled to Backoff (k3).
    pub backoff_429s: u32,
    /// Evaluations a condition must hold before a sustained transition fires.
    pub sustain_window: u32,
    /// Success rate Throttled must hold for `sustain_window` to recover.
    pub recovery_success_rate: f64,
    /// Distinct URLs answered with a ban status inside the window that count
    /// as a ban pattern rather than per-resource access denial.
    pub forbidden_threshold: usize,
    /// Status codes treated as ban signals.
    pub ban_statuses: Vec<u16>,
    /// Cool-down before a probe is allowed out of Backoff.
    pub backoff_cooldown_ms: u64,
    /// Failed probes tolerated before giving up and entering Blocked.
    pub probe_budget: u32,
    /// Consecutive failures after which the crawler is told to stop even
    /// without reaching Blocked. Zero disables the check.
    pub max_consecutive_failures: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            warning_429s: 2,
            throttle_429s: 4,
            backoff_429s: 6,
            sustain_window: 5,
            recovery_success_rate: 0.90,
            forbidden_threshold: 3,
            ban_statuses: vec![403, 451],
            backoff_cooldown_ms: 60_000,
            probe_budget: 3,
            max_consecutive_failures: 25,
        }
    }
}

impl StateConfig {
    pub fn backoff_cooldown(&self) -> Duration {
        Duration::from_millis(self.backoff_cooldown_ms)
    }
}

/// Delay computation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Absolute floor. Zero is rejected.
    pub min_delay_ms: u64,
    /// Absolute ceiling.
    pub max_delay_ms: u64,
    pub healthy_base_ms: u64,
    pub warning_base_ms: u64,
    pub throttled_base_ms: u64,
    pub backoff_base_ms: u64,
    pub calm_multiplier: f64,
    pub cautious_multiplier: f64,
    pub degraded_multiplier: f64,
    pub critical_multiplier: f64,
    /// Growth per consecutive 429 while Throttled or in Backoff.
    pub backoff_factor: f64,
    /// Largest exponent applied to `backoff_factor`.
    pub backoff_exponent_cap: u32,
    /// Upward jitter as a fraction of the computed delay.
    pub jitter_fraction: f64,
    /// Seed for the jitter source. Unset means OS entropy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_seed: Option<u64>,
    /// Ceiling applied to server supplied Retry-After hints.
    pub retry_after_cap_ms: u64,
    /// Growth per consecutive failure of the same URL.
    pub url_penalty_factor: f64,
    /// Largest exponent applied to `url_penalty_factor`.
    pub url_penalty_cap: u32,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 120_000,
            healthy_base_ms: 2_000,
            warning_base_ms: 4_000,
            throttled_base_ms: 8_000,
            backoff_base_ms: 30_000,
            calm_multiplier: 1.0,
            cautious_multiplier: 1.25,
            degraded_multiplier: 1.6,
            critical_multiplier: 2.0,
            backoff_factor: 1.6,
            backoff_exponent_cap: 6,
            jitter_fraction: 0.25,
            jitter_seed: None,
            retry_after_cap_ms: 60_000,
            url_penalty_factor: 1.2,
            url_penalty_cap: 3,
        }
    }
}

impl DelayConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn retry_after_cap(&self) -> Duration {
        Duration::from_millis(self.retry_after_cap_ms)
    }
}

/// Burst mode gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    /// Consecutive qualifying evaluations before a burst is allowed.
    pub streak: u32,
    /// Delay multiplier while bursting, strictly between 0 and 1.
    pub multiplier: f64,
    /// Success rate an evaluation must reach to qualify.
    pub min_success_rate: f64,
    /// Eligible evaluations granted before the streak must be rebuilt.
    pub max_run: u32,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            streak: 5,
            multiplier: 0.5,
            min_success_rate: 0.90,
            max_run: 20,
        }
    }
}

/// Hour-of-day adaptation.
///
/// Requests and blocks (429 or ban status) are counted per UTC hour. Once an
/// hour has `min_samples` requests its block rate picks a risk level, and the
/// risk level picks a delay multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HourlyConfig {
    pub enabled: bool,
    pub min_samples: u64,
    /// Upper block rate bounds for very low, low, moderate and high risk.
    /// Anything above the last bound is very high.
    pub risk_bounds: [f64; 4],
    /// Delay multipliers for very low, low, moderate, high and very high risk.
    pub multipliers: [f64; 5],
}

impl Default for HourlyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_samples: 10,
            risk_bounds: [0.05, 0.10, 0.20, 0.35],
            multipliers: [0.8, 0.9, 1.0, 1.3, 1.6],
        }
    }
}

/// Complete pacing controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub window: WindowConfig,
    pub classifier: ClassifierConfig,
    pub state: StateConfig,
    pub delay: DelayConfig,
    pub burst: BurstConfig,
    pub hourly: HourlyConfig,
}

impl ControllerConfig {
    /// Load configuration from a specific file path.
    ///
    /// The parser is picked from the extension (`toml`, `yaml`/`yml`, anything
    /// else is JSON). Environment overrides are applied before validation.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path).await?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let config = Self::parse(&contents, ext)?.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text in the format named by `ext`.
    pub fn parse(contents: &str, ext: &str) -> Result<Self, ConfigError> {
        match ext {
            "toml" => toml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "TOML",
                message: e.to_string(),
            }),
            "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "YAML",
                message: e.to_string(),
            }),
            _ => serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "JSON",
                message: e.to_string(),
            }),
        }
    }

    /// Apply `PACER_*` environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_u64("PACER_MIN_DELAY_MS") {
            self.delay.min_delay_ms = ms;
        }
        if let Some(ms) = env_u64("PACER_MAX_DELAY_MS") {
            self.delay.max_delay_ms = ms;
        }
        if let Some(seed) = env_u64("PACER_JITTER_SEED") {
            self.delay.jitter_seed = Some(seed);
        }
        self
    }

    /// Reject configurations that would make the controller misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_window()?;
        self.validate_classifier()?;
        self.validate_state()?;
        self.validate_delay()?;
        self.validate_burst()?;
        self.validate_hourly()
    }

    fn validate_window(&self) -> Result<(), ConfigError> {
        if self.window.capacity == 0 {
            return Err(ConfigError::invalid("window.capacity", "must be at least 1"));
        }
        if self.window.url_ledger_capacity == 0 {
            return Err(ConfigError::invalid(
                "window.url_ledger_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    fn validate_classifier(&self) -> Result<(), ConfigError> {
        let c = &self.classifier;
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(c.calm_min_success_rate)
            || !in_unit(c.cautious_min_success_rate)
            || !in_unit(c.degraded_min_success_rate)
        {
            return Err(ConfigError::invalid(
                "classifier",
                "success rate thresholds must lie in (0, 1]",
            ));
        }
        if !(c.calm_min_success_rate > c.cautious_min_success_rate
            && c.cautious_min_success_rate > c.degraded_min_success_rate)
        {
            return Err(ConfigError::invalid(
                "classifier",
                "success rate thresholds must strictly decrease from calm to degraded",
            ));
        }
        if c.degraded_consecutive_failures == 0
            || c.degraded_consecutive_failures > c.critical_consecutive_failures
        {
            return Err(ConfigError::invalid(
                "classifier.degraded_consecutive_failures",
                "must be between 1 and critical_consecutive_failures",
            ));
        }
        if c.rate_limit_lookback == 0 || c.rate_limit_lookback > self.window.capacity {
            return Err(ConfigError::invalid(
                "classifier.rate_limit_lookback",
                format!("must be between 1 and window.capacity ({})", self.window.capacity),
            ));
        }
        Ok(())
    }

    fn validate_state(&self) -> Result<(), ConfigError> {
        let s = &self.state;
        if !(s.warning_429s >= 1
            && s.warning_429s < s.throttle_429s
            && s.throttle_429s < s.backoff_429s)
        {
            return Err(ConfigError::invalid(
                "state",
                format!(
                    "429 thresholds must strictly increase (got {} / {} / {})",
                    s.warning_429s, s.throttle_429s, s.backoff_429s
                ),
            ));
        }
        if s.backoff_429s as usize > self.window.capacity {
            return Err(ConfigError::invalid(
                "state.backoff_429s",
                format!("cannot exceed window.capacity ({})", self.window.capacity),
            ));
        }
        if s.sustain_window == 0 {
            return Err(ConfigError::invalid("state.sustain_window", "must be at least 1"));
        }
        if !(s.recovery_success_rate > 0.0 && s.recovery_success_rate <= 1.0) {
            return Err(ConfigError::invalid(
                "state.recovery_success_rate",
                "must lie in (0, 1]",
            ));
        }
        if s.forbidden_threshold == 0 || s.forbidden_threshold > self.window.capacity {
            return Err(ConfigError::invalid(
                "state.forbidden_threshold",
                format!("must be between 1 and window.capacity ({})", self.window.capacity),
            ));
        }
        let max_failures = s.max_consecutive_failures;
        if max_failures != 0
            && (max_failures <= s.backoff_429s || max_failures as usize > self.window.capacity)
        {
            return Err(ConfigError::invalid(
                "state.max_consecutive_failures",
                format!(
                    "must be 0 (disabled) or between backoff_429s + 1 ({}) and window.capacity ({})",
                    s.backoff_429s + 1,
                    self.window.capacity
                ),
            ));
        }
        if s.backoff_cooldown_ms == 0 {
            return Err(ConfigError::invalid(
                "state.backoff_cooldown_ms",
                "must be positive",
            ));
        }
        Ok(())
    }

    fn validate_delay(&self) -> Result<(), ConfigError> {
        let d = &self.delay;
        if d.min_delay_ms == 0 {
            return Err(ConfigError::invalid("delay.min_delay_ms", "must be positive"));
        }
        if d.min_delay_ms > d.max_delay_ms {
            return Err(ConfigError::invalid(
                "delay.max_delay_ms",
                "must not be smaller than min_delay_ms",
            ));
        }
        let bases = [
            d.healthy_base_ms,
            d.warning_base_ms,
            d.throttled_base_ms,
            d.backoff_base_ms,
        ];
        if bases.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::invalid(
                "delay",
                "state base delays must not decrease from healthy to backoff",
            ));
        }
        if bases
            .iter()
            .any(|b| *b < d.min_delay_ms || *b > d.max_delay_ms)
        {
            return Err(ConfigError::invalid(
                "delay",
                "state base delays must lie within [min_delay_ms, max_delay_ms]",
            ));
        }
        let multipliers = [
            d.calm_multiplier,
            d.cautious_multiplier,
            d.degraded_multiplier,
            d.critical_multiplier,
        ];
        if multipliers.iter().any(|m| !m.is_finite() || *m <= 0.0) {
            return Err(ConfigError::invalid(
                "delay",
                "pattern multipliers must be positive",
            ));
        }
        if multipliers.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::invalid(
                "delay",
                "pattern multipliers must not decrease from calm to critical",
            ));
        }
        if !(d.backoff_factor.is_finite() && d.backoff_factor >= 1.0) {
            return Err(ConfigError::invalid("delay.backoff_factor", "must be >= 1"));
        }
        if !(d.url_penalty_factor.is_finite() && d.url_penalty_factor >= 1.0) {
            return Err(ConfigError::invalid(
                "delay.url_penalty_factor",
                "must be >= 1",
            ));
        }
        let exponent = |cap: u32| i32::try_from(cap).unwrap_or(i32::MAX);
        let growth = [
            (
                "delay.backoff_factor",
                d.backoff_factor.powi(exponent(d.backoff_exponent_cap)),
            ),
            (
                "delay.url_penalty_factor",
                d.url_penalty_factor.powi(exponent(d.url_penalty_cap)),
            ),
        ];
        for (field, factor) in growth {
            if !(factor.is_finite() && factor <= MAX_GROWTH) {
                return Err(ConfigError::invalid(
                    field,
                    format!("factor raised to its cap must not exceed {MAX_GROWTH}"),
                ));
            }
        }
        if !(0.0..1.0).contains(&d.jitter_fraction) {
            return Err(ConfigError::invalid(
                "delay.jitter_fraction",
                "must lie in [0, 1)",
            ));
        }
        Ok(())
    }

    fn validate_burst(&self) -> Result<(), ConfigError> {
        let b = &self.burst;
        if b.streak == 0 {
            return Err(ConfigError::invalid("burst.streak", "must be at least 1"));
        }
        if b.max_run == 0 {
            return Err(ConfigError::invalid("burst.max_run", "must be at least 1"));
        }
        if !(b.multiplier > 0.0 && b.multiplier < 1.0) {
            return Err(ConfigError::invalid(
                "burst.multiplier",
                "must lie strictly between 0 and 1",
            ));
        }
        if !(b.min_success_rate > 0.0 && b.min_success_rate <= 1.0) {
            return Err(ConfigError::invalid(
                "burst.min_success_rate",
                "must lie in (0, 1]",
            ));
        }
        Ok(())
    }

    fn validate_hourly(&self) -> Result<(), ConfigError> {
        let h = &self.hourly;
        if h.min_samples == 0 {
            return Err(ConfigError::invalid("hourly.min_samples", "must be at least 1"));
        }
        let bounds_ok = h.risk_bounds.iter().all(|b| *b > 0.0 && *b < 1.0)
            && h.risk_bounds.windows(2).all(|w| w[0] < w[1]);
        if !bounds_ok {
            return Err(ConfigError::invalid(
                "hourly.risk_bounds",
                "must strictly increase within (0, 1)",
            ));
        }
        let multipliers_ok = h.multipliers.iter().all(|m| m.is_finite() && *m > 0.0)
            && h.multipliers.windows(2).all(|w| w[0] <= w[1]);
        if !multipliers_ok {
            return Err(ConfigError::invalid(
                "hourly.multipliers",
                "must be positive and must not decrease with risk",
            ));
        }
        Ok(())
    }
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|s| s.trim().parse::<u64>().ok())
}
