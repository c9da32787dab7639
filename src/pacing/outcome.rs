//! Request outcomes as reported by the HTTP transport layer.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Status code used for attempts that never produced an HTTP response
/// (timeouts, connection resets, DNS failures).
pub const NO_RESPONSE: u16 = 0;

/// Coarse classification of a single outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    /// HTTP 429.
    RateLimited,
    /// A ban-like status (403 by default): the target has identified us.
    Banned,
    /// 5xx.
    ServerError,
    /// Network failure or any other unsuccessful attempt.
    Transient,
}

impl OutcomeKind {
    /// Classify a completed attempt.
    ///
    /// `ban_statuses` comes from configuration; 429 always wins over it.
    pub fn classify(success: bool, status_code: u16, ban_statuses: &[u16]) -> Self {
        if status_code == 429 {
            OutcomeKind::RateLimited
        } else if ban_statuses.contains(&status_code) {
            OutcomeKind::Banned
        } else if status_code >= 500 {
            OutcomeKind::ServerError
        } else if success && (100..400).contains(&status_code) {
            OutcomeKind::Success
        } else {
            OutcomeKind::Transient
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, OutcomeKind::Success)
    }
}

/// One completed request attempt. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub url: String,
    pub success: bool,
    pub status_code: u16,
    pub latency: Duration,
    pub timestamp: Instant,
    /// Wall-clock completion time, used for hour-of-day statistics.
    pub wall_time: DateTime<Utc>,
    /// Parsed `Retry-After` header, if the server sent one.
    pub retry_after: Option<Duration>,
}

impl RequestOutcome {
    /// Outcome of an attempt that received an HTTP response.
    ///
    /// Success is inferred from the status: 1xx-3xx succeed, everything else
    /// fails.
    pub fn new(url: impl Into<String>, status_code: u16, latency: Duration) -> Self {
        Self {
            url: url.into(),
            success: (100..400).contains(&status_code),
            status_code,
            latency,
            timestamp: Instant::now(),
            wall_time: Utc::now(),
            retry_after: None,
        }
    }

    /// Outcome of an attempt that never got a response.
    pub fn transport_error(url: impl Into<String>, latency: Duration) -> Self {
        Self {
            url: url.into(),
            success: false,
            status_code: NO_RESPONSE,
            latency,
            timestamp: Instant::now(),
            wall_time: Utc::now(),
            retry_after: None,
        }
    }

    /// Build an outcome from fields reported by a transport that tracks
    /// success separately. A claimed success with a non-success status is
    /// recorded as a failure.
    pub fn from_parts(
        url: impl Into<String>,
        success: bool,
        status_code: u16,
        latency: Duration,
        timestamp: Instant,
    ) -> Self {
        Self {
            url: url.into(),
            success: success && (100..400).contains(&status_code),
            status_code,
            latency,
            timestamp,
            wall_time: Utc::now(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn at(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn at_wall(mut self, wall_time: DateTime<Utc>) -> Self {
        self.wall_time = wall_time;
        self
    }

    pub fn kind(&self, ban_statuses: &[u16]) -> OutcomeKind {
        OutcomeKind::classify(self.success, self.status_code, ban_statuses)
    }
}

/// Parse a `Retry-After` header value given in seconds.
/// Returns None if the header is missing or not an integer.
pub fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
    header_value?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
