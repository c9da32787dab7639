//! Outcome recording and rolling statistics.
//!
//! The window is count-bounded: it keeps the most recent `window.capacity`
//! outcomes and evicts the oldest first. Derived statistics are recomputed
//! from the window on every mutation, so a read never observes stale values.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::outcome::{OutcomeKind, RequestOutcome};
use crate::config::ControllerConfig;

/// Statistics derived from the current window contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollingStats {
    /// Number of outcomes currently in the window.
    pub samples: usize,
    pub successes: usize,
    /// `successes / samples`, or 1.0 for an empty window.
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub consecutive_429s: u32,
    pub consecutive_successes: u32,
    /// 429s among the newest `rate_limit_lookback` outcomes.
    pub recent_429s: u32,
    /// Distinct URLs answered with a ban status inside the window.
    pub forbidden_urls: usize,
    #[serde(with = "duration_ms")]
    pub mean_latency: Duration,
    /// Retry-After sent with the newest outcome, if it failed. Capped.
    #[serde(skip)]
    pub retry_after_hint: Option<Duration>,
    pub last_kind: Option<OutcomeKind>,
}

impl Default for RollingStats {
    fn default() -> Self {
        Self {
            samples: 0,
            successes: 0,
            success_rate: 1.0,
            consecutive_failures: 0,
            consecutive_429s: 0,
            consecutive_successes: 0,
            recent_429s: 0,
            forbidden_urls: 0,
            mean_latency: Duration::ZERO,
            retry_after_hint: None,
            last_kind: None,
        }
    }
}

/// Lifetime counters, unaffected by window eviction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionTotals {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub banned: u64,
    pub server_errors: u64,
    pub transient: u64,
    #[serde(skip)]
    pub first_at: Option<Instant>,
    #[serde(skip)]
    pub last_at: Option<Instant>,
}

impl SessionTotals {
    fn record(&mut self, kind: OutcomeKind, at: Instant) {
        self.total += 1;
        match kind {
            OutcomeKind::Success => self.successes += 1,
            OutcomeKind::RateLimited => self.rate_limited += 1,
            OutcomeKind::Banned => self.banned += 1,
            OutcomeKind::ServerError => self.server_errors += 1,
            OutcomeKind::Transient => self.transient += 1,
        }
        if !kind.is_success() {
            self.failures += 1;
        }
        self.first_at.get_or_insert(at);
        self.last_at = Some(at);
    }

    /// Requests per minute between the first and last recorded outcome.
    pub fn requests_per_minute(&self) -> f64 {
        match (self.first_at, self.last_at) {
            (Some(first), Some(last)) if last > first => {
                self.total as f64 / (last.duration_since(first).as_secs_f64() / 60.0)
            }
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    url: String,
    kind: OutcomeKind,
    latency: Duration,
    retry_after: Option<Duration>,
}

/// Bounded FIFO of the most recent outcomes.
#[derive(Debug, Clone)]
pub struct OutcomeWindow {
    entries: VecDeque<WindowEntry>,
    capacity: usize,
}

impl OutcomeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, entry: WindowEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn stats(&self, lookback: usize, retry_after_cap: Duration) -> RollingStats {
        let samples = self.entries.len();
        if samples == 0 {
            return RollingStats::default();
        }

        let successes = self.entries.iter().filter(|e| e.kind.is_success()).count();
        let newest_first = || self.entries.iter().rev();
        let streak = |pred: fn(&WindowEntry) -> bool| {
            newest_first().take_while(|e| pred(e)).count() as u32
        };

        let forbidden: HashSet<&str> = self
            .entries
            .iter()
            .filter(|e| e.kind == OutcomeKind::Banned)
            .map(|e| e.url.as_str())
            .collect();

        let total_latency = self
            .entries
            .iter()
            .fold(Duration::ZERO, |acc, e| acc.saturating_add(e.latency));
        let newest = self.entries.back();

        RollingStats {
            samples,
            successes,
            success_rate: successes as f64 / samples as f64,
            consecutive_failures: streak(|e| !e.kind.is_success()),
            consecutive_429s: streak(|e| e.kind == OutcomeKind::RateLimited),
            consecutive_successes: streak(|e| e.kind.is_success()),
            recent_429s: newest_first()
                .take(lookback)
                .filter(|e| e.kind == OutcomeKind::RateLimited)
                .count() as u32,
            forbidden_urls: forbidden.len(),
            mean_latency: total_latency / samples as u32,
            retry_after_hint: newest
                .filter(|e| !e.kind.is_success())
                .and_then(|e| e.retry_after)
                .map(|d| d.min(retry_after_cap)),
            last_kind: newest.map(|e| e.kind),
        }
    }
}

/// Consecutive failures per URL, cleared on that URL's next success.
#[derive(Debug, Clone)]
struct UrlLedger {
    failures: HashMap<String, u32>,
    order: VecDeque<String>,
    capacity: usize,
}

impl UrlLedger {
    fn new(capacity: usize) -> Self {
        Self {
            failures: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn record(&mut self, url: &str, success: bool) {
        if success {
            if self.failures.remove(url).is_some() {
                self.order.retain(|u| u != url);
            }
            return;
        }

        if let Some(count) = self.failures.get_mut(url) {
            *count = count.saturating_add(1);
            return;
        }

        self.failures.insert(url.to_string(), 1);
        self.order.push_back(url.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.failures.remove(&evicted);
            }
        }
    }

    fn get(&self, url: &str) -> u32 {
        self.failures.get(url).copied().unwrap_or(0)
    }

    fn top(&self, n: usize) -> Vec<(String, u32)> {
        let mut urls: Vec<(String, u32)> = self
            .failures
            .iter()
            .map(|(u, c)| (u.clone(), *c))
            .collect();
        urls.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        urls.truncate(n);
        urls
    }

    fn clear(&mut self) {
        self.failures.clear();
        self.order.clear();
    }
}

/// Stores recent outcomes and derives [`RollingStats`] from them.
///
/// Not synchronized: callers sharing one recorder across workers go through
/// [`crate::pacing::PacerHandle`].
#[derive(Debug, Clone)]
pub struct OutcomeRecorder {
    window: OutcomeWindow,
    stats: RollingStats,
    totals: SessionTotals,
    ledger: UrlLedger,
    ban_statuses: Vec<u16>,
    lookback: usize,
    retry_after_cap: Duration,
}

impl OutcomeRecorder {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            window: OutcomeWindow::new(config.window.capacity),
            stats: RollingStats::default(),
            totals: SessionTotals::default(),
            ledger: UrlLedger::new(config.window.url_ledger_capacity),
            ban_statuses: config.state.ban_statuses.clone(),
            lookback: config.classifier.rate_limit_lookback,
            retry_after_cap: config.delay.retry_after_cap(),
        }
    }

    /// Append an outcome, evicting the oldest entry when full. Returns the
    /// outcome's classification.
    pub fn record(&mut self, outcome: &RequestOutcome) -> OutcomeKind {
        let kind = outcome.kind(&self.ban_statuses);

        self.window.push(WindowEntry {
            url: outcome.url.clone(),
            kind,
            latency: outcome.latency,
            retry_after: outcome.retry_after,
        });
        self.totals.record(kind, outcome.timestamp);
        self.ledger.record(&outcome.url, kind.is_success());
        self.stats = self.window.stats(self.lookback, self.retry_after_cap);

        kind
    }

    pub fn stats(&self) -> &RollingStats {
        &self.stats
    }

    pub fn totals(&self) -> &SessionTotals {
        &self.totals
    }

    pub fn window(&self) -> &OutcomeWindow {
        &self.window
    }

    /// Consecutive failures recorded for `url`.
    pub fn url_failures(&self, url: &str) -> u32 {
        self.ledger.get(url)
    }

    /// URLs with the most consecutive failures, worst first.
    pub fn most_failing_urls(&self, n: usize) -> Vec<(String, u32)> {
        self.ledger.top(n)
    }

    /// Drop the window and ledger. Lifetime totals are kept.
    pub fn clear(&mut self) {
        self.window.clear();
        self.ledger.clear();
        self.stats = RollingStats::default();
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
