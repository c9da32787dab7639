//! `pacer replay`: drive a controller from a recorded trace.
//!
//! Each trace line is a JSON object:
//! `{"url": "...", "status": 429, "latency_ms": 120, "retry_after_secs": 30, "offset_ms": 5000}`.
//! `status` 0 stands for a request that never got a response. Without
//! `offset_ms` the outcome is placed after the delay the controller asked
//! for, as if the crawler had obeyed it.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crawl_pacer::config::ControllerConfig;
use crawl_pacer::pacing::{
    ControllerSnapshot, ControllerState, PacingController, RequestOutcome, NO_RESPONSE,
};

#[derive(Debug, Deserialize)]
struct TraceRecord {
    url: String,
    status: u16,
    #[serde(default)]
    latency_ms: u64,
    #[serde(default)]
    retry_after_secs: Option<u64>,
    #[serde(default)]
    offset_ms: Option<u64>,
}

impl TraceRecord {
    fn into_outcome(self, at: Instant, wall: DateTime<Utc>) -> RequestOutcome {
        let latency = Duration::from_millis(self.latency_ms);
        let outcome = if self.status == NO_RESPONSE {
            RequestOutcome::transport_error(self.url, latency)
        } else {
            RequestOutcome::new(self.url, self.status, latency)
        };
        let outcome = outcome.at(at).at_wall(wall);
        match self.retry_after_secs {
            Some(secs) => outcome.with_retry_after(Duration::from_secs(secs)),
            None => outcome,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReplayLine<'a> {
    line: usize,
    url: &'a str,
    status: u16,
    delay_ms: u64,
    snapshot: ControllerSnapshot,
}

pub async fn cmd_replay(
    trace: &Path,
    config_path: Option<&Path>,
    seed: Option<u64>,
    top: usize,
) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => ControllerConfig::load_from_path(path).await?,
        None => {
            let config = ControllerConfig::default().with_env_overrides();
            config.validate()?;
            config
        }
    };
    if seed.is_some() {
        config.delay.jitter_seed = seed;
    }

    let mut controller = PacingController::new(config)?;
    let file = std::fs::File::open(trace)
        .with_context(|| format!("Failed to open trace {}", trace.display()))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let processed = replay_trace(&mut controller, BufReader::new(file), &mut out)?;

    let report = controller.blocking_report(top);
    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;

    if controller.current_state() == ControllerState::Blocked {
        anyhow::bail!("Target blocked the client after {} requests", processed);
    }
    if controller.failure_limit_reached() {
        anyhow::bail!(
            "Stopped after {} consecutive failures ({} requests replayed)",
            controller.stats().consecutive_failures,
            processed
        );
    }
    Ok(())
}

/// Feed every trace line through `controller`, writing one JSON line per
/// record. Stops early once the controller says to stop. Returns the number
/// of records processed.
///
/// The wall clock starts at the current time and advances with the trace, so
/// hour-of-day statistics follow the simulated timeline.
pub fn replay_trace<R, B, W>(
    controller: &mut PacingController<R>,
    trace: B,
    mut out: W,
) -> anyhow::Result<usize>
where
    R: Rng,
    B: BufRead,
    W: Write,
{
    let start = Instant::now();
    let wall_start = Utc::now();
    let mut clock = start;
    let mut processed = 0;

    for (idx, line) in trace.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: TraceRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid trace record on line {}", idx + 1))?;

        let wall = wall_at(wall_start, clock - start);
        let delay = controller.next_delay_at(&record.url, clock, wall);
        let at = match record.offset_ms {
            Some(ms) => start + Duration::from_millis(ms),
            None => clock + delay,
        };
        clock = clock.max(at);

        let url = record.url.clone();
        let status = record.status;
        let wall = wall_at(wall_start, at - start);
        controller.record_result(&record.into_outcome(at, wall));
        processed += 1;

        let entry = ReplayLine {
            line: idx + 1,
            url: &url,
            status,
            delay_ms: delay.as_millis() as u64,
            snapshot: controller.snapshot(),
        };
        writeln!(out, "{}", serde_json::to_string(&entry)?)?;

        if !controller.should_continue() {
            tracing::warn!(
                line = idx + 1,
                state = %controller.current_state(),
                consecutive_failures = controller.stats().consecutive_failures,
                "Controller says stop, ending replay"
            );
            break;
        }
    }

    Ok(processed)
}

fn wall_at(wall_start: DateTime<Utc>, elapsed: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(elapsed)
        .ok()
        .and_then(|d| wall_start.checked_add_signed(d))
        .unwrap_or(wall_start)
}
