//! End-to-end pacing scenarios driven through the public controller API.

use std::time::{Duration, Instant};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crawl_pacer::config::ControllerConfig;
use crawl_pacer::pacing::{
    ControllerState, PacingController, RequestOutcome, TrafficPattern, TransitionReason,
};

const URL: &str = "https://stats.example.test/players/1";

fn controller() -> PacingController<StdRng> {
    let mut config = ControllerConfig::default();
    config.delay.jitter_fraction = 0.0;
    config.hourly.enabled = false;
    PacingController::with_rng(config, StdRng::seed_from_u64(2024)).unwrap()
}

fn outcome(url: &str, status: u16, at: Instant) -> RequestOutcome {
    RequestOutcome::new(url, status, Duration::from_millis(50)).at(at)
}

/// Drive a controller into Blocked: six 429s reach Backoff, then every probe
/// after the cool-down fails.
fn drive_to_blocked(c: &mut PacingController<StdRng>, start: Instant) -> Instant {
    let config = ControllerConfig::default();
    let mut at = start;
    for _ in 0..config.state.backoff_429s {
        at += Duration::from_millis(100);
        c.record_result(&outcome(URL, 429, at));
    }
    assert_eq!(c.current_state(), ControllerState::Backoff);

    let cooldown = config.state.backoff_cooldown();
    for _ in 0..=config.state.probe_budget {
        at += cooldown;
        c.record_result(&outcome(URL, 429, at));
    }
    assert_eq!(c.current_state(), ControllerState::Blocked);
    at
}

#[test]
fn test_ten_successes_stay_healthy_and_enable_burst() {
    let mut c = controller();
    let streak = ControllerConfig::default().burst.streak;
    let start = Instant::now();

    for i in 1..=10u32 {
        c.record_result(&outcome(URL, 200, start + Duration::from_secs(i as u64)));
        assert_eq!(c.current_state(), ControllerState::Healthy);
        assert_eq!(c.current_pattern(), TrafficPattern::Calm);
        assert_eq!(c.should_burst(), i >= streak, "after {i} successes");
    }

    // Burst halves the healthy base delay.
    assert_eq!(c.next_delay(URL), Duration::from_millis(1_000));
    assert_eq!(c.snapshot().burst_activations, 1);
}

#[test]
fn test_five_429s_escalate_with_non_decreasing_delay() {
    let mut c = controller();
    let start = Instant::now();
    let mut previous = Duration::ZERO;

    for i in 1..=5u64 {
        c.record_result(&outcome(URL, 429, start + Duration::from_secs(i)));
        let delay = c.next_delay(URL);
        assert!(delay >= previous, "{delay:?} < {previous:?} after {i} 429s");
        previous = delay;
    }
    assert!(c.current_state() >= ControllerState::Warning);
    assert!(!c.should_burst());

    c.record_result(&outcome(URL, 200, start + Duration::from_secs(6)));
    assert_eq!(c.stats().consecutive_429s, 0);
}

#[test]
fn test_429_streak_never_shortens_delay_with_jitter() {
    for seed in 0..50 {
        let mut c =
            PacingController::with_rng(ControllerConfig::default(), StdRng::seed_from_u64(seed))
                .unwrap();
        let start = Instant::now();
        let mut previous = Duration::ZERO;

        for i in 1..=5u64 {
            c.record_result(&outcome(URL, 429, start + Duration::from_secs(i)));
            let delay = c.next_delay(URL);
            assert!(
                delay >= previous,
                "seed {seed}: {delay:?} < {previous:?} after {i} 429s"
            );
            previous = delay;
        }
    }
}

#[test]
fn test_blocked_survives_100_successes() {
    let mut c = controller();
    let mut at = drive_to_blocked(&mut c, Instant::now());
    let transitions = c.transitions().count();

    for _ in 0..100 {
        at += Duration::from_secs(120);
        c.record_result(&outcome(URL, 200, at));
        assert_eq!(c.current_state(), ControllerState::Blocked);
    }
    assert!(!c.should_continue());
    assert_eq!(c.transitions().count(), transitions);
    assert_eq!(c.next_delay(URL), ControllerConfig::default().delay.max_delay());
}

#[test]
fn test_ban_statuses_escalate_one_level_at_a_time() {
    let mut c = controller();
    let start = Instant::now();
    let urls = ["/a", "/b", "/c", "/d"];
    let expected = [
        ControllerState::Warning,
        ControllerState::Warning,
        ControllerState::Throttled,
        ControllerState::Backoff,
    ];

    for (i, (url, state)) in urls.iter().zip(expected).enumerate() {
        c.record_result(&outcome(url, 403, start + Duration::from_secs(i as u64)));
        assert_eq!(c.current_state(), state, "after 403 on {url}");
    }

    let reasons: Vec<_> = c.transitions().map(|t| t.reason).collect();
    assert_eq!(
        reasons,
        vec![
            TransitionReason::BanSignal,
            TransitionReason::ForbiddenPattern,
            TransitionReason::BanSignal,
        ]
    );
}

#[test]
fn test_repeated_403_on_one_url_is_not_a_ban_pattern() {
    let mut c = controller();
    let start = Instant::now();
    for i in 0..5 {
        c.record_result(&outcome("/private", 403, start + Duration::from_secs(i)));
    }
    assert_eq!(c.current_state(), ControllerState::Warning);
}

#[test]
fn test_throttled_recovers_to_healthy() {
    let mut c = controller();
    let start = Instant::now();
    let mut at = start;
    for _ in 0..4 {
        at += Duration::from_secs(1);
        c.record_result(&outcome(URL, 429, at));
    }
    assert_eq!(c.current_state(), ControllerState::Throttled);

    // 36 successes bring the window to 90%, five more sustain it.
    for n in 1..=45 {
        at += Duration::from_secs(1);
        c.record_result(&outcome(URL, 200, at));
        let expected = match n {
            1..=39 => ControllerState::Throttled,
            40..=44 => ControllerState::Warning,
            _ => ControllerState::Healthy,
        };
        assert_eq!(c.current_state(), expected, "after {n} successes");
    }

    let reasons: Vec<_> = c.transitions().map(|t| t.reason).collect();
    assert_eq!(
        &reasons[reasons.len() - 2..],
        &[
            TransitionReason::RecoverySustained,
            TransitionReason::CalmSustained,
        ]
    );
}

#[test]
fn test_backoff_probe_after_cooldown_recovers() {
    let mut c = controller();
    let config = ControllerConfig::default();
    let start = Instant::now();
    let mut at = start;
    for _ in 0..config.state.backoff_429s {
        at += Duration::from_millis(100);
        c.record_result(&outcome(URL, 429, at));
    }
    assert_eq!(c.current_state(), ControllerState::Backoff);

    // The delay never undercuts the remaining cool-down.
    let wait = c.next_delay_at(URL, at, Utc::now());
    assert!(wait >= config.state.backoff_cooldown());

    // Too early: ignored.
    c.record_result(&outcome(URL, 200, at + Duration::from_secs(1)));
    assert_eq!(c.current_state(), ControllerState::Backoff);

    c.record_result(&outcome(URL, 200, at + config.state.backoff_cooldown()));
    assert_eq!(c.current_state(), ControllerState::Throttled);
}

#[test]
fn test_retry_after_sets_a_floor() {
    let mut c = controller();
    c.record_result(
        &RequestOutcome::new(URL, 429, Duration::from_millis(30))
            .with_retry_after(Duration::from_secs(30)),
    );
    assert_eq!(c.next_delay(URL), Duration::from_secs(30));
}

#[test]
fn test_operator_reset_after_blocked() {
    let mut c = controller();
    drive_to_blocked(&mut c, Instant::now());

    c.reset();
    assert!(c.should_continue());
    assert_eq!(c.current_state(), ControllerState::Healthy);
    assert_eq!(c.snapshot().totals.total, 10);
}
