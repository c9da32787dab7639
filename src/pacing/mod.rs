//! Adaptive request pacing.
//!
//! Decides how long to wait before each request to a rate-limited host,
//! escalating through an anti-blocking state machine as 429s and ban
//! statuses arrive, and relaxing the pace again when the host is calm.
//!
//! A crawl loop feeds every completed request to
//! [`PacingController::record_result`] and asks
//! [`PacingController::next_delay`] before the next one. Workers sharing a
//! host go through a [`PacerHandle`] instead.

mod actor;
mod burst;
mod classifier;
mod controller;
mod delay;
mod error;
mod hourly;
mod outcome;
mod recorder;
mod state_machine;

pub use actor::PacerHandle;
pub use burst::BurstController;
pub use classifier::{TrafficPattern, TrafficPatternClassifier};
pub use controller::{
    BlockingReport, ControllerSnapshot, PacingController, TransitionRecord, UrlFailures,
};
pub use delay::{DelayCalculator, DelayRequest};
pub use error::PacerError;
pub use hourly::{HourRisk, HourSummary, HourlyLedger};
pub use outcome::{parse_retry_after, OutcomeKind, RequestOutcome, NO_RESPONSE};
pub use recorder::{OutcomeRecorder, OutcomeWindow, RollingStats, SessionTotals};
pub use state_machine::{
    step, AntiBlockingStateMachine, ControllerState, MachineState, StateThresholds, Transition,
    TransitionInput, TransitionReason,
};
