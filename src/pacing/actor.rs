//! Single-owner actor around a [`PacingController`].
//!
//! Workers targeting the same host share one controller so its view of the
//! host reflects the aggregate request pressure. One task owns the controller
//! and serves commands from a queue; handles are cheap to clone.
//!
//! `pace` hands out request slots: each caller waits for the controller's
//! delay after the previously reserved slot, so concurrent workers are spread
//! out instead of waking together.

use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::controller::{ControllerSnapshot, PacingController};
use super::error::PacerError;
use super::outcome::RequestOutcome;
use super::state_machine::ControllerState;

const COMMAND_QUEUE: usize = 256;

enum Command {
    NextDelay {
        url: String,
        reply: oneshot::Sender<Duration>,
    },
    /// Reserve the next request slot unless pacing must stop.
    Pace {
        url: String,
        reply: oneshot::Sender<Result<Duration, PacerError>>,
    },
    Record(Box<RequestOutcome>),
    State {
        reply: oneshot::Sender<ControllerState>,
    },
    Snapshot {
        reply: oneshot::Sender<ControllerSnapshot>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a controller owned by a background task.
///
/// The task stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct PacerHandle {
    tx: mpsc::Sender<Command>,
}

impl PacerHandle {
    /// Move `controller` into a new task. Must be called inside a tokio runtime.
    pub fn spawn<R>(controller: PacingController<R>) -> Self
    where
        R: Rng + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(run(controller, rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PacerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| PacerError::ActorClosed)?;
        rx.await.map_err(|_| PacerError::ActorClosed)
    }

    pub async fn next_delay(&self, url: &str) -> Result<Duration, PacerError> {
        let url = url.to_string();
        self.request(|reply| Command::NextDelay { url, reply }).await
    }

    /// Queue an outcome. Outcomes are applied in the order they are queued.
    pub async fn record_result(&self, outcome: RequestOutcome) -> Result<(), PacerError> {
        self.tx
            .send(Command::Record(Box::new(outcome)))
            .await
            .map_err(|_| PacerError::ActorClosed)
    }

    pub async fn current_state(&self) -> Result<ControllerState, PacerError> {
        self.request(|reply| Command::State { reply }).await
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot, PacerError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn reset(&self) -> Result<(), PacerError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Wait for the next request slot for `url`.
    ///
    /// Fails without sleeping with [`PacerError::Blocked`] once the target has
    /// blocked us and with [`PacerError::TooManyFailures`] while the failure
    /// limit is reached. Fails with [`PacerError::Cancelled`] as soon as
    /// `cancel` fires. Returns the time that was slept.
    pub async fn pace(&self, url: &str, cancel: &CancellationToken) -> Result<Duration, PacerError> {
        let url = url.to_string();
        let delay = self.request(|reply| Command::Pace { url, reply }).await??;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PacerError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(delay),
        }
    }
}

async fn run<R: Rng>(mut controller: PacingController<R>, mut rx: mpsc::Receiver<Command>) {
    let mut last_slot: Option<Instant> = None;
    while let Some(command) = rx.recv().await {
        // A dropped receiver only means the caller gave up waiting.
        match command {
            Command::NextDelay { url, reply } => {
                let _ = reply.send(controller.next_delay(&url));
            }
            Command::Pace { url, reply } => {
                let slot = if controller.current_state().is_terminal() {
                    Err(PacerError::Blocked)
                } else if controller.failure_limit_reached() {
                    Err(PacerError::TooManyFailures(
                        controller.stats().consecutive_failures,
                    ))
                } else {
                    let delay = controller.next_delay(&url);
                    Ok(reserve_slot(&mut last_slot, Instant::now(), delay))
                };
                let _ = reply.send(slot);
            }
            Command::Record(outcome) => controller.record_result(&outcome),
            Command::State { reply } => {
                let _ = reply.send(controller.current_state());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(controller.snapshot());
            }
            Command::Reset { reply } => {
                controller.reset();
                let _ = reply.send(());
            }
        }
    }
    debug!("All pacer handles dropped, stopping");
}

/// Wait until `delay` after the last reserved slot, and at least `delay`
/// from now. Records the new slot.
fn reserve_slot(last_slot: &mut Option<Instant>, now: Instant, delay: Duration) -> Duration {
    let wait = match *last_slot {
        Some(slot) => (slot + delay).saturating_duration_since(now).max(delay),
        None => delay,
    };
    *last_slot = Some(now + wait);
    wait
}
