// rds-pitr-restore/src/utils/polling.rs
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{ControlPlaneError, WaitError};

/// Fixed-interval polling budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// Classification of one status probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T> {
    Ready(T),
    Pending(String),
    Failed(String),
}

/// Sleeps for `duration` unless the token fires first. Returns `false` on cancellation.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Calls `probe` until it reports `Ready`, a failure state, or the attempt budget runs out.
///
/// Transient control-plane errors use up an attempt and polling continues; any other
/// error ends the wait. There is no sleep after the last attempt.
pub async fn poll_until<T, F, Fut>(
    policy: &PollPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut probe: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, ControlPlaneError>>,
{
    let mut last_status = String::from("unknown");

    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled { what: what.to_string() });
        }

        match probe().await {
            Ok(Probe::Ready(value)) => {
                debug!(what, attempt, "poll satisfied");
                return Ok(value);
            }
            Ok(Probe::Pending(status)) => {
                debug!(what, attempt, max_attempts = policy.max_attempts, %status, "still waiting");
                last_status = status;
            }
            Ok(Probe::Failed(status)) => {
                return Err(WaitError::FailureState {
                    what: what.to_string(),
                    status,
                });
            }
            Err(err) if err.is_transient() => {
                warn!(what, attempt, error = %err, "transient error while polling, will retry");
                last_status = format!("error: {}", err);
            }
            Err(err) => {
                return Err(WaitError::Api {
                    what: what.to_string(),
                    source: err,
                });
            }
        }

        if attempt < policy.max_attempts && !pause(policy.interval, cancel).await {
            return Err(WaitError::Cancelled { what: what.to_string() });
        }
    }

    Err(WaitError::Timeout {
        what: what.to_string(),
        attempts: policy.max_attempts,
        last_status,
    })
}
