//! Backoff Connector
//!
//! Capped exponential-backoff retry loop around a dial function, used to
//! establish every outbound backend connection.
//!
//! The delay starts at 100ms, is clamped to the 2000ms cap before each
//! sleep and doubles afterwards. There is no attempt limit and no jitter:
//! the loop only ends when a dial succeeds or the cancellation token fires.
//!
//! The caller's task is suspended while sleeping, so run it on a task that
//! has nothing else to answer (a target's own task, for instance).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::RouterError;

/// First delay after a failed dial
pub const INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for any single delay
pub const MAX_DELAY: Duration = Duration::from_millis(2000);

/// Retry policy for [`Backoff::connect`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure
    pub initial: Duration,
    /// Cap applied before every sleep
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: INITIAL_DELAY,
            max: MAX_DELAY,
        }
    }
}

impl Backoff {
    /// Create a policy with custom bounds
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// The (infinite) sequence of delays slept between attempts
    #[must_use]
    pub fn delays(&self) -> Delays {
        Delays {
            next: self.initial,
            max: self.max,
        }
    }

    /// Dial `target` until it succeeds
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Cancelled`] if `cancel` fires. Dial failures
    /// are logged and retried, never returned.
    pub async fn connect<T, E, F, Fut>(
        &self,
        target: &str,
        mut dial: F,
        cancel: &CancellationToken,
    ) -> Result<T, RouterError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut delays = self.delays();
        let mut attempt: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RouterError::Cancelled);
            }

            attempt += 1;
            match dial(target.to_owned()).await {
                Ok(conn) => {
                    if attempt > 1 {
                        info!(endpoint = %target, attempts = attempt, "Reconnected");
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    let sleep = delays.advance();
                    warn!(
                        endpoint = %target,
                        attempt,
                        sleep_ms = u64::try_from(sleep.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Reconnect failed; sleeping"
                    );

                    tokio::select! {
                        () = cancel.cancelled() => return Err(RouterError::Cancelled),
                        () = tokio::time::sleep(sleep) => {}
                    }
                }
            }
        }
    }
}

/// Dial `target` with the default policy
///
/// # Errors
///
/// Returns [`RouterError::Cancelled`] if `cancel` fires.
pub async fn connect<T, E, F, Fut>(
    target: &str,
    dial: F,
    cancel: &CancellationToken,
) -> Result<T, RouterError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    Backoff::default().connect(target, dial, cancel).await
}

/// Delay sequence of a [`Backoff`]
#[derive(Clone, Debug)]
pub struct Delays {
    next: Duration,
    max: Duration,
}

impl Delays {
    fn advance(&mut self) -> Duration {
        let sleep = self.next.min(self.max);
        self.next = sleep.saturating_mul(2);
        sleep
    }
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.advance())
    }
}
