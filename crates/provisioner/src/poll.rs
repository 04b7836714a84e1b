//! Poll-until-converged control for the asynchronous cloud primitives.
//!
//! Every long-running provider operation (create, reinstall, start, stop,
//! network attach) is fire-and-forget at the API: the caller polls the
//! observed state until it matches the desired state, bounded by a
//! deadline. Verification checks use the same shape with their own budgets.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// How long and how often to poll for one condition.
#[derive(Clone, Copy, Debug)]
pub struct PollSettings {
    /// Total budget before the poll gives up.
    pub timeout: Duration,
    /// Fixed delay between observations.
    pub interval: Duration,
}

impl PollSettings {
    /// Settings with the given bounds.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            interval: Duration::from_secs(5),
        }
    }
}

/// The condition never held within the budget.
#[derive(Debug)]
pub struct PollTimedOut<E> {
    /// What was being waited for.
    pub what: String,
    /// The budget that ran out.
    pub timeout: Duration,
    /// The error from the last observation, when the observation itself
    /// failed rather than merely not converging.
    pub last_error: Option<E>,
}

impl<E: fmt::Display> fmt::Display for PollTimedOut<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last_error {
            Some(e) => write!(
                f,
                "timed out after {:?} waiting for {}: last error: {}",
                self.timeout, self.what, e
            ),
            None => write!(f, "timed out after {:?} waiting for {}", self.timeout, self.what),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PollTimedOut<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last_error
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Polls `observe` until it reports convergence or the budget runs out.
///
/// `observe` returns `Ok(Some(value))` once the desired state is reached,
/// `Ok(None)` when the state has not converged yet, and `Err` when the
/// observation itself failed. Observation errors do not abort the poll;
/// the most recent one is carried into the timeout error for diagnosis.
pub async fn poll_until<T, E, F, Fut>(
    what: &str,
    settings: &PollSettings,
    mut observe: F,
) -> Result<T, PollTimedOut<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + settings.timeout;
    let mut last_error;
    loop {
        match observe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => last_error = None,
            Err(e) => last_error = Some(e),
        }
        if Instant::now() + settings.interval > deadline {
            return Err(PollTimedOut {
                what: what.to_owned(),
                timeout: settings.timeout,
                last_error,
            });
        }
        tokio::time::sleep(settings.interval).await;
    }
}
