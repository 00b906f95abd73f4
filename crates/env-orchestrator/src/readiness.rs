//! Readiness polling for eventually-consistent external systems.
//!
//! [`poll_until_ready`] repeatedly invokes a caller-supplied probe with
//! exponential backoff until the probe reports [`PollOutcome::Ready`] or a
//! deadline passes. The poller knows nothing about clusters, tables, or
//! deployments: those are probe implementations supplied by callers (see
//! [`crate::probes`] and [`crate::tools::kubectl`]).
//!
//! Backoff strategy:
//! - Initial delay: 300ms (configurable)
//! - Exponential multiplier: 2x
//! - Maximum delay: 2s (configurable)
//! - Each sleep is capped at the time remaining until the deadline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::debug;

/// Default first delay between probe attempts.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(300);

/// Default ceiling for the delay between probe attempts.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Result of one probe invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    /// The resource reached the desired state.
    Ready,
    /// The probe worked but the resource is not there yet.
    NotYetReady(T),
    /// The probe itself failed.
    ProbeFailed(ProbeError),
}

/// A probe that could not observe the resource.
///
/// Retryable failures (connection refused while a service starts, resource
/// not found yet) are retried until the deadline; fatal ones stop polling
/// immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProbeError {
    message: String,
    retryable: bool,
}

impl ProbeError {
    /// A failure worth retrying until the deadline.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that no amount of waiting will fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(with = "common::duration")]
    pub initial: Duration,
    #[serde(with = "common::duration")]
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// The last thing a probe saw before the poller gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation<T> {
    NotYetReady(T),
    ProbeFailed(ProbeError),
}

impl<T> Observation<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Observation<U> {
        match self {
            Observation::NotYetReady(v) => Observation::NotYetReady(f(v)),
            Observation::ProbeFailed(e) => Observation::ProbeFailed(e),
        }
    }
}

/// Readiness polling errors.
#[derive(Debug, Error)]
pub enum PollError<T: fmt::Debug> {
    #[error("Not ready after {attempts} attempt(s) over {waited:?}; last observation: {}", describe(.last))]
    Timeout {
        attempts: u32,
        waited: Duration,
        last: Option<Observation<T>>,
    },

    #[error("Probe failed after {attempts} attempt(s): {source}")]
    ProbeFailed {
        attempts: u32,
        #[source]
        source: ProbeError,
    },
}

impl<T: fmt::Debug> PollError<T> {
    /// Convert the observed-state type, e.g. to erase it for reporting.
    pub fn map_observed<U: fmt::Debug>(self, f: impl FnOnce(T) -> U) -> PollError<U> {
        match self {
            PollError::Timeout {
                attempts,
                waited,
                last,
            } => PollError::Timeout {
                attempts,
                waited,
                last: last.map(|o| o.map(f)),
            },
            PollError::ProbeFailed { attempts, source } => {
                PollError::ProbeFailed { attempts, source }
            }
        }
    }

    /// Render the observed state as text (`Debug` form).
    pub fn into_reportable(self) -> PollError<String> {
        self.map_observed(|observed| format!("{observed:?}"))
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollError::Timeout { attempts, .. } | PollError::ProbeFailed { attempts, .. } => {
                *attempts
            }
        }
    }
}

fn describe<T: fmt::Debug>(last: &Option<Observation<T>>) -> String {
    match last {
        None => "none (probe never ran)".to_string(),
        Some(Observation::NotYetReady(observed)) => format!("not ready ({observed:?})"),
        Some(Observation::ProbeFailed(e)) => format!("probe error ({e})"),
    }
}

/// Poll `probe` until it reports ready or `deadline` passes.
///
/// The probe is invoked once per iteration while `now < deadline`, and an
/// attempt still running at the deadline is abandoned. After a
/// not-ready or retryable-failure outcome the poller sleeps for the current
/// delay (capped at the time remaining), then doubles the delay up to
/// `backoff.max`.
///
/// # Errors
///
/// - [`PollError::Timeout`] with the last observation if the deadline passes
/// - [`PollError::ProbeFailed`] as soon as the probe reports a fatal error
///
/// # Example
///
/// ```no_run
/// use env_orchestrator::readiness::{poll_until_ready, Backoff, PollOutcome};
/// use std::time::Duration;
/// use tokio::time::Instant;
///
/// # async fn example() {
/// let deadline = Instant::now() + Duration::from_secs(30);
/// poll_until_ready(
///     || async { PollOutcome::<()>::Ready },
///     deadline,
///     Backoff::default(),
/// )
/// .await
/// .expect("resource should become ready within 30s");
/// # }
/// ```
pub async fn poll_until_ready<T, F, Fut>(
    mut probe: F,
    deadline: Instant,
    backoff: Backoff,
) -> Result<(), PollError<T>>
where
    T: fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = PollOutcome<T>>,
{
    let start = Instant::now();
    let mut delay = backoff.initial;
    let mut attempts: u32 = 0;
    let mut last = None;

    while Instant::now() < deadline {
        attempts = attempts.saturating_add(1);

        let Ok(outcome) = timeout_at(deadline, probe()).await else {
            debug!(target: "orchestrator.readiness", attempts, "Probe still running at deadline");
            break;
        };

        match outcome {
            PollOutcome::Ready => {
                debug!(
                    target: "orchestrator.readiness",
                    attempts,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Probe reported ready"
                );
                return Ok(());
            }
            PollOutcome::NotYetReady(observed) => {
                debug!(target: "orchestrator.readiness", attempts, observed = ?observed, "Not ready yet");
                last = Some(Observation::NotYetReady(observed));
            }
            PollOutcome::ProbeFailed(e) if !e.is_retryable() => {
                return Err(PollError::ProbeFailed {
                    attempts,
                    source: e,
                });
            }
            PollOutcome::ProbeFailed(e) => {
                debug!(target: "orchestrator.readiness", attempts, error = %e, "Probe failed, will retry");
                last = Some(Observation::ProbeFailed(e));
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        sleep(delay.min(remaining)).await;
        delay = backoff.next(delay);
    }

    Err(PollError::Timeout {
        attempts,
        waited: start.elapsed(),
        last,
    })
}

/// [`poll_until_ready`] with a deadline `timeout` from now.
///
/// # Errors
///
/// Same as [`poll_until_ready`].
pub async fn poll_for<T, F, Fut>(
    probe: F,
    timeout: Duration,
    backoff: Backoff,
) -> Result<(), PollError<T>>
where
    T: fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = PollOutcome<T>>,
{
    poll_until_ready(probe, Instant::now() + timeout, backoff).await
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(300), Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately_probes_once() {
        let calls = AtomicU32::new(0);
        let result = poll_for(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { PollOutcome::<()>::Ready }
            },
            Duration::from_secs(10),
            backoff(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_nth_call_probes_exactly_n_times() {
        for n in 1..=7u32 {
            let calls = AtomicU32::new(0);
            let result = poll_for(
                || {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if call >= n {
                            PollOutcome::Ready
                        } else {
                            PollOutcome::NotYetReady(call)
                        }
                    }
                },
                Duration::from_secs(60),
                backoff(),
            )
            .await;

            assert!(result.is_ok(), "n={n}");
            assert_eq!(calls.load(Ordering::SeqCst), n, "n={n}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out_within_bound() {
        let timeout = Duration::from_secs(5);
        let start = Instant::now();

        let err = poll_for(
            || async { PollOutcome::NotYetReady("CREATING") },
            timeout,
            backoff(),
        )
        .await
        .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed <= timeout + backoff().max, "elapsed {elapsed:?}");

        match err {
            PollError::Timeout { attempts, last, .. } => {
                assert!(attempts > 1);
                assert_eq!(last, Some(Observation::NotYetReady("CREATING")));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_up_to_max() {
        let start = Instant::now();
        let seen = Mutex::new(Vec::new());

        let _ = poll_for(
            || {
                seen.lock().unwrap().push(start.elapsed());
                async { PollOutcome::NotYetReady(()) }
            },
            Duration::from_millis(8000),
            backoff(),
        )
        .await;

        let seen = seen.into_inner().unwrap();
        let gaps: Vec<Duration> = seen.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps.iter().take(5).copied().collect::<Vec<_>>(),
            vec![
                Duration::from_millis(300),
                Duration::from_millis(600),
                Duration::from_millis(1200),
                Duration::from_millis(2000),
                Duration::from_millis(2000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_probe_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = poll_for(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call < 3 {
                        PollOutcome::<()>::ProbeFailed(ProbeError::transient("connection refused"))
                    } else {
                        PollOutcome::Ready
                    }
                }
            },
            Duration::from_secs(30),
            backoff(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_probe_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = poll_for(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { PollOutcome::<()>::ProbeFailed(ProbeError::fatal("access denied")) }
            },
            Duration::from_secs(30),
            backoff(),
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, PollError::ProbeFailed { attempts: 1, .. }));
        assert!(err.to_string().contains("access denied"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_probe_error_distinctly() {
        let err = poll_for(
            || async { PollOutcome::<()>::ProbeFailed(ProbeError::transient("503 from endpoint")) },
            Duration::from_secs(1),
            backoff(),
        )
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("probe error (503 from endpoint)"), "{message}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_is_cut_off_at_deadline() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let err = poll_for(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call > 1 {
                        sleep(Duration::from_secs(30)).await;
                    }
                    PollOutcome::NotYetReady(call)
                }
            },
            Duration::from_secs(1),
            backoff(),
        )
        .await
        .unwrap_err();

        assert_eq!(start.elapsed(), Duration::from_secs(1));
        match err {
            PollError::Timeout { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(last, Some(Observation::NotYetReady(1)));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_does_not_probe() {
        let calls = AtomicU32::new(0);
        let err = poll_until_ready(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { PollOutcome::<()>::Ready }
            },
            Instant::now(),
            backoff(),
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(err, PollError::Timeout { attempts: 0, last: None, .. }));
    }

    #[test]
    fn test_into_reportable_keeps_observation() {
        let err: PollError<u32> = PollError::Timeout {
            attempts: 4,
            waited: Duration::from_secs(2),
            last: Some(Observation::NotYetReady(7)),
        };
        let reportable = err.into_reportable();
        assert_eq!(reportable.attempts(), 4);
        assert!(matches!(
            reportable,
            PollError::Timeout { last: Some(Observation::NotYetReady(ref s)), .. } if s == "7"
        ));
    }
}
