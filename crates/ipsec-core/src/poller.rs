//! Bounded-retry readiness polling
//!
//! `poll_until` evaluates a probe immediately and then once per interval.
//! Running out of time is an outcome (`Ok(false)`), not an error. A single
//! probe call never outlives the remaining budget.

use crate::error::RolloutError;
use crate::types::ConvergenceDeadline;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Poll `probe` every `interval` until it reports ready, fails, or `timeout` elapses.
///
/// Transient control-plane errors count as "not ready yet". Any other error
/// aborts the poll and is returned unchanged. A probe call still pending when
/// the budget runs out is dropped and the poll reports `Ok(false)`.
///
/// # Returns
/// `Ok(true)` once the probe succeeds, `Ok(false)` when the timeout elapses first.
pub async fn poll_until<F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> Result<bool, RolloutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, RolloutError>>,
{
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let remaining = timeout.saturating_sub(start.elapsed());
        let Ok(outcome) = tokio::time::timeout(remaining, probe()).await else {
            tracing::warn!(attempt, "probe call still pending at the poll deadline");
            return Ok(false);
        };
        match outcome {
            Ok(true) => {
                tracing::debug!(attempt, "probe ready");
                return Ok(true);
            }
            Ok(false) => tracing::debug!(attempt, "probe not ready"),
            Err(e) if e.is_transient() => {
                tracing::warn!(attempt, error = %e, "transient error while polling, retrying");
            }
            Err(e) => return Err(e),
        }

        if start.elapsed() + interval > timeout {
            return Ok(false);
        }
        sleep(interval).await;
    }
}

/// `poll_until` with a `ConvergenceDeadline`
pub async fn poll_with<F, Fut>(deadline: ConvergenceDeadline, probe: F) -> Result<bool, RolloutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, RolloutError>>,
{
    poll_until(deadline.poll_interval, deadline.max_wait, probe).await
}

/// Poll and turn a timeout into `ConvergenceTimeout` naming `what`
pub async fn poll_or_timeout<F, Fut>(
    what: &str,
    deadline: ConvergenceDeadline,
    probe: F,
) -> Result<(), RolloutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, RolloutError>>,
{
    if poll_with(deadline, probe).await? {
        Ok(())
    } else {
        Err(RolloutError::ConvergenceTimeout {
            probe: what.to_string(),
            waited_secs: deadline.max_wait.as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let ready = poll_until(MINUTE, 20 * MINUTE, move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n >= 3) }
        })
        .await
        .unwrap();

        assert!(ready);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_false_not_error() {
        let start = Instant::now();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let ready = poll_until(MINUTE, 20 * MINUTE, move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        })
        .await
        .unwrap();

        assert!(!ready);
        // immediate check plus one per minute up to the bound
        assert_eq!(calls.load(Ordering::SeqCst), 21);
        assert!(start.elapsed() <= 20 * MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_swallowed() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let ready = poll_until(MINUTE, 20 * MINUTE, move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClusterError::Transient("connection reset by peer".into()).into())
                } else {
                    Ok(true)
                }
            }
        })
        .await
        .unwrap();
        assert!(ready);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_abort_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = poll_until(MINUTE, 20 * MINUTE, move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(ClusterError::Api("forbidden".into()).into()) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RolloutError::Cluster(ClusterError::Api(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_is_cut_off_at_the_deadline() {
        let start = Instant::now();
        let ready = poll_until(MINUTE, 20 * MINUTE, || {
            std::future::pending::<Result<bool, RolloutError>>()
        })
        .await
        .unwrap();

        assert!(!ready);
        assert_eq!(start.elapsed(), 20 * MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_uses_the_remaining_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let start = Instant::now();
        // first call answers after 5 minutes, the second one hangs
        let ready = poll_until(MINUTE, 10 * MINUTE, move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    sleep(5 * MINUTE).await;
                    Ok(false)
                } else {
                    std::future::pending().await
                }
            }
        })
        .await
        .unwrap();

        assert!(!ready);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), 10 * MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_or_timeout_names_the_probe() {
        let deadline = ConvergenceDeadline::new(MINUTE, 3 * MINUTE);
        let err = poll_or_timeout("workload presence", deadline, || async { Ok(false) })
            .await
            .unwrap_err();
        match err {
            RolloutError::ConvergenceTimeout { probe, waited_secs } => {
                assert_eq!(probe, "workload presence");
                assert_eq!(waited_secs, 180);
            }
            other => panic!("expected ConvergenceTimeout, got {other:?}"),
        }
    }
}
