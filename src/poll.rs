//! Fixed-interval polling shared by every wait loop.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, ScenarioError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until cancelled.
    pub max_attempts: Option<u32>,
}

impl PollPolicy {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Outcome of one probe. `Pending` means "not ready yet, ask again".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Probe<T> {
    Ready(T),
    Pending,
}

/// Calls `probe` once per tick until it is ready.
///
/// The first probe runs immediately. A probe error aborts the loop at once;
/// only `Probe::Pending` is retried.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>>>,
{
    let mut ticker = interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ScenarioError::Cancelled(format!("waiting for {what}")));
            }
            _ = ticker.tick() => {}
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ScenarioError::Cancelled(format!("waiting for {what}")));
            }
            outcome = probe() => outcome?,
        };

        match outcome {
            Probe::Ready(value) => {
                debug!(what, attempts, "poll succeeded");
                return Ok(value);
            }
            Probe::Pending => trace!(what, attempts, "not ready yet"),
        }

        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                return Err(ScenarioError::Timeout {
                    what: what.to_string(),
                    attempts,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn returns_once_probe_is_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = tokio::time::Instant::now();

        let value = poll_until(
            "third call",
            PollPolicy::every(Duration::from_secs(2)),
            &CancellationToken::new(),
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(if n == 3 { Probe::Ready(n) } else { Probe::Pending }) }
            },
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two full intervals elapse between three probes.
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = poll_until::<(), _, _>(
            "broken probe",
            PollPolicy::every(Duration::from_millis(10)),
            &CancellationToken::new(),
            || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ScenarioError::Http("boom".into())) }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ScenarioError::Http(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_cap_turns_into_timeout() {
        let err = poll_until::<(), _, _>(
            "never",
            PollPolicy::every(Duration::from_millis(10)).with_max_attempts(5),
            &CancellationToken::new(),
            || async { Ok(Probe::Pending) },
        )
        .await
        .unwrap_err();

        match err {
            ScenarioError::Timeout { what, attempts } => {
                assert_eq!(what, "never");
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_an_unbounded_loop() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let err = poll_until::<(), _, _>(
            "forever",
            PollPolicy::every(Duration::from_secs(1)),
            &cancel,
            || async { Ok(Probe::Pending) },
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
    }
}
