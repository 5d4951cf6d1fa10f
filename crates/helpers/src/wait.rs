use std::future::Future;
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(150);

/// Fixed interval and overall deadline of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        PollPolicy { interval, timeout }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

#[derive(Error, Debug)]
pub enum PollError<E> {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Aborted(E),
}

/// Runs `condition` until it returns `Ok(true)`.
///
/// The first attempt happens immediately, later ones every `policy.interval`.
/// Returns `Timeout` once the deadline passed without success, `Aborted` as
/// soon as the condition fails, and `Cancelled` when the token fires. The token
/// is only observed between attempts, an attempt in flight always completes.
pub async fn poll_until<F, Fut, E>(
    cancel: &CancellationToken,
    policy: PollPolicy,
    mut condition: F,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        attempt += 1;
        if condition().await.map_err(PollError::Aborted)? {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            debug!("condition not met after {} attempts", attempt);
            return Err(PollError::Timeout(policy.timeout));
        }

        let next = std::cmp::min(now + policy.interval, deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = sleep_until(next) => {}
        }
    }
}

/// Sleeps for `duration` unless the token fires first. Returns false when cancelled.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn short_policy() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(50), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn first_attempt_has_no_leading_delay() {
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let res: Result<(), PollError<()>> =
            poll_until(&cancel, PollPolicy::new(Duration::from_secs(10), Duration::from_secs(60)), || async {
                Ok(true)
            })
            .await;

        assert!(res.is_ok());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn times_out_within_deadline_plus_one_interval() {
        let cancel = CancellationToken::new();
        let policy = short_policy();
        let start = Instant::now();

        let res: Result<(), PollError<()>> = poll_until(&cancel, policy, || async { Ok(false) }).await;

        let elapsed = start.elapsed();
        assert!(matches!(res, Err(PollError::Timeout(_))));
        assert!(elapsed >= policy.timeout);
        assert!(elapsed <= policy.timeout + policy.interval + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn retries_until_condition_holds() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let res: Result<(), PollError<()>> = poll_until(&cancel, short_policy(), move || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await;

        assert!(res.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn condition_error_aborts_immediately() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let res = poll_until(&cancel, short_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<bool, _>("boom") }
        })
        .await;

        assert!(matches!(res, Err(PollError::Aborted("boom"))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_condition() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let res: Result<(), PollError<()>> = poll_until(&cancel, short_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(true) }
        })
        .await;

        assert!(matches!(res, Err(PollError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_sleep() {
        let cancel = CancellationToken::new();
        let policy = PollPolicy::new(Duration::from_secs(30), Duration::from_secs(60));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let res: Result<(), PollError<()>> = poll_until(&cancel, policy, || async { Ok(false) }).await;

        assert!(matches!(res, Err(PollError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
