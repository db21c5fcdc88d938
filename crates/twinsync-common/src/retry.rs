//! Bounded polling with a fixed interval and a fixed deadline.
//!
//! Used where a reconcile has to observe the effect of its own write before
//! returning, e.g. waiting for a bound pod to show its node name in the
//! virtual API. The wait blocks only the calling reconcile.
//!
//! # Example
//!
//! ```ignore
//! use twinsync_common::retry::{poll_until, PollConfig};
//!
//! poll_until(&PollConfig::new(interval, deadline), "bind", || async {
//!     Ok(client.get_pod(ns, name).await?.is_none())
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::trace;

use crate::Error;

/// Fixed-interval, fixed-deadline polling parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Time between two checks
    pub interval: Duration,
    /// Total time allowed before giving up
    pub timeout: Duration,
}

impl PollConfig {
    /// Create a config with the given interval and deadline
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Poll `check` until it returns `Ok(true)`.
///
/// The first check runs immediately. `Ok(false)` waits one interval and
/// checks again. An `Err` from the check ends the poll with that error.
/// If the condition is still unmet when the deadline passes, returns
/// [`Error::Timeout`] with `operation` as its context.
pub async fn poll_until<F, Fut>(config: &PollConfig, operation: &str, mut check: F) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let poll = async {
        loop {
            if check().await? {
                return Ok(());
            }
            trace!(operation, "condition not yet met, polling again");
            tokio::time::sleep(config.interval).await;
        }
    };

    match tokio::time::timeout(config.timeout, poll).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(
            operation,
            format!("condition not met within {:?}", config.timeout),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const CONFIG: PollConfig = PollConfig::new(Duration::from_millis(50), Duration::from_secs(2));

    #[tokio::test(start_paused = true)]
    async fn returns_immediately_when_condition_already_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(&CONFIG, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_polling_until_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let start = tokio::time::Instant::now();
        let result = poll_until(&CONFIG, "op", || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 3) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_condition_never_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(&CONFIG, "bind", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await;

        match result {
            Err(Error::Timeout { context, .. }) => assert_eq!(context, "bind"),
            other => panic!("expected timeout, got {:?}", other),
        }
        // 2s / 50ms, first check at t=0
        assert!(calls.load(Ordering::SeqCst) >= 40);
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_end_the_poll() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(&CONFIG, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::internal("api down"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Internal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
