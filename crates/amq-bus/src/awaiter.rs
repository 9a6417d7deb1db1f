//! Bounded polling.
//!
//! Turns state that is filled in by link event tasks into a single awaited
//! outcome. The supplier is consulted once per tick until it yields a value or
//! the deadline passes. Dropping the future stops the polling; nothing keeps
//! running in the background afterwards.

use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::error::{Error, Result};

/// Poll interval used for link and reply waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3);

/// A reusable deadline/interval pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Awaiter {
    /// How long to wait in total.
    pub timeout: Duration,

    /// Pause between two polls.
    pub interval: Duration,
}

impl Awaiter {
    /// Creates an awaiter polling at [`DEFAULT_POLL_INTERVAL`].
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Polls `supplier` until it yields a value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] once the timeout has elapsed.
    pub async fn wait<T, F>(&self, supplier: F) -> Result<T>
    where
        F: FnMut(Duration) -> Option<T>,
    {
        wait_for(self.timeout, self.interval, supplier).await
    }
}

/// Polls `supplier` with the elapsed time until it yields a value.
///
/// The deadline is checked before each poll, so the supplier is never
/// consulted after `timeout` has passed.
///
/// # Errors
///
/// Returns [`Error::Timeout`] carrying the configured timeout once elapsed
/// time exceeds it.
pub async fn wait_for<T, F>(timeout: Duration, interval: Duration, mut supplier: F) -> Result<T>
where
    F: FnMut(Duration) -> Option<T>,
{
    let start = Instant::now();

    loop {
        let elapsed = start.elapsed();
        if elapsed > timeout {
            return Err(Error::Timeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ));
        }

        if let Some(value) = supplier(elapsed) {
            return Ok(value);
        }

        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_resolves_with_first_value() {
        let calls = AtomicUsize::new(0);

        let value = wait_for(Duration::from_secs(1), Duration::from_millis(10), |_| {
            (calls.fetch_add(1, Ordering::SeqCst) == 3).then_some("ready")
        })
        .await
        .unwrap();

        assert_eq!(value, "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_within_one_interval() {
        let start = Instant::now();

        let result: Result<()> =
            wait_for(Duration::from_millis(100), Duration::from_millis(10), |_| None).await;

        assert_eq!(result, Err(Error::Timeout(100)));
        assert_eq!(
            result.unwrap_err().to_string(),
            "Timeout elapsed (100 ms)"
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supplier_sees_elapsed_time() {
        let awaiter = Awaiter::new(Duration::from_secs(1)).with_interval(Duration::from_millis(50));

        let elapsed = awaiter
            .wait(|elapsed| (elapsed >= Duration::from_millis(200)).then_some(elapsed))
            .await
            .unwrap();

        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_value_set_by_another_task() {
        let slot = Arc::new(parking_lot::Mutex::new(None));

        let writer = slot.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            *writer.lock() = Some(42);
        });

        let value = Awaiter::new(Duration::from_secs(1))
            .wait(|_| *slot.lock())
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_stops_polling() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let waiting = tokio::spawn(async move {
            let _: Result<()> = wait_for(Duration::from_secs(10), Duration::from_millis(10), |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            })
            .await;
        });

        sleep(Duration::from_millis(55)).await;
        waiting.abort();
        let _ = waiting.await;

        let seen = calls.load(Ordering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }
}
