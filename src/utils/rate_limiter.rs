use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

/// A sliding-window byte counter.
///
/// Every outbound send records its size with a timestamp. Before a send
/// proceeds, entries older than the window are dropped; if the remaining
/// usage plus the new send would exceed the limit, the caller is parked and
/// the window is polled again. Nothing is ever dropped, sends are only
/// deferred.
#[derive(Clone)]
pub struct BandwidthWindow {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    limit: u64,
    window: Duration,
    poll: Duration,
    entries: VecDeque<(Instant, u64)>,
    used: u64,
}

impl BandwidthWindow {
    /// Create a new window.
    ///
    /// # Arguments
    /// * `limit` - Maximum bytes inside one window. `0` disables shaping.
    /// * `window` - Length of the sliding window.
    /// * `poll` - How often a deferred send re-checks the window.
    pub fn new(limit: u64, window: Duration, poll: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                limit,
                window,
                poll,
                entries: VecDeque::new(),
                used: 0,
            })),
        }
    }

    /// Wait until `amount` bytes fit in the window, then record them.
    ///
    /// A single send larger than the whole limit is let through once the
    /// window is empty so it cannot starve forever. That window then holds
    /// more than the limit, and the next send waits until it has drained.
    pub async fn acquire(&self, amount: u64) {
        if amount == 0 {
            return;
        }

        loop {
            let poll = {
                let mut inner = self.inner.lock().await;
                if inner.limit == 0 {
                    return;
                }

                let now = Instant::now();
                inner.prune(now);

                if inner.used + amount <= inner.limit || inner.used == 0 {
                    inner.entries.push_back((now, amount));
                    inner.used += amount;
                    return;
                }
                inner.poll
            };

            sleep(poll).await;
        }
    }

    /// Bytes recorded inside the current window.
    pub async fn usage(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.prune(Instant::now());
        inner.used
    }
}

impl Inner {
    fn prune(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.entries.front() {
            if now.duration_since(at) < self.window {
                break;
            }
            self.entries.pop_front();
            self.used -= bytes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sends_spread_over_windows() {
        let limiter = BandwidthWindow::new(
            1000,
            Duration::from_secs(1),
            Duration::from_millis(100),
        );

        let start = Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..5 {
            limiter.acquire(1000).await;
            stamps.push(start.elapsed());
        }

        // 5000 bytes at 1000 bytes/s cover at least five one-second windows.
        assert!(stamps[4] >= Duration::from_secs(4));

        // No one-second window ever holds more than the limit.
        for (i, first) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .filter(|t| **t - *first < Duration::from_secs(1))
                .count() as u64;
            assert!(in_window * 1000 <= 1000);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_sends_share_a_window() {
        let limiter = BandwidthWindow::new(
            1000,
            Duration::from_secs(1),
            Duration::from_millis(100),
        );

        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire(250).await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(limiter.usage().await, 1000);

        limiter.acquire(250).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_send_is_not_starved() {
        let limiter = BandwidthWindow::new(
            100,
            Duration::from_secs(1),
            Duration::from_millis(100),
        );

        let start = Instant::now();
        limiter.acquire(5000).await;
        assert_eq!(limiter.usage().await, 5000);

        limiter.acquire(10).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(limiter.usage().await, 10);
    }

    #[tokio::test]
    async fn test_zero_limit_disables_shaping() {
        let limiter = BandwidthWindow::new(0, Duration::from_secs(1), Duration::from_millis(100));
        let start = Instant::now();
        limiter.acquire(1_000_000).await;
        limiter.acquire(1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
