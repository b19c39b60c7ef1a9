use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Errors from constructing a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate must be greater than zero")]
    InvalidRate,
    #[error("window must be longer than zero")]
    InvalidWindow,
}

/// Sliding-window limiter: at most `rate` acquisitions inside any trailing
/// window of length `per`.
///
/// Callers serialize on a single FIFO mutex, so a caller that has to wait
/// holds the lock while sleeping and later callers queue behind it.
#[derive(Debug)]
pub struct RateLimiter {
    rate: usize,
    per: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(rate: u32, per: Duration) -> Result<Self, RateLimitError> {
        if rate == 0 {
            return Err(RateLimitError::InvalidRate);
        }
        if per.is_zero() {
            return Err(RateLimitError::InvalidWindow);
        }
        let rate = rate as usize;
        Ok(Self {
            rate,
            per,
            calls: Mutex::new(VecDeque::with_capacity(rate)),
        })
    }

    /// Wait until one more call fits in the window, then record it.
    pub async fn acquire(&self) {
        let mut calls = self.calls.lock().await;
        loop {
            let now = Instant::now();
            self.evict(&mut calls, now);

            if calls.len() < self.rate {
                calls.push_back(now);
                return;
            }

            let Some(&oldest) = calls.front() else {
                continue;
            };
            let wait = self.per.saturating_sub(now.duration_since(oldest));
            debug!(wait_ms = wait.as_millis() as u64, rate = self.rate, "rate limit window full");
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of calls currently counted against the window.
    pub async fn in_window(&self) -> usize {
        let mut calls = self.calls.lock().await;
        self.evict(&mut calls, Instant::now());
        calls.len()
    }

    fn evict(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = calls.front() {
            if now.duration_since(oldest) >= self.per {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn assert_window_respected(times: &[Instant], rate: usize, per: Duration) {
        for pair in times.windows(rate + 1) {
            let span = pair[rate].duration_since(pair[0]);
            assert!(span >= per, "{} calls within {:?}", rate + 1, span);
        }
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert_eq!(
            RateLimiter::new(0, Duration::from_secs(1)).unwrap_err(),
            RateLimitError::InvalidRate
        );
        assert_eq!(
            RateLimiter::new(5, Duration::ZERO).unwrap_err(),
            RateLimitError::InvalidWindow
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_under_limit_never_suspends() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1)).unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.in_window().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_waits_exactly_for_oldest_to_expire() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1)).unwrap();
        let start = Instant::now();
        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(400)).await;
        limiter.acquire().await;

        limiter.acquire().await;
        assert_eq!(Instant::now().duration_since(start), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_respect_window() {
        let per = Duration::from_secs(1);
        let limiter = RateLimiter::new(3, per).unwrap();
        let mut times = Vec::new();
        for _ in 0..10 {
            limiter.acquire().await;
            times.push(Instant::now());
        }
        assert_window_respected(&times, 3, per);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_respect_window() {
        let per = Duration::from_millis(500);
        let limiter = Arc::new(RateLimiter::new(2, per).unwrap());
        let mut handles = Vec::new();
        for _ in 0..7 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }
        times.sort();
        assert_window_respected(&times, 2, per);
    }
}
