//! Fixed-ceiling throughput limiter shared by both transfer directions.
//!
//! This is a leaky-bucket approximation: the limiter compares the bytes moved
//! since the start of the current window with the wall-clock time the window
//! has been open, and asks the caller to sleep off the difference. The window
//! restarts once it has carried more than [`WINDOW_RESET_BYTES`], so bursts of
//! up to one window are possible before the correction catches up.

use std::time::Duration;
use tokio::time::Instant;

/// Bytes after which the measuring window restarts (1 MiB)
pub const WINDOW_RESET_BYTES: u64 = 1024 * 1024;

/// How long a caller must pause so that `bytes_in_window` bytes moved in
/// `window_elapsed` stay under `limit_kbps` KiB/s.
///
/// A ceiling of zero or below means unlimited and never pauses.
pub fn throttle(limit_kbps: i32, bytes_in_window: u64, window_elapsed: Duration) -> Duration {
    if limit_kbps <= 0 {
        return Duration::ZERO;
    }

    let bytes_per_sec = limit_kbps as f64 * 1024.0;
    let expected = Duration::from_secs_f64(bytes_in_window as f64 / bytes_per_sec);
    expected.saturating_sub(window_elapsed)
}

/// Per-transfer throttle state.
#[derive(Debug)]
pub struct RateLimiter {
    window_start: Instant,
    bytes_in_window: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            bytes_in_window: 0,
        }
    }

    /// Account for `bytes` just moved and sleep if the ceiling was exceeded.
    ///
    /// The ceiling is passed on every call so a settings change applies to
    /// transfers already in flight.
    pub async fn consume(&mut self, bytes: usize, limit_kbps: i32) {
        if limit_kbps <= 0 {
            return;
        }

        self.bytes_in_window += bytes as u64;
        let wait = throttle(limit_kbps, self.bytes_in_window, self.window_start.elapsed());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        if self.bytes_in_window > WINDOW_RESET_BYTES {
            self.window_start = Instant::now();
            self.bytes_in_window = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 64 * 1024;

    #[test]
    fn test_unlimited_never_pauses() {
        assert_eq!(throttle(0, 10 * WINDOW_RESET_BYTES, Duration::ZERO), Duration::ZERO);
        assert_eq!(throttle(-5, 10 * WINDOW_RESET_BYTES, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_throttle_expected_duration() {
        // 100 KiB at 100 KiB/s takes one second
        let wait = throttle(100, 100 * 1024, Duration::ZERO);
        assert_eq!(wait.as_millis(), 1000);

        let wait = throttle(100, 100 * 1024, Duration::from_millis(400));
        assert_eq!(wait.as_millis(), 600);
    }

    #[test]
    fn test_throttle_no_wait_when_behind() {
        let wait = throttle(100, 100 * 1024, Duration::from_secs(2));
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_stream_takes_no_time() {
        let mut limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..256 {
            limiter.consume(CHUNK, 0).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_effective_throughput_within_model() {
        let limit_kbps = 512;
        let total: u64 = 8 * 1024 * 1024;
        let mut limiter = RateLimiter::new();

        let start = Instant::now();
        let mut sent = 0u64;
        while sent < total {
            limiter.consume(CHUNK, limit_kbps).await;
            sent += CHUNK as u64;
        }
        let elapsed = start.elapsed().as_secs_f64();

        let ideal = total as f64 / (limit_kbps as f64 * 1024.0);
        // one window of burst is tolerated by the model
        let burst = WINDOW_RESET_BYTES as f64 / (limit_kbps as f64 * 1024.0);
        assert!(elapsed >= ideal - burst, "too fast: {elapsed}s vs {ideal}s");
        assert!(elapsed <= ideal + 0.5, "too slow: {elapsed}s vs {ideal}s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_one_mib() {
        let mut limiter = RateLimiter::new();
        for _ in 0..16 {
            limiter.consume(CHUNK, 1024).await;
        }
        assert_eq!(limiter.bytes_in_window, WINDOW_RESET_BYTES);

        limiter.consume(CHUNK, 1024).await;
        assert_eq!(limiter.bytes_in_window, 0);
    }
}
