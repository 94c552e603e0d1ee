//! Share-rate statistics for a single chip.
//!
//! Each chip remembers the times of its most recent shares in a fixed ring.
//! Tuning tiers ask how many of those fall inside their window and turn the
//! count into an approximate hash rate.

use std::time::Duration;

use tokio::time::Instant;

/// Number of share timestamps remembered per chip.
///
/// Window counts saturate here. At the rates a healthy chip produces (well
/// under one share per second) a 900 s window never comes close.
pub const STAT_WINDOW_CAPACITY: usize = 1024;

/// GH/s represented by one share per second at the chip's fixed internal
/// difficulty.
pub const GHS_PER_SHARE_PER_SECOND: f64 = 4.84387;

/// Fixed-capacity ring of share timestamps.
#[derive(Debug, Clone)]
pub struct ShareWindow {
    timestamps: Box<[Option<Instant>]>,
    cursor: usize,
}

impl ShareWindow {
    pub fn new() -> Self {
        Self::with_capacity(STAT_WINDOW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "share window needs at least one slot");
        Self {
            timestamps: vec![None; capacity].into_boxed_slice(),
            cursor: 0,
        }
    }

    /// Number of recorded events currently held (at most the capacity).
    pub fn len(&self) -> usize {
        self.timestamps.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a share at `at`, overwriting the oldest entry once full.
    pub fn record(&mut self, at: Instant) {
        self.timestamps[self.cursor] = Some(at);
        self.cursor = (self.cursor + 1) % self.timestamps.len();
    }

    /// Count stored shares younger than `window` as seen from `now`.
    pub fn count_within(&self, window: Duration, now: Instant) -> usize {
        self.timestamps
            .iter()
            .flatten()
            .filter(|&&at| now.saturating_duration_since(at) < window)
            .count()
    }
}

impl Default for ShareWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a share count over `window` into GH/s.
pub fn derive_hashrate(shares: usize, window: Duration) -> f64 {
    let seconds = window.as_secs_f64();
    if seconds <= 0.0 {
        return 0.0;
    }
    shares as f64 / seconds * GHS_PER_SHARE_PER_SECOND
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn counts_only_shares_inside_window() {
        let mut window = ShareWindow::new();
        window.record(Instant::now());

        time::advance(Duration::from_secs(5)).await;
        window.record(Instant::now());

        time::advance(Duration::from_secs(6)).await;
        let now = Instant::now();

        assert_eq!(window.count_within(Duration::from_secs(10), now), 1);
        assert_eq!(window.count_within(Duration::from_secs(900), now), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn share_exactly_window_old_is_excluded() {
        let mut window = ShareWindow::new();
        window.record(Instant::now());

        time::advance(Duration::from_secs(10)).await;

        assert_eq!(window.count_within(Duration::from_secs(10), Instant::now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wraps_and_keeps_most_recent() {
        let mut window = ShareWindow::with_capacity(4);
        for _ in 0..4 {
            window.record(Instant::now());
        }

        time::advance(Duration::from_secs(100)).await;
        window.record(Instant::now());
        window.record(Instant::now());

        let now = Instant::now();
        assert_eq!(window.len(), 4);
        assert_eq!(window.count_within(Duration::from_secs(10), now), 2);
        assert_eq!(window.count_within(Duration::from_secs(1000), now), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn count_saturates_at_capacity() {
        let mut window = ShareWindow::new();
        let now = Instant::now();
        for _ in 0..STAT_WINDOW_CAPACITY * 3 {
            window.record(now);
        }

        assert_eq!(window.len(), STAT_WINDOW_CAPACITY);
        assert_eq!(
            window.count_within(Duration::from_secs(900), now),
            STAT_WINDOW_CAPACITY
        );
    }

    #[test]
    fn empty_window_counts_nothing() {
        let window = ShareWindow::new();
        assert!(window.is_empty());
        assert_eq!(window.count_within(Duration::from_secs(10), Instant::now()), 0);
    }

    #[test_case(10 ; "short window")]
    #[test_case(900 ; "long window")]
    #[test_case(1800 ; "very long window")]
    fn zero_shares_is_zero_hashrate(seconds: u64) {
        assert_eq!(derive_hashrate(0, Duration::from_secs(seconds)), 0.0);
    }

    #[test]
    fn hashrate_uses_calibration_constant() {
        let ghs = derive_hashrate(20, Duration::from_secs(10));
        assert!((ghs - 2.0 * GHS_PER_SHARE_PER_SECOND).abs() < 1e-9);
    }
}
