use std::time::{Duration, Instant};

/// Length of one averaging window.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Non-overlapping window speed meter shared by uploads and downloads.
///
/// The first update only establishes a baseline. Every later update that lands at least
/// [`SAMPLE_INTERVAL`] after the previous recomputation replaces the rate with
/// `(bytes since baseline * 1000) / elapsed_ms` and moves the baseline forward. Updates that
/// land inside the current window only accumulate.
#[derive(Debug, Clone)]
pub struct BandwidthSampler {
    interval: Duration,
    mark: Option<Instant>,
    baseline: u64,
    rate: u64,
}

impl Default for BandwidthSampler {
    fn default() -> Self {
        Self::new(SAMPLE_INTERVAL)
    }
}

impl BandwidthSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            mark: None,
            baseline: 0,
            rate: 0,
        }
    }

    /// Feed the cumulative byte counter observed at `now`. Returns the current rate in bytes/s.
    pub fn update(&mut self, total: u64, now: Instant) -> u64 {
        let Some(mark) = self.mark else {
            self.mark = Some(now);
            self.baseline = total;
            return self.rate;
        };

        let elapsed = now.saturating_duration_since(mark);
        if elapsed >= self.interval {
            let elapsed_ms = elapsed.as_millis().max(1);
            let delta = u128::from(total.saturating_sub(self.baseline));
            self.rate = u64::try_from(delta * 1000 / elapsed_ms).unwrap_or(u64::MAX);
            self.mark = Some(now);
            self.baseline = total;
        }
        self.rate
    }

    /// Last computed rate in bytes/s.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Rate as seen at `now`: zero once nothing has been sampled for `stall_after`.
    pub fn rate_at(&self, now: Instant, stall_after: Duration) -> u64 {
        match self.mark {
            Some(mark) if now.saturating_duration_since(mark) <= stall_after => self.rate,
            _ => 0,
        }
    }

    /// Forget the window, e.g. when a downloader is parked.
    pub fn reset(&mut self) {
        self.mark = None;
        self.baseline = 0;
        self.rate = 0;
    }
}
