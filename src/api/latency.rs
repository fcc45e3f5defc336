//! In-memory latency histogram for poll instrumentation.
//! Records wall time of each poll cycle, fetch plus retries.

use std::sync::Mutex;
use std::time::Duration;

/// Shared latency stats. Scheduler records, API reads.
/// Values stored in microseconds.
pub struct LatencyStats {
    inner: Option<Mutex<hdrhistogram::Histogram<u64>>>,
}

impl LatencyStats {
    /// Tracks 1us to 10min, 3 significant figures.
    pub fn new() -> Self {
        let inner = hdrhistogram::Histogram::new_with_bounds(1, 600_000_000, 3)
            .ok()
            .map(Mutex::new);
        Self { inner }
    }

    pub fn record_us(&self, us: u64) {
        if let Some(Ok(mut h)) = self.inner.as_ref().map(|m| m.lock()) {
            let _ = h.record(us.max(1));
        }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        self.record_us(us);
    }

    /// Return (p50_us, p95_us, p99_us). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Some(Ok(h)) = self.inner.as_ref().map(|m| m.lock()) else {
            return (None, None, None);
        };
        if h.len() == 0 {
            return (None, None, None);
        }
        let p50 = h.value_at_quantile(0.5);
        let p95 = h.value_at_quantile(0.95);
        let p99 = h.value_at_quantile(0.99);
        (Some(p50), Some(p95), Some(p99))
    }

    pub fn len(&self) -> u64 {
        match self.inner.as_ref().map(|m| m.lock()) {
            Some(Ok(h)) => h.len(),
            _ => 0,
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let stats = LatencyStats::new();
        assert_eq!(stats.percentiles(), (None, None, None));
        assert_eq!(stats.len(), 0);
    }

    #[test]
    fn records_durations_in_microseconds() {
        let stats = LatencyStats::new();
        for ms in 1..=100 {
            stats.record(Duration::from_millis(ms));
        }
        assert_eq!(stats.len(), 100);
        let (p50, _, p99) = stats.percentiles();
        let p50 = p50.unwrap();
        assert!((49_000..=51_000).contains(&p50), "p50 was {p50}");
        assert!(p99.unwrap() >= p50);
    }
}
