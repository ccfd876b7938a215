//! Shared session counters and network-age accounting
//!
//! Every thread in a session increments these lock-free counters; the
//! stats sampler reads them once per second. Monotonic counters are
//! diffed against the previous window by the sampler, while the
//! age/path/jitter/decode sums are read-and-reset so each window reports
//! its own averages.
//!
//! Network age is `now - send_time_us` against the sender's wall clock.
//! It is only meaningful as a relative measure: the session-wide minimum
//! serves as the one-way-delay baseline, and `path = age - min` tracks
//! the variation above it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Ages outside [0, 5 s] mean a skewed clock; they are dropped
pub const MAX_PLAUSIBLE_AGE_US: u64 = 5_000_000;

/// Lock-free counter block shared by every thread of a session.
pub struct SessionStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    parse_errors: AtomicU64,
    payload_errors: AtomicU64,
    underruns: AtomicU64,

    decode_us_sum: AtomicU64,
    decode_count: AtomicU64,

    age_us_sum: AtomicU64,
    age_count: AtomicU64,
    min_age_us: AtomicU64,
    path_us_sum: AtomicU64,
    path_count: AtomicU64,
    jitter_us_sum: AtomicU64,
    jitter_count: AtomicU64,
}

/// Cumulative counter values; subtract two to get a window delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterTotals {
    pub packets: u64,
    pub bytes: u64,
    pub parse_errors: u64,
    pub payload_errors: u64,
    pub underruns: u64,
}

impl CounterTotals {
    pub fn delta_since(&self, earlier: &CounterTotals) -> CounterTotals {
        CounterTotals {
            packets: self.packets.saturating_sub(earlier.packets),
            bytes: self.bytes.saturating_sub(earlier.bytes),
            parse_errors: self.parse_errors.saturating_sub(earlier.parse_errors),
            payload_errors: self.payload_errors.saturating_sub(earlier.payload_errors),
            underruns: self.underruns.saturating_sub(earlier.underruns),
        }
    }
}

/// Per-window averages in milliseconds; `None` when no samples landed.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowAverages {
    pub net_age_ms: Option<f64>,
    pub net_path_ms: Option<f64>,
    pub net_jitter_ms: Option<f64>,
    pub decode_ms: Option<f64>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            payload_errors: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            decode_us_sum: AtomicU64::new(0),
            decode_count: AtomicU64::new(0),
            age_us_sum: AtomicU64::new(0),
            age_count: AtomicU64::new(0),
            min_age_us: AtomicU64::new(u64::MAX),
            path_us_sum: AtomicU64::new(0),
            path_count: AtomicU64::new(0),
            jitter_us_sum: AtomicU64::new(0),
            jitter_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_packet(&self, wire_bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(wire_bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_payload_error(&self) {
        self.payload_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_us(&self, us: u64) {
        self.decode_us_sum.fetch_add(us, Ordering::Relaxed);
        self.decode_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one plausible network-age sample. `prev_age_us` is the
    /// previous packet's age on the same connection, for the inter-arrival
    /// jitter sum.
    pub(crate) fn record_age_us(&self, age_us: u64, prev_age_us: Option<u64>) {
        self.age_us_sum.fetch_add(age_us, Ordering::Relaxed);
        self.age_count.fetch_add(1, Ordering::Relaxed);

        let prior_min = self.min_age_us.fetch_min(age_us, Ordering::Relaxed);
        let baseline = prior_min.min(age_us);
        self.path_us_sum
            .fetch_add(age_us - baseline, Ordering::Relaxed);
        self.path_count.fetch_add(1, Ordering::Relaxed);

        if let Some(prev) = prev_age_us {
            self.jitter_us_sum
                .fetch_add(age_us.abs_diff(prev), Ordering::Relaxed);
            self.jitter_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Session-minimum network age, the one-way-delay baseline.
    pub fn min_age_us(&self) -> Option<u64> {
        match self.min_age_us.load(Ordering::Relaxed) {
            u64::MAX => None,
            min => Some(min),
        }
    }

    pub fn totals(&self) -> CounterTotals {
        CounterTotals {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            payload_errors: self.payload_errors.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }

    /// Drain the window sums and return this window's averages. The
    /// session-minimum age is kept; it is the baseline, not a window
    /// statistic.
    pub(crate) fn take_window_averages(&self) -> WindowAverages {
        fn avg_ms(sum: &AtomicU64, count: &AtomicU64) -> Option<f64> {
            let sum = sum.swap(0, Ordering::Relaxed);
            let count = count.swap(0, Ordering::Relaxed);
            if count == 0 {
                None
            } else {
                Some(sum as f64 / count as f64 / 1000.0)
            }
        }

        WindowAverages {
            net_age_ms: avg_ms(&self.age_us_sum, &self.age_count),
            net_path_ms: avg_ms(&self.path_us_sum, &self.path_count),
            net_jitter_ms: avg_ms(&self.jitter_us_sum, &self.jitter_count),
            decode_ms: avg_ms(&self.decode_us_sum, &self.decode_count),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}
