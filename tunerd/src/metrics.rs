use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Channels drained by the daemon, used to index per-channel counters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Comm = 0,
    Events = 1,
    Prefetch = 2,
}

const CHANNEL_SLOTS: usize = 3;

/// Daemon counters.
///
/// Updated from the channel listeners so all fields are atomic.
pub struct Metrics {
    pub start_time: SystemTime,
    wake_records: AtomicU64,
    futex_op_records: AtomicU64,
    spike_events: AtomicU64,
    prefetch_events: AtomicU64,
    decode_failures: AtomicU64,
    empty_polls: AtomicU64,
    snapshots: AtomicU64,
    // Per-second tracking
    records_this_sec: AtomicU64,
    records_per_sec: AtomicU64,
    rate_limited: [AtomicU64; CHANNEL_SLOTS],
}

/// Point-in-time copy of [`Metrics`] for logging and snapshots.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub wake_records: u64,
    pub futex_op_records: u64,
    pub spike_events: u64,
    pub prefetch_events: u64,
    pub decode_failures: u64,
    pub empty_polls: u64,
    pub records_per_sec: u64,
    pub rate_limited: u64,
    pub uptime_seconds: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            wake_records: AtomicU64::new(0),
            futex_op_records: AtomicU64::new(0),
            spike_events: AtomicU64::new(0),
            prefetch_events: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
            snapshots: AtomicU64::new(0),
            records_this_sec: AtomicU64::new(0),
            records_per_sec: AtomicU64::new(0),
            rate_limited: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Count an incoming record. Returns true if it should be forwarded,
    /// false if it is sampled out under `cap` records per second. Spike
    /// events are never sampled out.
    #[allow(clippy::manual_is_multiple_of)] // is_multiple_of not stable in nightly-2024-12-10
    pub fn record(&self, cap: u64, channel: ChannelKind) -> bool {
        const SAMPLE_N: u64 = 10;
        let count = self.records_this_sec.fetch_add(1, Ordering::Relaxed) + 1;
        if cap > 0 && count > cap && channel != ChannelKind::Events && count % SAMPLE_N != 0 {
            self.rate_limited[channel as usize].fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Called periodically to refresh the records-per-second metric.
    pub fn rollup(&self) {
        let per_sec = self.records_this_sec.swap(0, Ordering::Relaxed);
        self.records_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn inc_wake(&self) {
        self.wake_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_futex_op(&self) {
        self.futex_op_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_spike(&self) {
        self.spike_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_prefetch(&self) {
        self.prefetch_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_snapshot(&self) -> u64 {
        self.snapshots.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn rate_limited(&self, channel: ChannelKind) -> u64 {
        self.rate_limited[channel as usize].load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            wake_records: self.wake_records.load(Ordering::Relaxed),
            futex_op_records: self.futex_op_records.load(Ordering::Relaxed),
            spike_events: self.spike_events.load(Ordering::Relaxed),
            prefetch_events: self.prefetch_events.load(Ordering::Relaxed),
            decode_failures: self.decode_failures(),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            records_per_sec: self.records_per_sec.load(Ordering::Relaxed),
            rate_limited: self
                .rate_limited
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .sum(),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
