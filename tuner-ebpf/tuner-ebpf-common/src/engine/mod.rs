//! Probe logic shared by the kernel object and the in-process host backend.
//!
//! Every entry point is a run-to-completion function over the [`Maps`]
//! bundle: no allocation, no locks, no blocking. Failures (missing pending
//! timestamp, full table, full channel) are skipped silently.

use bytemuck::{Pod, Zeroable};

use crate::{Agg, IoPattern, TaskStats, TunerConfig};

pub mod counters;
pub mod file_fault;
pub mod futex;
pub mod io;
pub mod math;
pub mod membership;
pub mod sched;

/// Keyed table with per-key atomicity and a fixed capacity.
pub trait Table<K, V: Copy> {
    fn lookup(&self, key: &K) -> Option<V>;

    fn contains(&self, key: &K) -> bool;

    /// Create or overwrite. False when the table is full.
    fn upsert(&self, key: &K, value: &V) -> bool;

    /// Create only. False when the key exists or the table is full.
    fn insert_new(&self, key: &K, value: &V) -> bool;

    /// Mutate the stored value in place. False when the key is absent.
    fn modify<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool;

    fn remove(&self, key: &K) -> bool;

    /// Insert a zeroed value when absent, then mutate it.
    #[inline(always)]
    fn modify_or_init<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool
    where
        V: Zeroable,
    {
        if !self.contains(key) {
            self.insert_new(key, &V::zeroed());
        }
        self.modify(key, f)
    }
}

/// Single value partitioned by CPU. The kernel picks the partition
/// implicitly and ignores `cpu`.
pub trait PerCpuSlot<V> {
    fn modify_local<F: FnOnce(&mut V)>(&self, cpu: u32, f: F) -> bool;
}

/// Keyed table partitioned by CPU.
pub trait PerCpuTable<K, V> {
    fn modify_local<F: FnOnce(&mut V)>(&self, cpu: u32, key: &K, f: F) -> bool;

    fn insert_local(&self, cpu: u32, key: &K, value: &V) -> bool;
}

/// Bounded many-writer/single-reader record channel.
pub trait Channel {
    /// Reserve a zeroed record, let `fill` populate it, commit. Returns false
    /// (record dropped) when no space could be reserved.
    fn emit<T: Pod, F: FnOnce(&mut T)>(&self, fill: F) -> bool;
}

pub trait Clock {
    /// Monotonic nanoseconds.
    fn now_ns(&self) -> u64;

    /// CPU the current invocation runs on.
    fn cpu(&self) -> u32;
}

/// Thread and process-group id of a task.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskIds {
    pub tgid: u32,
    pub tid: u32,
}

impl TaskIds {
    pub const fn new(tgid: u32, tid: u32) -> Self {
        Self { tgid, tid }
    }

    /// Splits the `bpf_get_current_pid_tgid` encoding (tgid in the high half).
    pub const fn from_pid_tgid(pid_tgid: u64) -> Self {
        Self {
            tgid: (pid_tgid >> 32) as u32,
            tid: pid_tgid as u32,
        }
    }
}

/// Every table and channel the probes touch.
pub trait Maps {
    type Members: Table<u32, u8>;
    type Stats: Table<u32, TaskStats>;
    type Pending: Table<u32, u64>;
    type IoPatterns: Table<u32, IoPattern>;
    type Agg: PerCpuSlot<Agg>;
    type LlcMisses: PerCpuTable<u32, u64>;
    type Comm: Channel;
    type Events: Channel;
    type Prefetch: Channel;

    fn members(&self) -> &Self::Members;
    fn task_stats(&self) -> &Self::Stats;
    fn wake_ts(&self) -> &Self::Pending;
    fn futex_ts(&self) -> &Self::Pending;
    fn io_patterns(&self) -> &Self::IoPatterns;
    fn agg(&self) -> &Self::Agg;
    fn llc_misses(&self) -> &Self::LlcMisses;
    fn comm_events(&self) -> &Self::Comm;
    fn events(&self) -> &Self::Events;
    fn prefetch_events(&self) -> &Self::Prefetch;

    /// Current runtime flags; all-zero when never written.
    fn config(&self) -> TunerConfig;
}
