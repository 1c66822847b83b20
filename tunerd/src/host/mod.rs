//! In-process backend for the probe engine.
//!
//! Mirrors the kernel maps closely enough that the engine can be exercised
//! without loading anything: fixed capacities, silent insert failures, an
//! evicting I/O pattern table, per-CPU partitions and lossy channels.

pub mod ring;
pub mod table;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tuner_ebpf_common::{
    Agg, CHANNEL_BYTES, IO_PATTERN_CAPACITY, IoPattern, LLC_MISS_CAPACITY, TARGET_TGIDS_CAPACITY,
    TASK_TABLE_CAPACITY, TaskStats, TunerConfig,
    engine::{Clock, Maps, Table},
};

pub use ring::RecordRing;
pub use table::{BoundedTable, LruTable, PerCpuCell, PerCpuHashTable};

#[derive(Debug, Clone, Copy)]
pub struct Capacities {
    pub members: usize,
    pub tasks: usize,
    pub io_patterns: usize,
    pub llc_misses: usize,
    pub channel_slots: usize,
}

impl Default for Capacities {
    fn default() -> Self {
        Self {
            members: TARGET_TGIDS_CAPACITY as usize,
            tasks: TASK_TABLE_CAPACITY as usize,
            io_patterns: IO_PATTERN_CAPACITY as usize,
            llc_misses: LLC_MISS_CAPACITY as usize,
            channel_slots: CHANNEL_BYTES as usize / ring::SLOT_BYTES,
        }
    }
}

pub struct HostMaps {
    pub members: BoundedTable<u32, u8>,
    pub task_stats: BoundedTable<u32, TaskStats>,
    pub wake_ts: BoundedTable<u32, u64>,
    pub futex_ts: BoundedTable<u32, u64>,
    pub io_patterns: LruTable<u32, IoPattern>,
    pub agg: PerCpuCell<Agg>,
    pub llc_misses: PerCpuHashTable<u32, u64>,
    pub comm_events: RecordRing,
    pub events: RecordRing,
    pub prefetch_events: RecordRing,
    follow_descendants: AtomicU32,
    quiet_comm: AtomicU32,
    futex_spike_us: AtomicU64,
}

impl HostMaps {
    pub fn new(cpus: u32) -> Self {
        Self::with_capacities(cpus, Capacities::default())
    }

    pub fn with_capacities(cpus: u32, caps: Capacities) -> Self {
        Self {
            members: BoundedTable::new(caps.members),
            task_stats: BoundedTable::new(caps.tasks),
            wake_ts: BoundedTable::new(caps.tasks),
            futex_ts: BoundedTable::new(caps.tasks),
            io_patterns: LruTable::new(caps.io_patterns),
            agg: PerCpuCell::new(cpus),
            llc_misses: PerCpuHashTable::new(cpus, caps.llc_misses),
            comm_events: RecordRing::new(caps.channel_slots),
            events: RecordRing::new(caps.channel_slots),
            prefetch_events: RecordRing::new(caps.channel_slots),
            follow_descendants: AtomicU32::new(0),
            quiet_comm: AtomicU32::new(0),
            futex_spike_us: AtomicU64::new(0),
        }
    }

    pub fn set_config(&self, cfg: TunerConfig) {
        self.follow_descendants
            .store(cfg.follow_descendants, Ordering::Relaxed);
        self.quiet_comm.store(cfg.quiet_comm, Ordering::Relaxed);
        self.futex_spike_us
            .store(cfg.futex_spike_us, Ordering::Relaxed);
    }

    /// Adds a group to the monitored set.
    pub fn seed(&self, tgid: u32) -> bool {
        self.members.upsert(&tgid, &1)
    }

    pub fn clear(&self, tgid: u32) -> bool {
        self.members.remove(&tgid)
    }

    pub fn stats(&self, tid: u32) -> Option<TaskStats> {
        self.task_stats.lookup(&tid)
    }

    /// Sum of the per-CPU aggregate, resetting every partition.
    pub fn read_and_reset_agg(&self) -> Agg {
        self.agg
            .take_all()
            .into_iter()
            .fold(Agg::default(), Agg::merge)
    }

    pub fn llc_misses_for(&self, tgid: u32) -> u64 {
        self.llc_misses
            .per_cpu(&tgid)
            .into_iter()
            .flatten()
            .fold(0u64, u64::saturating_add)
    }

    pub fn io_pattern_for(&self, tgid: u32) -> (u64, u64) {
        self.io_patterns
            .peek(&tgid)
            .map(|pat| (pat.seq, pat.rnd))
            .unwrap_or((0, 0))
    }
}

impl Maps for HostMaps {
    type Members = BoundedTable<u32, u8>;
    type Stats = BoundedTable<u32, TaskStats>;
    type Pending = BoundedTable<u32, u64>;
    type IoPatterns = LruTable<u32, IoPattern>;
    type Agg = PerCpuCell<Agg>;
    type LlcMisses = PerCpuHashTable<u32, u64>;
    type Comm = RecordRing;
    type Events = RecordRing;
    type Prefetch = RecordRing;

    fn members(&self) -> &Self::Members {
        &self.members
    }

    fn task_stats(&self) -> &Self::Stats {
        &self.task_stats
    }

    fn wake_ts(&self) -> &Self::Pending {
        &self.wake_ts
    }

    fn futex_ts(&self) -> &Self::Pending {
        &self.futex_ts
    }

    fn io_patterns(&self) -> &Self::IoPatterns {
        &self.io_patterns
    }

    fn agg(&self) -> &Self::Agg {
        &self.agg
    }

    fn llc_misses(&self) -> &Self::LlcMisses {
        &self.llc_misses
    }

    fn comm_events(&self) -> &Self::Comm {
        &self.comm_events
    }

    fn events(&self) -> &Self::Events {
        &self.events
    }

    fn prefetch_events(&self) -> &Self::Prefetch {
        &self.prefetch_events
    }

    fn config(&self) -> TunerConfig {
        TunerConfig {
            follow_descendants: self.follow_descendants.load(Ordering::Relaxed),
            quiet_comm: self.quiet_comm.load(Ordering::Relaxed),
            futex_spike_us: self.futex_spike_us.load(Ordering::Relaxed),
        }
    }
}

/// Clock driven by the caller.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
    cpu: AtomicU32,
}

impl ManualClock {
    pub fn new(now_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(now_ns),
            cpu: AtomicU32::new(0),
        }
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ns: u64) -> u64 {
        self.now_ns.fetch_add(delta_ns, Ordering::Relaxed) + delta_ns
    }

    pub fn set_cpu(&self, cpu: u32) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }

    fn cpu(&self) -> u32 {
        self.cpu.load(Ordering::Relaxed)
    }
}
