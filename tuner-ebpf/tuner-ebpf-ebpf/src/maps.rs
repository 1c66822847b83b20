use aya_ebpf::{
    helpers::{bpf_ktime_get_ns, gen::bpf_get_smp_processor_id},
    macros::map,
    maps::{Array, HashMap, LruHashMap, PerCpuArray, PerCpuHashMap, RingBuf},
};
use bytemuck::{Pod, Zeroable};
use tuner_ebpf_common::{
    engine::{Channel, Clock, Maps, PerCpuSlot, PerCpuTable, Table},
    Agg, IoPattern, TaskStats, TunerConfig, CHANNEL_BYTES, IO_PATTERN_CAPACITY,
    LLC_MISS_CAPACITY, TARGET_TGIDS_CAPACITY, TASK_TABLE_CAPACITY,
};

const BPF_ANY: u64 = 0;
const BPF_NOEXIST: u64 = 1;

// =============================================================================
// MAPS
// =============================================================================

/// Pinned by name so the control plane can seed it before attach.
#[map(name = "TARGET_TGIDS")]
static TARGET_TGIDS: HashMap<u32, u8> = HashMap::pinned(TARGET_TGIDS_CAPACITY, 0);

#[map(name = "TID_STATS")]
static TID_STATS: HashMap<u32, TaskStats> = HashMap::with_max_entries(TASK_TABLE_CAPACITY, 0);

#[map(name = "TID_WAKE_TS")]
static TID_WAKE_TS: HashMap<u32, u64> = HashMap::with_max_entries(TASK_TABLE_CAPACITY, 0);

#[map(name = "FUTEX_TS")]
static FUTEX_TS: HashMap<u32, u64> = HashMap::with_max_entries(TASK_TABLE_CAPACITY, 0);

#[map(name = "AGG")]
static AGG: PerCpuArray<Agg> = PerCpuArray::with_max_entries(1, 0);

#[map(name = "IO_PAT")]
static IO_PAT: LruHashMap<u32, IoPattern> = LruHashMap::with_max_entries(IO_PATTERN_CAPACITY, 0);

#[map(name = "LLC_MISS")]
static LLC_MISS: PerCpuHashMap<u32, u64> = PerCpuHashMap::with_max_entries(LLC_MISS_CAPACITY, 0);

#[map(name = "TUNER_CFG")]
static TUNER_CFG: Array<TunerConfig> = Array::with_max_entries(1, 0);

#[map(name = "COMM_EVENTS")]
static COMM_EVENTS: RingBuf = RingBuf::with_byte_size(CHANNEL_BYTES, 0);

#[map(name = "EVENTS")]
static EVENTS: RingBuf = RingBuf::with_byte_size(CHANNEL_BYTES, 0);

#[map(name = "PREFETCH_EVENTS")]
static PREFETCH_EVENTS: RingBuf = RingBuf::with_byte_size(CHANNEL_BYTES, 0);

// =============================================================================
// ENGINE BINDINGS
// =============================================================================

pub struct Hash<K: 'static, V: 'static>(&'static HashMap<K, V>);

pub struct Lru<K: 'static, V: 'static>(&'static LruHashMap<K, V>);

macro_rules! impl_table {
    ($wrapper:ident) => {
        impl<K, V: Copy> Table<K, V> for $wrapper<K, V> {
            #[inline(always)]
            fn lookup(&self, key: &K) -> Option<V> {
                unsafe { self.0.get(key).copied() }
            }

            #[inline(always)]
            fn contains(&self, key: &K) -> bool {
                self.0.get_ptr(key).is_some()
            }

            #[inline(always)]
            fn upsert(&self, key: &K, value: &V) -> bool {
                self.0.insert(key, value, BPF_ANY).is_ok()
            }

            #[inline(always)]
            fn insert_new(&self, key: &K, value: &V) -> bool {
                self.0.insert(key, value, BPF_NOEXIST).is_ok()
            }

            #[inline(always)]
            fn modify<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
                match self.0.get_ptr_mut(key) {
                    Some(ptr) => {
                        f(unsafe { &mut *ptr });
                        true
                    }
                    None => false,
                }
            }

            #[inline(always)]
            fn remove(&self, key: &K) -> bool {
                self.0.remove(key).is_ok()
            }
        }
    };
}

impl_table!(Hash);
impl_table!(Lru);

/// The kernel selects the partition; `cpu` is only meaningful on the host.
pub struct CpuSlot<V: 'static>(&'static PerCpuArray<V>);

impl<V> PerCpuSlot<V> for CpuSlot<V> {
    #[inline(always)]
    fn modify_local<F: FnOnce(&mut V)>(&self, _cpu: u32, f: F) -> bool {
        match self.0.get_ptr_mut(0) {
            Some(ptr) => {
                f(unsafe { &mut *ptr });
                true
            }
            None => false,
        }
    }
}

pub struct CpuHash<K: 'static, V: 'static>(&'static PerCpuHashMap<K, V>);

impl<K, V> PerCpuTable<K, V> for CpuHash<K, V> {
    #[inline(always)]
    fn modify_local<F: FnOnce(&mut V)>(&self, _cpu: u32, key: &K, f: F) -> bool {
        match self.0.get_ptr_mut(key) {
            Some(ptr) => {
                f(unsafe { &mut *ptr });
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    fn insert_local(&self, _cpu: u32, key: &K, value: &V) -> bool {
        self.0.insert(key, value, BPF_ANY).is_ok()
    }
}

pub struct Ring(&'static RingBuf);

impl Channel for Ring {
    #[inline(always)]
    fn emit<T: Pod, F: FnOnce(&mut T)>(&self, fill: F) -> bool {
        let Some(mut entry) = self.0.reserve::<T>(0) else {
            return false;
        };
        fill(entry.write(T::zeroed()));
        entry.submit(0);
        true
    }
}

pub struct KernelMaps {
    members: Hash<u32, u8>,
    task_stats: Hash<u32, TaskStats>,
    wake_ts: Hash<u32, u64>,
    futex_ts: Hash<u32, u64>,
    io_patterns: Lru<u32, IoPattern>,
    agg: CpuSlot<Agg>,
    llc_misses: CpuHash<u32, u64>,
    config: &'static Array<TunerConfig>,
    comm_events: Ring,
    events: Ring,
    prefetch_events: Ring,
}

pub static KERNEL: KernelMaps = KernelMaps {
    members: Hash(&TARGET_TGIDS),
    task_stats: Hash(&TID_STATS),
    wake_ts: Hash(&TID_WAKE_TS),
    futex_ts: Hash(&FUTEX_TS),
    io_patterns: Lru(&IO_PAT),
    agg: CpuSlot(&AGG),
    llc_misses: CpuHash(&LLC_MISS),
    config: &TUNER_CFG,
    comm_events: Ring(&COMM_EVENTS),
    events: Ring(&EVENTS),
    prefetch_events: Ring(&PREFETCH_EVENTS),
};

impl Maps for KernelMaps {
    type Members = Hash<u32, u8>;
    type Stats = Hash<u32, TaskStats>;
    type Pending = Hash<u32, u64>;
    type IoPatterns = Lru<u32, IoPattern>;
    type Agg = CpuSlot<Agg>;
    type LlcMisses = CpuHash<u32, u64>;
    type Comm = Ring;
    type Events = Ring;
    type Prefetch = Ring;

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

    #[inline(always)]
    fn config(&self) -> TunerConfig {
        unsafe { self.config.get(0) }
            .copied()
            .unwrap_or_else(TunerConfig::zeroed)
    }
}

pub struct KernelClock;

impl Clock for KernelClock {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn cpu(&self) -> u32 {
        unsafe { bpf_get_smp_processor_id() }
    }
}
