#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

pub mod engine;

// =============================================================================
// TABLE & CHANNEL SIZING
// =============================================================================
//
// Every table is pre-sized. Inserts into a full table fail and the probe
// carries on; the I/O pattern table is the only one that evicts.
// =============================================================================

/// Monitored process groups (pinned by name so the control plane can seed it).
pub const TARGET_TGIDS_CAPACITY: u32 = 8192;

/// Per-thread statistics and the two transient timestamp tables.
pub const TASK_TABLE_CAPACITY: u32 = 65536;

/// Per-process-group I/O access pattern, least-recently-used eviction.
pub const IO_PATTERN_CAPACITY: u32 = 4096;

/// Per-CPU cache-miss counters keyed by tgid.
pub const LLC_MISS_CAPACITY: u32 = 8192;

/// Byte size of each event channel (4 MiB).
pub const CHANNEL_BYTES: u32 = 1 << 22;

/// Smoothing factor of every latency EWMA: `v = (v * (N - 1) + s) / N`.
pub const EWMA_WEIGHT: u64 = 8;

/// Sector distance below which a completion counts as sequential.
pub const SEQUENTIAL_SECTOR_WINDOW: u64 = 64;

/// Futex wait (µs) at or above which a spike record is emitted.
pub const DEFAULT_FUTEX_SPIKE_US: u64 = 5000;

// =============================================================================
// STATISTICS TABLE VALUES
// =============================================================================

/// Per-thread accumulated scheduling statistics, keyed by tid.
///
/// `last_oncpu_ts_ns == 0` means the thread is not on a CPU. A switch-in at
/// timestamp 0 is therefore indistinguishable from "off CPU".
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskStats {
    pub last_oncpu_ts_ns: u64,
    /// Wake-to-run latency, µs, EWMA.
    pub ewma_runq_us: u64,
    /// Vectored futex wait, µs, EWMA.
    pub ewma_futex_us: u64,
    pub page_faults: u64,
    pub total_oncpu_us: u64,
    /// CPU the thread last ran on after a wake.
    pub last_cpu: u32,
    pub _pad: u32,
}

/// Per-CPU global aggregate.
///
/// `page_faults` is part of the layout but no probe ever increments it.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct Agg {
    pub futex_us: u64,
    pub page_faults: u64,
}

impl Agg {
    /// Partition-wise sum, saturating.
    pub fn merge(self, other: Agg) -> Agg {
        Agg {
            futex_us: self.futex_us.saturating_add(other.futex_us),
            page_faults: self.page_faults.saturating_add(other.page_faults),
        }
    }
}

/// Block I/O locality for one process group.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct IoPattern {
    pub last_sector: u64,
    pub seq: u64,
    pub rnd: u64,
}

/// Runtime flags written by the control plane. All-zero is the default
/// behaviour (see the accessors).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TunerConfig {
    pub follow_descendants: u32,
    /// Nonzero suppresses wake and futex-op records on the correlation channel.
    pub quiet_comm: u32,
    /// Zero selects [`DEFAULT_FUTEX_SPIKE_US`].
    pub futex_spike_us: u64,
}

impl TunerConfig {
    pub const fn zeroed() -> Self {
        Self {
            follow_descendants: 0,
            quiet_comm: 0,
            futex_spike_us: 0,
        }
    }

    pub const fn follows_descendants(&self) -> bool {
        self.follow_descendants != 0
    }

    pub const fn comm_enabled(&self) -> bool {
        self.quiet_comm == 0
    }

    pub const fn spike_threshold_us(&self) -> u64 {
        if self.futex_spike_us == 0 {
            DEFAULT_FUTEX_SPIKE_US
        } else {
            self.futex_spike_us
        }
    }
}

// =============================================================================
// KERNEL STRUCT OFFSETS
// =============================================================================
//
// Discovered from BTF by the daemon and handed to the probes as the read-only
// global `KERNEL_LAYOUT`. Zero task offsets, or a clear `file_chain_ready`,
// keep the dependent probes silent.
// =============================================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelLayout {
    /// `task_struct.pid` (thread id)
    pub task_pid_offset: u32,
    /// `task_struct.tgid` (process group id)
    pub task_tgid_offset: u32,

    // filemap_fault chain: vm_fault -> vma -> file -> inode -> super_block
    pub vm_fault_vma_offset: u32,
    pub vm_fault_pgoff_offset: u32,
    pub vma_vm_file_offset: u32,
    pub file_f_inode_offset: u32,
    pub inode_i_ino_offset: u32,
    pub inode_i_sb_offset: u32,
    pub super_block_s_dev_offset: u32,
    /// Nonzero once every filemap_fault offset resolved (`vma` sits at 0).
    pub file_chain_ready: u32,
}

impl KernelLayout {
    pub const fn zeroed() -> Self {
        Self {
            task_pid_offset: 0,
            task_tgid_offset: 0,
            vm_fault_vma_offset: 0,
            vm_fault_pgoff_offset: 0,
            vma_vm_file_offset: 0,
            file_f_inode_offset: 0,
            inode_i_ino_offset: 0,
            inode_i_sb_offset: 0,
            super_block_s_dev_offset: 0,
            file_chain_ready: 0,
        }
    }

    /// True when every offset the file-fault probe chases is known.
    pub const fn file_chain_known(&self) -> bool {
        self.file_chain_ready != 0
    }

    pub const fn task_ids_known(&self) -> bool {
        self.task_pid_offset != 0 && self.task_tgid_offset != 0
    }
}

// =============================================================================
// CHANNEL RECORDS
// =============================================================================
//
// COMM_EVENTS carries variable-format records whose first u32 is the kind.
// EVENTS and PREFETCH_EVENTS carry a single fixed layout each.
// =============================================================================

pub mod comm_kind {
    pub const WAKE: u32 = 1;
    pub const FUTEX_OP: u32 = 2;
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WakeRecord {
    pub kind: u32,
    pub _pad: u32,
    pub waker_tid: u32,
    pub wakee_tid: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FutexOpRecord {
    pub kind: u32,
    pub _pad: u32,
    pub uaddr: u64,
    pub tid: u32,
    pub op: u32,
}

/// A decoded correlation-channel record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum CommRecord {
    Wake { waker_tid: u32, wakee_tid: u32 },
    FutexOp { tid: u32, uaddr: u64, op: u32 },
}

impl CommRecord {
    /// Decodes one record. Short buffers and unknown kinds yield `None`.
    pub fn parse(data: &[u8]) -> Option<CommRecord> {
        let kind: u32 = read_prefix(data)?;
        match kind {
            comm_kind::WAKE => {
                let rec: WakeRecord = read_prefix(data)?;
                Some(CommRecord::Wake {
                    waker_tid: rec.waker_tid,
                    wakee_tid: rec.wakee_tid,
                })
            }
            comm_kind::FUTEX_OP => {
                let rec: FutexOpRecord = read_prefix(data)?;
                Some(CommRecord::FutexOp {
                    tid: rec.tid,
                    uaddr: rec.uaddr,
                    op: rec.op,
                })
            }
            _ => None,
        }
    }
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// Plain futex wait at or above the spike threshold (rounded-up µs).
    FutexSpike = 1,
    /// Vectored futex wait at or above the spike threshold (truncated µs).
    FutexWaitvSpike = 2,
}

impl EventKind {
    pub fn from_raw(raw: u32) -> Option<EventKind> {
        match raw {
            1 => Some(EventKind::FutexSpike),
            2 => Some(EventKind::FutexWaitvSpike),
            _ => None,
        }
    }
}

/// Generic telemetry record on the EVENTS channel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TunerEvent {
    pub tgid: u32,
    pub kind: u32,
    pub value_us: u64,
    pub ts_ns: u64,
}

impl TunerEvent {
    pub fn parse(data: &[u8]) -> Option<TunerEvent> {
        read_prefix(data)
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::from_raw(self.kind)
    }
}

/// File-backed page fault of a monitored group.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct PrefetchEvent {
    pub tgid: u32,
    pub tid: u32,
    pub ts_ns: u64,
    /// `dev_t` of the superblock, widened.
    pub sb_dev: u64,
    pub ino: u64,
    pub pgoff: u64,
}

impl PrefetchEvent {
    pub fn parse(data: &[u8]) -> Option<PrefetchEvent> {
        read_prefix(data)
    }
}

/// Reads a `T` from the front of `data`, ignoring trailing bytes (ring buffer
/// records are padded to 8 bytes).
fn read_prefix<T: Pod>(data: &[u8]) -> Option<T> {
    let bytes = data.get(..size_of::<T>())?;
    bytemuck::try_pod_read_unaligned(bytes).ok()
}

// =============================================================================
// CONNECTION TUNING
// =============================================================================

/// sock_ops callbacks that trigger connection tuning.
pub mod sock_ops {
    pub const TCP_CONNECT_CB: u32 = 3;
    pub const ACTIVE_ESTABLISHED_CB: u32 = 4;
    pub const PASSIVE_ESTABLISHED_CB: u32 = 5;

    pub const fn wants_tuning(op: u32) -> bool {
        matches!(
            op,
            TCP_CONNECT_CB | ACTIVE_ESTABLISHED_CB | PASSIVE_ESTABLISHED_CB
        )
    }
}

pub const SOL_SOCKET: i32 = 1;
pub const SOL_TCP: i32 = 6;
pub const SO_KEEPALIVE: i32 = 9;
pub const TCP_KEEPIDLE: i32 = 4;
pub const TCP_KEEPINTVL: i32 = 5;
pub const TCP_KEEPCNT: i32 = 6;
pub const TCP_CONGESTION: i32 = 13;

/// Congestion control requested on every tuned connection (NUL terminated).
pub const CONGESTION_ALGORITHM: [u8; 4] = *b"bbr\0";

/// Integer socket options applied after the congestion algorithm.
pub const KEEPALIVE_OPTIONS: [(i32, i32, i32); 4] = [
    (SOL_SOCKET, SO_KEEPALIVE, 1),
    (SOL_TCP, TCP_KEEPIDLE, 30),
    (SOL_TCP, TCP_KEEPINTVL, 10),
    (SOL_TCP, TCP_KEEPCNT, 6),
];

#[cfg(feature = "user")]
#[allow(dead_code)]
fn assert_layout_traits() {
    fn assert_traits<T: Pod + Zeroable>() {}
    assert_traits::<KernelLayout>();
    assert_traits::<TunerConfig>();
    assert_traits::<TaskStats>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layouts_match_wire_sizes() {
        assert_eq!(size_of::<WakeRecord>(), 16);
        assert_eq!(size_of::<FutexOpRecord>(), 24);
        assert_eq!(size_of::<TunerEvent>(), 24);
        assert_eq!(size_of::<PrefetchEvent>(), 40);
        assert_eq!(size_of::<TaskStats>(), 48);
        assert_eq!(size_of::<Agg>(), 16);
        assert_eq!(size_of::<IoPattern>(), 24);
        assert_eq!(size_of::<TunerConfig>(), 16);
        assert_eq!(size_of::<KernelLayout>() % 8, 0);
    }

    #[test]
    fn parses_wake_record() {
        let rec = WakeRecord {
            kind: comm_kind::WAKE,
            _pad: 0,
            waker_tid: 10,
            wakee_tid: 11,
        };
        assert_eq!(
            CommRecord::parse(bytemuck::bytes_of(&rec)),
            Some(CommRecord::Wake {
                waker_tid: 10,
                wakee_tid: 11
            })
        );
    }

    #[test]
    fn parses_futex_op_record_with_trailing_padding() {
        let rec = FutexOpRecord {
            kind: comm_kind::FUTEX_OP,
            _pad: 0,
            uaddr: 0x7fff_0000_1000,
            tid: 77,
            op: 128,
        };
        let mut buf = bytemuck::bytes_of(&rec).to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert_eq!(
            CommRecord::parse(&buf),
            Some(CommRecord::FutexOp {
                tid: 77,
                uaddr: 0x7fff_0000_1000,
                op: 128
            })
        );
    }

    #[test]
    fn rejects_short_and_unknown_records() {
        assert_eq!(CommRecord::parse(&[]), None);
        assert_eq!(CommRecord::parse(&[1, 0, 0]), None);
        // kind says wake, payload truncated
        assert_eq!(CommRecord::parse(&[1, 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(CommRecord::parse(&[9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(TunerEvent::parse(&[0u8; 23]), None);
        assert_eq!(PrefetchEvent::parse(&[0u8; 39]), None);
    }

    #[test]
    fn prefetch_device_is_a_full_word() {
        let mut raw = [0u8; 40];
        raw[16..24].copy_from_slice(&0x1_0000_0803u64.to_ne_bytes());
        raw[24..32].copy_from_slice(&42u64.to_ne_bytes());
        let ev = PrefetchEvent::parse(&raw).unwrap();
        assert_eq!(ev.sb_dev, 0x1_0000_0803);
        assert_eq!(ev.ino, 42);
    }

    #[test]
    fn zeroed_config_means_defaults() {
        let cfg = TunerConfig::zeroed();
        assert!(!cfg.follows_descendants());
        assert!(cfg.comm_enabled());
        assert_eq!(cfg.spike_threshold_us(), DEFAULT_FUTEX_SPIKE_US);

        let cfg = TunerConfig {
            follow_descendants: 1,
            quiet_comm: 1,
            futex_spike_us: 250,
        };
        assert!(cfg.follows_descendants());
        assert!(!cfg.comm_enabled());
        assert_eq!(cfg.spike_threshold_us(), 250);
    }

    #[test]
    fn sock_ops_tuning_callbacks() {
        assert!(sock_ops::wants_tuning(sock_ops::TCP_CONNECT_CB));
        assert!(sock_ops::wants_tuning(sock_ops::PASSIVE_ESTABLISHED_CB));
        assert!(!sock_ops::wants_tuning(1));
        assert!(!sock_ops::wants_tuning(6));
    }

    #[test]
    fn agg_merge_sums_partitions() {
        let a = Agg {
            futex_us: 5,
            page_faults: 0,
        };
        let b = Agg {
            futex_us: 7,
            page_faults: 0,
        };
        assert_eq!(a.merge(b).futex_us, 12);
    }

    #[cfg(feature = "user")]
    #[test]
    fn tuner_event_serializes() {
        let event = TunerEvent {
            tgid: 42,
            kind: EventKind::FutexSpike as u32,
            value_us: 6000,
            ts_ns: 1_000,
        };
        let json = serde_json::to_string(&event).expect("serialize tuner event");
        let roundtrip: TunerEvent = serde_json::from_str(&json).expect("deserialize tuner event");
        assert_eq!(roundtrip, event);
        assert_eq!(roundtrip.event_kind(), Some(EventKind::FutexSpike));
    }
}
