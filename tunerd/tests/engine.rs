//! Probe logic driven through the host tables.

use tuner_ebpf_common::engine::file_fault::FilePage;
use tuner_ebpf_common::engine::{
    Maps, PerCpuSlot, TaskIds, Table, counters, file_fault, futex, io, membership, sched,
};
use tuner_ebpf_common::{
    CommRecord, EventKind, IoPattern, PrefetchEvent, TaskStats, TunerConfig, TunerEvent,
};
use tunerd::host::{Capacities, HostMaps, ManualClock};

const MS: u64 = 1_000_000;
const US: u64 = 1_000;

const TGID: u32 = 100;
const MAIN: TaskIds = TaskIds::new(TGID, 100);
const WORKER: TaskIds = TaskIds::new(TGID, 101);
const OUTSIDER: TaskIds = TaskIds::new(999, 999);

fn setup() -> (HostMaps, ManualClock) {
    let maps = HostMaps::new(2);
    maps.seed(TGID);
    (maps, ManualClock::new(10 * MS))
}

fn stats(maps: &HostMaps, tid: u32) -> TaskStats {
    maps.stats(tid).unwrap_or_default()
}

fn comm_records(maps: &HostMaps) -> Vec<CommRecord> {
    maps.comm_events
        .drain_vec()
        .iter()
        .map(|r| CommRecord::parse(r).unwrap())
        .collect()
}

fn spikes(maps: &HostMaps) -> Vec<TunerEvent> {
    maps.events
        .drain_vec()
        .iter()
        .map(|r| TunerEvent::parse(r).unwrap())
        .collect()
}

/// Wake at `t`, switch in after `delay_ns`.
fn wake_then_run(maps: &HostMaps, clock: &ManualClock, task: TaskIds, delay_ns: u64) {
    sched::on_wake(maps, clock, 1, task.tid);
    clock.advance(delay_ns);
    sched::on_switch(maps, clock, TaskIds::default(), task);
}

#[test]
fn first_wake_latency_seeds_the_ewma() {
    let (maps, clock) = setup();
    wake_then_run(&maps, &clock, WORKER, 100 * US);
    let s = stats(&maps, WORKER.tid);
    assert_eq!(s.ewma_runq_us, 100);
    assert_eq!(s.last_oncpu_ts_ns, clock.now_ns());
}

#[test]
fn later_samples_move_the_ewma_by_an_eighth() {
    let (maps, clock) = setup();
    wake_then_run(&maps, &clock, WORKER, 100 * US);
    sched::on_switch(&maps, &clock, WORKER, TaskIds::default());
    wake_then_run(&maps, &clock, WORKER, 20 * US);
    assert_eq!(stats(&maps, WORKER.tid).ewma_runq_us, (7 * 100 + 20) / 8);
}

#[test]
fn wake_timestamp_is_consumed_once() {
    let (maps, clock) = setup();
    wake_then_run(&maps, &clock, WORKER, 100 * US);
    assert!(maps.wake_ts.lookup(&WORKER.tid).is_none());

    // a second switch-in without a new wake leaves the EWMA alone
    sched::on_switch(&maps, &clock, WORKER, TaskIds::default());
    clock.advance(5 * MS);
    sched::on_switch(&maps, &clock, TaskIds::default(), WORKER);
    assert_eq!(stats(&maps, WORKER.tid).ewma_runq_us, 100);
}

#[test]
fn wake_records_carry_both_tids() {
    let (maps, clock) = setup();
    sched::on_wake(&maps, &clock, 7, WORKER.tid);
    assert_eq!(
        comm_records(&maps),
        vec![CommRecord::Wake {
            waker_tid: 7,
            wakee_tid: WORKER.tid
        }]
    );
}

#[test]
fn on_cpu_time_accumulates_across_slices() {
    let (maps, clock) = setup();
    sched::on_switch(&maps, &clock, TaskIds::default(), MAIN);
    clock.advance(3 * MS + 999);
    sched::on_switch(&maps, &clock, MAIN, TaskIds::default());
    assert_eq!(stats(&maps, MAIN.tid).total_oncpu_us, 3_000);
    assert_eq!(stats(&maps, MAIN.tid).last_oncpu_ts_ns, 0);

    clock.advance(MS);
    sched::on_switch(&maps, &clock, TaskIds::default(), MAIN);
    clock.advance(2 * MS);
    sched::on_switch(&maps, &clock, MAIN, TaskIds::default());
    assert_eq!(stats(&maps, MAIN.tid).total_oncpu_us, 5_000);

    // switching out twice adds nothing
    clock.advance(MS);
    sched::on_switch(&maps, &clock, MAIN, TaskIds::default());
    assert_eq!(stats(&maps, MAIN.tid).total_oncpu_us, 5_000);
}

#[test]
fn on_cpu_slices_of_one_microsecond_add_up() {
    let maps = HostMaps::new(1);
    maps.seed(TGID);
    let clock = ManualClock::new(10_000);
    sched::on_switch(&maps, &clock, TaskIds::default(), MAIN);
    clock.set(11_000);
    sched::on_switch(&maps, &clock, MAIN, TaskIds::default());
    clock.set(15_000);
    sched::on_switch(&maps, &clock, TaskIds::default(), MAIN);
    clock.set(16_000);
    sched::on_switch(&maps, &clock, MAIN, TaskIds::default());
    assert_eq!(stats(&maps, MAIN.tid).total_oncpu_us, 2);
}

#[test]
fn switch_in_at_time_zero_reads_as_off_cpu() {
    let maps = HostMaps::new(1);
    maps.seed(TGID);
    let clock = ManualClock::new(0);
    sched::on_switch(&maps, &clock, TaskIds::default(), MAIN);
    clock.advance(4 * MS);
    sched::on_switch(&maps, &clock, MAIN, TaskIds::default());
    assert_eq!(stats(&maps, MAIN.tid).total_oncpu_us, 0);
}

#[test]
fn switch_sides_are_gated_independently() {
    let (maps, clock) = setup();
    sched::on_wake(&maps, &clock, 1, OUTSIDER.tid);
    clock.advance(50 * US);
    sched::on_switch(&maps, &clock, MAIN, OUTSIDER);
    assert!(maps.stats(OUTSIDER.tid).is_none());
    // the outsider's pending wake is never consumed
    assert!(maps.wake_ts.lookup(&OUTSIDER.tid).is_some());
}

#[test]
fn plain_futex_rounds_up_into_the_cpu_aggregate() {
    let (maps, clock) = setup();
    clock.set_cpu(1);
    futex::on_enter(&maps, &clock, MAIN);
    clock.advance(1_001);
    futex::on_exit(&maps, &clock, MAIN);
    assert_eq!(maps.agg.values()[1].futex_us, 2);
    assert_eq!(maps.agg.values()[0].futex_us, 0);
    // plain waits never touch the per-thread EWMA
    assert_eq!(stats(&maps, MAIN.tid).ewma_futex_us, 0);
    assert!(maps.futex_ts.lookup(&MAIN.tid).is_none());
}

#[test]
fn vectored_futex_truncates_into_the_thread_ewma() {
    let (maps, clock) = setup();
    futex::on_waitv_enter(&maps, &clock, WORKER);
    clock.advance(1_999);
    futex::on_waitv_exit(&maps, &clock, WORKER);
    assert_eq!(stats(&maps, WORKER.tid).ewma_futex_us, 1);
    assert_eq!(maps.read_and_reset_agg().futex_us, 0);
}

#[test]
fn plain_futex_rounds_sub_microsecond_waits_up() {
    let (maps, clock) = setup();
    for wait_ns in [1, 999, 1_999] {
        futex::on_enter(&maps, &clock, MAIN);
        clock.advance(wait_ns);
        futex::on_exit(&maps, &clock, MAIN);
    }
    assert_eq!(maps.read_and_reset_agg().futex_us, 1 + 1 + 2);
}

#[test]
fn vectored_futex_below_a_microsecond_records_zero() {
    let (maps, clock) = setup();
    futex::on_waitv_enter(&maps, &clock, WORKER);
    clock.advance(999);
    futex::on_waitv_exit(&maps, &clock, WORKER);
    let s = maps.stats(WORKER.tid).unwrap();
    assert_eq!(s.ewma_futex_us, 0);
}

#[test]
fn futex_exit_without_enter_is_ignored() {
    let (maps, clock) = setup();
    futex::on_exit(&maps, &clock, MAIN);
    futex::on_waitv_exit(&maps, &clock, MAIN);
    assert_eq!(maps.read_and_reset_agg().futex_us, 0);
    assert!(maps.stats(MAIN.tid).is_none());
}

#[test]
fn spikes_fire_at_the_threshold() {
    let (maps, clock) = setup();
    futex::on_enter(&maps, &clock, MAIN);
    clock.advance(4_999 * US);
    futex::on_exit(&maps, &clock, MAIN);
    assert!(spikes(&maps).is_empty());

    futex::on_enter(&maps, &clock, MAIN);
    clock.advance(5 * MS);
    futex::on_exit(&maps, &clock, MAIN);
    let events = spikes(&maps);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tgid, TGID);
    assert_eq!(events[0].value_us, 5_000);
    assert_eq!(events[0].event_kind(), Some(EventKind::FutexSpike));

    maps.set_config(TunerConfig {
        futex_spike_us: 100,
        ..TunerConfig::zeroed()
    });
    futex::on_waitv_enter(&maps, &clock, WORKER);
    clock.advance(150 * US);
    futex::on_waitv_exit(&maps, &clock, WORKER);
    let events = spikes(&maps);
    assert_eq!(events[0].event_kind(), Some(EventKind::FutexWaitvSpike));
    assert_eq!(events[0].value_us, 150);
}

#[test]
fn futex_ops_are_recorded_unless_quiet() {
    let (maps, _clock) = setup();
    futex::on_op(&maps, OUTSIDER.tid, 0xdead_b000, 128);
    assert_eq!(
        comm_records(&maps),
        vec![CommRecord::FutexOp {
            tid: OUTSIDER.tid,
            uaddr: 0xdead_b000,
            op: 128
        }]
    );

    maps.set_config(TunerConfig {
        quiet_comm: 1,
        ..TunerConfig::zeroed()
    });
    let clock = ManualClock::new(MS);
    futex::on_op(&maps, MAIN.tid, 1, 0);
    sched::on_wake(&maps, &clock, 1, MAIN.tid);
    assert!(maps.comm_events.is_empty());
    // the wake is still recorded for latency
    assert!(maps.wake_ts.lookup(&MAIN.tid).is_some());
}

#[test]
fn fork_follows_only_monitored_parents_when_enabled() {
    let (maps, _clock) = setup();
    assert!(!membership::on_fork(&maps, TGID, 200));
    assert!(!membership::is_target(&maps, 200));

    maps.set_config(TunerConfig {
        follow_descendants: 1,
        ..TunerConfig::zeroed()
    });
    assert!(membership::on_fork(&maps, TGID, 200));
    assert!(membership::on_fork(&maps, 200, 300));
    assert!(!membership::on_fork(&maps, OUTSIDER.tgid, 400));
    assert!(membership::is_target(&maps, 300));
    assert!(!membership::is_target(&maps, 400));

    assert!(membership::on_exit(&maps, TaskIds::new(200, 200)));
    assert!(!membership::is_target(&maps, 200));
    assert!(!membership::on_exit(&maps, TaskIds::new(200, 200)));
}

#[test]
fn any_thread_exit_drops_the_group() {
    let (maps, _clock) = setup();
    assert!(membership::on_exit(&maps, WORKER));
    assert!(!membership::is_target(&maps, TGID));
    // the leader exiting later finds nothing left
    assert!(!membership::on_exit(&maps, MAIN));
}

#[test]
fn page_faults_count_per_thread_and_never_reach_the_aggregate() {
    let (maps, _clock) = setup();
    for _ in 0..3 {
        counters::on_user_fault(&maps, WORKER);
    }
    counters::on_user_fault(&maps, OUTSIDER);
    assert_eq!(stats(&maps, WORKER.tid).page_faults, 3);
    assert!(maps.stats(OUTSIDER.tid).is_none());
    assert_eq!(maps.read_and_reset_agg().page_faults, 0);
}

#[test]
fn io_sector_window_splits_at_64() {
    let (maps, _clock) = setup();
    io::on_block_complete(&maps, TGID, 1_000);
    assert_eq!(maps.io_pattern_for(TGID), (0, 0));
    io::on_block_complete(&maps, TGID, 1_063);
    io::on_block_complete(&maps, TGID, 1_127);
    io::on_block_complete(&maps, TGID, 1_000);
    assert_eq!(maps.io_pattern_for(TGID), (1, 2));
}

#[test]
fn io_repeat_sector_is_sequential_and_far_jump_random() {
    let (maps, _clock) = setup();
    io::on_block_complete(&maps, TGID, 1_000);
    io::on_block_complete(&maps, TGID, 1_000);
    io::on_block_complete(&maps, TGID, 2_000);
    assert_eq!(maps.io_pattern_for(TGID), (1, 1));
}

#[test]
fn io_table_evicts_the_coldest_group() {
    let maps = HostMaps::with_capacities(
        1,
        Capacities {
            io_patterns: 2,
            ..Capacities::default()
        },
    );
    io::on_block_complete(&maps, 1, 0);
    io::on_block_complete(&maps, 2, 0);
    io::on_block_complete(&maps, 1, 8);
    io::on_block_complete(&maps, 3, 0);
    assert!(maps.io_patterns.contains(&1));
    assert!(!maps.io_patterns.contains(&2));
    assert!(maps.io_patterns.contains(&3));
    assert_eq!(
        maps.io_patterns.lookup(&1),
        Some(IoPattern {
            last_sector: 8,
            seq: 1,
            rnd: 0
        })
    );
}

#[test]
fn llc_samples_sum_across_cpus() {
    let maps = HostMaps::new(3);
    counters::on_llc_sample(&maps, 0, 5);
    counters::on_llc_sample(&maps, 0, 5);
    counters::on_llc_sample(&maps, 2, 5);
    counters::on_llc_sample(&maps, 1, 6);
    assert_eq!(maps.llc_misses.per_cpu(&5), vec![Some(2), None, Some(1)]);
    assert_eq!(maps.llc_misses_for(5), 3);
    assert_eq!(maps.llc_misses_for(7), 0);
}

#[test]
fn aggregate_read_merges_then_resets() {
    let (maps, clock) = setup();
    for cpu in 0..2 {
        clock.set_cpu(cpu);
        futex::on_enter(&maps, &clock, MAIN);
        clock.advance(10 * US);
        futex::on_exit(&maps, &clock, MAIN);
    }
    assert_eq!(maps.read_and_reset_agg().futex_us, 20);
    assert_eq!(maps.read_and_reset_agg().futex_us, 0);
    maps.agg.modify_local(0, |a| a.futex_us = u64::MAX);
    maps.agg.modify_local(1, |a| a.futex_us = 1);
    assert_eq!(maps.read_and_reset_agg().futex_us, u64::MAX);
}

#[test]
fn full_tables_drop_new_threads_silently() {
    let maps = HostMaps::with_capacities(
        1,
        Capacities {
            tasks: 1,
            ..Capacities::default()
        },
    );
    maps.seed(TGID);
    counters::on_user_fault(&maps, MAIN);
    counters::on_user_fault(&maps, WORKER);
    assert_eq!(maps.stats(MAIN.tid).map(|s| s.page_faults), Some(1));
    assert!(maps.stats(WORKER.tid).is_none());
}

#[test]
fn full_channel_drops_records() {
    let maps = HostMaps::with_capacities(
        1,
        Capacities {
            channel_slots: 2,
            ..Capacities::default()
        },
    );
    let clock = ManualClock::new(MS);
    for tid in 0..5 {
        sched::on_wake(&maps, &clock, 1, tid);
    }
    assert_eq!(maps.comm_events.drain_vec().len(), 2);
    assert_eq!(maps.comm_events.dropped(), 3);
    // table state is unaffected by channel pressure
    assert_eq!(maps.wake_ts.len(), 5);
}

#[test]
fn file_faults_resolve_only_for_members() {
    let (maps, clock) = setup();
    let mut resolved = 0;
    file_fault::on_file_fault(&maps, &clock, OUTSIDER, || {
        resolved += 1;
        None
    });
    assert_eq!(resolved, 0);

    let page = FilePage {
        sb_dev: 0x803,
        ino: 42,
        pgoff: 7,
    };
    file_fault::on_file_fault(&maps, &clock, WORKER, || Some(page));
    file_fault::on_file_fault(&maps, &clock, MAIN, || None);
    let records = maps.prefetch_events.drain_vec();
    assert_eq!(records.len(), 1);
    let ev = PrefetchEvent::parse(&records[0]).unwrap();
    assert_eq!((ev.tgid, ev.tid), (TGID, WORKER.tid));
    assert_eq!((ev.sb_dev, ev.ino, ev.pgoff), (0x803, 42, 7));
    assert_eq!(ev.ts_ns, clock.now_ns());
}

#[test]
fn host_maps_report_the_configured_flags() {
    let (maps, _clock) = setup();
    assert_eq!(maps.config(), TunerConfig::zeroed());
    let cfg = TunerConfig {
        follow_descendants: 1,
        quiet_comm: 0,
        futex_spike_us: 42,
    };
    maps.set_config(cfg);
    assert_eq!(maps.config(), cfg);
}
