//! Wake-to-run latency and on-CPU time.

use super::math::{ewma_update, ns_to_us};
use super::membership::is_target;
use super::{Channel, Clock, Maps, TaskIds, Table};
use crate::{comm_kind, WakeRecord};

/// `sched_waking`: remember when the wakee became runnable. Not gated, the
/// wakee's group is unknown until it is switched in.
#[inline(always)]
pub fn on_wake<M: Maps, C: Clock>(maps: &M, clock: &C, waker_tid: u32, wakee_tid: u32) {
    let now = clock.now_ns();
    maps.wake_ts().upsert(&wakee_tid, &now);

    if maps.config().comm_enabled() {
        maps.comm_events().emit(|rec: &mut WakeRecord| {
            rec.kind = comm_kind::WAKE;
            rec.waker_tid = waker_tid;
            rec.wakee_tid = wakee_tid;
        });
    }
}

/// `sched_switch`: the incoming and outgoing threads are each gated on
/// their own group.
#[inline(always)]
pub fn on_switch<M: Maps, C: Clock>(maps: &M, clock: &C, prev: TaskIds, next: TaskIds) {
    let now = clock.now_ns();
    if is_target(maps, next.tgid) {
        switch_in(maps, clock.cpu(), next.tid, now);
    }
    if is_target(maps, prev.tgid) {
        switch_out(maps, prev.tid, now);
    }
}

#[inline(always)]
fn switch_in<M: Maps>(maps: &M, cpu: u32, tid: u32, now: u64) {
    let woken_at = maps.wake_ts().lookup(&tid);
    if woken_at.is_some() {
        maps.wake_ts().remove(&tid);
    }

    maps.task_stats().modify_or_init(&tid, |stats| {
        if let Some(ts) = woken_at {
            let delay_us = ns_to_us(now.saturating_sub(ts));
            stats.ewma_runq_us = ewma_update(stats.ewma_runq_us, delay_us);
            stats.last_cpu = cpu;
        }
        stats.last_oncpu_ts_ns = now;
    });
}

#[inline(always)]
fn switch_out<M: Maps>(maps: &M, tid: u32, now: u64) {
    maps.task_stats().modify(&tid, |stats| {
        if stats.last_oncpu_ts_ns != 0 {
            let ran_us = ns_to_us(now.saturating_sub(stats.last_oncpu_ts_ns));
            stats.total_oncpu_us = stats.total_oncpu_us.wrapping_add(ran_us);
            stats.last_oncpu_ts_ns = 0;
        }
    });
}
