//! Futex wait tracking.
//!
//! Plain `futex` waits round up to whole microseconds and feed the per-CPU
//! aggregate. `futex_waitv` waits truncate and feed the per-thread EWMA. Both
//! share the same pending-timestamp table.

use super::math::{ewma_update, ns_to_us, ns_to_us_round_up};
use super::membership::is_target;
use super::{Channel, Clock, Maps, PerCpuSlot, TaskIds, Table};
use crate::{comm_kind, EventKind, FutexOpRecord, TunerEvent};

#[inline(always)]
pub fn on_enter<M: Maps, C: Clock>(maps: &M, clock: &C, task: TaskIds) {
    if !is_target(maps, task.tgid) {
        return;
    }
    maps.futex_ts().upsert(&task.tid, &clock.now_ns());
}

#[inline(always)]
pub fn on_exit<M: Maps, C: Clock>(maps: &M, clock: &C, task: TaskIds) {
    let Some((now, waited_ns)) = take_wait(maps, clock, task) else {
        return;
    };
    let waited_us = ns_to_us_round_up(waited_ns);
    maps.agg().modify_local(clock.cpu(), |agg| {
        agg.futex_us = agg.futex_us.wrapping_add(waited_us);
    });
    report_spike(maps, task.tgid, EventKind::FutexSpike, waited_us, now);
}

#[inline(always)]
pub fn on_waitv_enter<M: Maps, C: Clock>(maps: &M, clock: &C, task: TaskIds) {
    on_enter(maps, clock, task);
}

#[inline(always)]
pub fn on_waitv_exit<M: Maps, C: Clock>(maps: &M, clock: &C, task: TaskIds) {
    let Some((now, waited_ns)) = take_wait(maps, clock, task) else {
        return;
    };
    let waited_us = ns_to_us(waited_ns);
    maps.task_stats().modify_or_init(&task.tid, |stats| {
        stats.ewma_futex_us = ewma_update(stats.ewma_futex_us, waited_us);
    });
    report_spike(maps, task.tgid, EventKind::FutexWaitvSpike, waited_us, now);
}

/// Raw futex operation, emitted for userspace correlation. Not gated.
#[inline(always)]
pub fn on_op<M: Maps>(maps: &M, tid: u32, uaddr: u64, op: u32) {
    if !maps.config().comm_enabled() {
        return;
    }
    maps.comm_events().emit(|rec: &mut FutexOpRecord| {
        rec.kind = comm_kind::FUTEX_OP;
        rec.uaddr = uaddr;
        rec.tid = tid;
        rec.op = op;
    });
}

/// Consumes the pending start timestamp: `(now, elapsed_ns)`.
#[inline(always)]
fn take_wait<M: Maps, C: Clock>(maps: &M, clock: &C, task: TaskIds) -> Option<(u64, u64)> {
    if !is_target(maps, task.tgid) {
        return None;
    }
    let start = maps.futex_ts().lookup(&task.tid)?;
    maps.futex_ts().remove(&task.tid);
    let now = clock.now_ns();
    Some((now, now.saturating_sub(start)))
}

#[inline(always)]
fn report_spike<M: Maps>(maps: &M, tgid: u32, kind: EventKind, value_us: u64, now: u64) {
    if value_us < maps.config().spike_threshold_us() {
        return;
    }
    maps.events().emit(|ev: &mut TunerEvent| {
        ev.tgid = tgid;
        ev.kind = kind as u32;
        ev.value_us = value_us;
        ev.ts_ns = now;
    });
}
