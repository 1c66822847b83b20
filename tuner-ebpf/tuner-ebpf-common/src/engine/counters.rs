use super::membership::is_target;
use super::{Maps, PerCpuTable, TaskIds, Table};

/// User-mode page fault of a monitored thread.
#[inline(always)]
pub fn on_user_fault<M: Maps>(maps: &M, task: TaskIds) {
    if !is_target(maps, task.tgid) {
        return;
    }
    maps.task_stats().modify_or_init(&task.tid, |stats| {
        stats.page_faults = stats.page_faults.wrapping_add(1);
    });
}

/// Cache-miss sample overflow. Not gated; counted per CPU per group.
#[inline(always)]
pub fn on_llc_sample<M: Maps>(maps: &M, cpu: u32, tgid: u32) {
    let misses = maps.llc_misses();
    if !misses.modify_local(cpu, &tgid, |count| *count = count.wrapping_add(1)) {
        misses.insert_local(cpu, &tgid, &1);
    }
}
