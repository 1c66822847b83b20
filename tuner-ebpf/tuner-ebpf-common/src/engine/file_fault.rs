use super::membership::is_target;
use super::{Channel, Clock, Maps, TaskIds};
use crate::PrefetchEvent;

/// Identity of the faulting file page.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FilePage {
    pub sb_dev: u32,
    pub ino: u64,
    pub pgoff: u64,
}

/// File-backed page fault. `resolve` walks the kernel structures and only
/// runs for monitored groups.
#[inline(always)]
pub fn on_file_fault<M, C, F>(maps: &M, clock: &C, task: TaskIds, resolve: F)
where
    M: Maps,
    C: Clock,
    F: FnOnce() -> Option<FilePage>,
{
    if !is_target(maps, task.tgid) {
        return;
    }
    let Some(page) = resolve() else {
        return;
    };
    let now = clock.now_ns();
    maps.prefetch_events().emit(|ev: &mut PrefetchEvent| {
        ev.tgid = task.tgid;
        ev.tid = task.tid;
        ev.ts_ns = now;
        ev.sb_dev = u64::from(page.sb_dev);
        ev.ino = page.ino;
        ev.pgoff = page.pgoff;
    });
}
