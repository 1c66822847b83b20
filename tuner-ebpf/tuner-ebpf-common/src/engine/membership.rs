use super::{Maps, TaskIds, Table};

const PRESENT: u8 = 1;

#[inline(always)]
pub fn is_target<M: Maps>(maps: &M, tgid: u32) -> bool {
    maps.members().contains(&tgid)
}

/// Adds the child group when descendants are followed and the parent is
/// monitored. Returns whether the child was added.
#[inline(always)]
pub fn on_fork<M: Maps>(maps: &M, parent_tgid: u32, child_tgid: u32) -> bool {
    if !maps.config().follows_descendants() || !is_target(maps, parent_tgid) {
        return false;
    }
    maps.members().upsert(&child_tgid, &PRESENT)
}

/// Removes the exiting task's group, whichever thread of it exits.
/// Returns whether it was present.
#[inline(always)]
pub fn on_exit<M: Maps>(maps: &M, task: TaskIds) -> bool {
    maps.members().remove(&task.tgid)
}
