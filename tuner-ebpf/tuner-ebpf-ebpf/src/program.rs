use core::mem::size_of;

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_probe_read, gen::bpf_setsockopt},
    macros::{btf_tracepoint, kprobe, perf_event, sock_ops, tracepoint},
    programs::{
        BtfTracePointContext, PerfEventContext, ProbeContext, SockOpsContext, TracePointContext,
    },
};
use aya_log_ebpf::{debug, info};
use tuner_ebpf_common::{
    engine::{
        counters,
        file_fault::{self, FilePage},
        futex, io, membership, sched, Clock, TaskIds,
    },
    sock_ops as sock_ops_cb, KernelLayout, CONGESTION_ALGORITHM, KEEPALIVE_OPTIONS, SOL_TCP,
    TCP_CONGESTION,
};

use crate::maps::{KernelClock, KERNEL};

#[no_mangle]
static KERNEL_LAYOUT: KernelLayout = KernelLayout::zeroed();

// syscalls/sys_enter_futex: 8-byte common header, __syscall_nr, then one
// 8-byte slot per argument.
const SYS_ENTER_FUTEX_UADDR_OFFSET: usize = 16;
const SYS_ENTER_FUTEX_OP_OFFSET: usize = 24;

// block/block_rq_complete: common header, dev_t dev, sector_t sector.
const BLOCK_RQ_COMPLETE_SECTOR_OFFSET: usize = 16;

#[repr(C)]
struct TaskStruct {
    _opaque: [u8; 0],
}

fn load_layout() -> KernelLayout {
    unsafe { core::ptr::read_volatile(&KERNEL_LAYOUT) }
}

fn read_field<T: Copy>(base: *const u8, offset: u32) -> Option<T> {
    if base.is_null() {
        return None;
    }
    let ptr = unsafe { base.add(offset as usize) as *const T };
    unsafe { bpf_probe_read(ptr).ok() }
}

fn read_ptr(base: *const u8, offset: u32) -> Option<*const u8> {
    let addr: usize = read_field(base, offset)?;
    if addr == 0 {
        None
    } else {
        Some(addr as *const u8)
    }
}

#[inline(always)]
fn read_task_ids(task: *const TaskStruct, layout: &KernelLayout) -> Option<TaskIds> {
    if !layout.task_ids_known() {
        return None;
    }
    let task = task as *const u8;
    let tid: i32 = read_field(task, layout.task_pid_offset)?;
    let tgid: i32 = read_field(task, layout.task_tgid_offset)?;
    Some(TaskIds::new(tgid as u32, tid as u32))
}

#[inline(always)]
fn current_task() -> TaskIds {
    TaskIds::from_pid_tgid(unsafe { bpf_get_current_pid_tgid() })
}

// =============================================================================
// SCHEDULER
// =============================================================================

#[btf_tracepoint(function = "sched_waking")]
pub fn sched_waking(ctx: BtfTracePointContext) -> i32 {
    let layout = load_layout();
    let wakee = unsafe { ctx.arg::<*const TaskStruct>(0) };
    if let Some(wakee) = read_task_ids(wakee, &layout) {
        sched::on_wake(&KERNEL, &KernelClock, current_task().tid, wakee.tid);
    }
    0
}

/// TP_PROTO(bool preempt, struct task_struct *prev, struct task_struct *next, ...)
#[btf_tracepoint(function = "sched_switch")]
pub fn sched_switch(ctx: BtfTracePointContext) -> i32 {
    let layout = load_layout();
    let prev = unsafe { ctx.arg::<*const TaskStruct>(1) };
    let next = unsafe { ctx.arg::<*const TaskStruct>(2) };
    let (Some(prev), Some(next)) = (read_task_ids(prev, &layout), read_task_ids(next, &layout))
    else {
        return 0;
    };
    sched::on_switch(&KERNEL, &KernelClock, prev, next);
    0
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

#[btf_tracepoint(function = "sched_process_fork")]
pub fn sched_process_fork(ctx: BtfTracePointContext) -> i32 {
    let layout = load_layout();
    let parent = unsafe { ctx.arg::<*const TaskStruct>(0) };
    let child = unsafe { ctx.arg::<*const TaskStruct>(1) };
    let (Some(parent), Some(child)) =
        (read_task_ids(parent, &layout), read_task_ids(child, &layout))
    else {
        return 0;
    };
    // thread creation keeps the tgid
    if parent.tgid != child.tgid && membership::on_fork(&KERNEL, parent.tgid, child.tgid) {
        info!(&ctx, "following child group {} of {}", child.tgid, parent.tgid);
    }
    0
}

#[btf_tracepoint(function = "sched_process_exit")]
pub fn sched_process_exit(ctx: BtfTracePointContext) -> i32 {
    let layout = load_layout();
    let task = unsafe { ctx.arg::<*const TaskStruct>(0) };
    let Some(task) = read_task_ids(task, &layout) else {
        return 0;
    };
    if membership::on_exit(&KERNEL, task) {
        debug!(&ctx, "group {} exited", task.tgid);
    }
    0
}

// =============================================================================
// FUTEX
// =============================================================================

#[tracepoint(category = "syscalls", name = "sys_enter_futex")]
pub fn sys_enter_futex(ctx: TracePointContext) -> u32 {
    let task = current_task();
    let uaddr = unsafe { ctx.read_at::<u64>(SYS_ENTER_FUTEX_UADDR_OFFSET) };
    let op = unsafe { ctx.read_at::<u64>(SYS_ENTER_FUTEX_OP_OFFSET) };
    if let (Ok(uaddr), Ok(op)) = (uaddr, op) {
        futex::on_op(&KERNEL, task.tid, uaddr, op as u32);
    }
    futex::on_enter(&KERNEL, &KernelClock, task);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_futex")]
pub fn sys_exit_futex(_ctx: TracePointContext) -> u32 {
    futex::on_exit(&KERNEL, &KernelClock, current_task());
    0
}

#[tracepoint(category = "syscalls", name = "sys_enter_futex_waitv")]
pub fn sys_enter_futex_waitv(_ctx: TracePointContext) -> u32 {
    futex::on_waitv_enter(&KERNEL, &KernelClock, current_task());
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_futex_waitv")]
pub fn sys_exit_futex_waitv(_ctx: TracePointContext) -> u32 {
    futex::on_waitv_exit(&KERNEL, &KernelClock, current_task());
    0
}

// =============================================================================
// FAULTS, BLOCK I/O, CACHE MISSES
// =============================================================================

#[tracepoint(category = "exceptions", name = "page_fault_user")]
pub fn page_fault_user(_ctx: TracePointContext) -> u32 {
    counters::on_user_fault(&KERNEL, current_task());
    0
}

#[tracepoint(category = "block", name = "block_rq_complete")]
pub fn block_rq_complete(ctx: TracePointContext) -> u32 {
    let Ok(sector) = (unsafe { ctx.read_at::<u64>(BLOCK_RQ_COMPLETE_SECTOR_OFFSET) }) else {
        return 0;
    };
    io::on_block_complete(&KERNEL, current_task().tgid, sector);
    0
}

#[perf_event]
pub fn llc_miss(_ctx: PerfEventContext) -> u32 {
    counters::on_llc_sample(&KERNEL, KernelClock.cpu(), current_task().tgid);
    0
}

// =============================================================================
// FILE-BACKED FAULT CAPTURE
// =============================================================================

#[kprobe(function = "filemap_fault")]
pub fn filemap_fault(ctx: ProbeContext) -> u32 {
    let Some(vmf) = ctx.arg::<*const u8>(0) else {
        return 0;
    };
    file_fault::on_file_fault(&KERNEL, &KernelClock, current_task(), || {
        resolve_file_page(vmf, &load_layout())
    });
    0
}

#[inline(always)]
fn resolve_file_page(vmf: *const u8, layout: &KernelLayout) -> Option<FilePage> {
    if !layout.file_chain_known() {
        return None;
    }
    let vma = read_ptr(vmf, layout.vm_fault_vma_offset)?;
    let pgoff: u64 = read_field(vmf, layout.vm_fault_pgoff_offset)?;
    let file = read_ptr(vma, layout.vma_vm_file_offset)?;
    let inode = read_ptr(file, layout.file_f_inode_offset)?;
    let ino: u64 = read_field(inode, layout.inode_i_ino_offset)?;
    let sb = read_ptr(inode, layout.inode_i_sb_offset)?;
    let sb_dev: u32 = read_field(sb, layout.super_block_s_dev_offset)?;
    Some(FilePage { sb_dev, ino, pgoff })
}

// =============================================================================
// CONNECTION TUNING
// =============================================================================

#[sock_ops]
pub fn tune_connection(ctx: SockOpsContext) -> u32 {
    if sock_ops_cb::wants_tuning(ctx.op()) {
        apply_connection_tuning(&ctx);
    }
    1
}

#[inline(always)]
fn apply_connection_tuning(ctx: &SockOpsContext) {
    let mut algorithm = CONGESTION_ALGORITHM;
    unsafe {
        bpf_setsockopt(
            ctx.ops as *mut _,
            SOL_TCP,
            TCP_CONGESTION,
            algorithm.as_mut_ptr() as *mut _,
            algorithm.len() as i32,
        );
    }
    for (level, name, value) in KEEPALIVE_OPTIONS {
        let mut value = value;
        unsafe {
            bpf_setsockopt(
                ctx.ops as *mut _,
                level,
                name,
                &mut value as *mut i32 as *mut _,
                size_of::<i32>() as i32,
            );
        }
    }
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
