//! Synthetic workload replayed through the probe engine on host tables.
//!
//! Useful without privileges: the same engine functions the kernel hooks call
//! run against [`HostMaps`], and the channels are drained through the same
//! dispatch path as the ring buffer listeners.

use anyhow::Context;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tuner_ebpf_common::TunerConfig;
use tuner_ebpf_common::engine::file_fault::FilePage;
use tuner_ebpf_common::engine::{TaskIds, counters, file_fault, futex, io, membership, sched};

use crate::control::{Membership, seed_targets};
use crate::host::{HostMaps, ManualClock, RecordRing};
use crate::metrics::{ChannelKind, Metrics};
use crate::runtime::dispatch;
use crate::snapshot::{self, Snapshot};

const FIRST_TGID: u32 = 1000;
const GROUP_STRIDE: u32 = 100;
/// Group that is never seeded; every event it produces must be filtered.
const OUTSIDER_TGID: u32 = 9000;
const FIRST_CHILD_TGID: u32 = 20_000;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub groups: u32,
    pub threads_per_group: u32,
    pub cpus: u32,
    pub steps: u32,
    pub seed: u64,
    pub rate_cap: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            groups: 2,
            threads_per_group: 4,
            cpus: 4,
            steps: 20_000,
            seed: 0x5eed,
            rate_cap: 0,
        }
    }
}

struct Workload {
    rng: StdRng,
    tasks: Vec<TaskIds>,
    running: Vec<TaskIds>,
    sectors: Vec<u64>,
    next_child: u32,
    children: Vec<u32>,
}

impl Workload {
    fn new(cfg: &SimulationConfig) -> Self {
        let mut tasks = Vec::new();
        for g in 0..cfg.groups {
            let tgid = FIRST_TGID + g * GROUP_STRIDE;
            for t in 0..cfg.threads_per_group.max(1) {
                tasks.push(TaskIds::new(tgid, tgid + t));
            }
        }
        tasks.push(TaskIds::new(OUTSIDER_TGID, OUTSIDER_TGID));
        Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            sectors: vec![0; tasks.len()],
            tasks,
            running: vec![TaskIds::default(); cfg.cpus.max(1) as usize],
            next_child: FIRST_CHILD_TGID,
            children: Vec::new(),
        }
    }

    fn pick(&mut self) -> (usize, TaskIds) {
        let idx = self.rng.gen_range(0..self.tasks.len());
        (idx, self.tasks[idx])
    }

    fn step(&mut self, maps: &HostMaps, clock: &ManualClock) {
        let cpu = self.rng.gen_range(0..self.running.len());
        clock.set_cpu(cpu as u32);
        clock.advance(self.rng.gen_range(1_000..50_000));

        match self.rng.gen_range(0..100) {
            0..=39 => {
                let (_, wakee) = self.pick();
                let waker = self.running[cpu];
                sched::on_wake(maps, clock, waker.tid, wakee.tid);
                clock.advance(self.rng.gen_range(500..400_000));
                sched::on_switch(maps, clock, waker, wakee);
                self.running[cpu] = wakee;
            }
            40..=59 => {
                let (_, task) = self.pick();
                futex::on_op(maps, task.tid, 0x7f00_0000 + u64::from(task.tid) * 8, 0);
                futex::on_enter(maps, clock, task);
                clock.advance(self.wait_ns());
                futex::on_exit(maps, clock, task);
            }
            60..=64 => {
                let (_, task) = self.pick();
                futex::on_waitv_enter(maps, clock, task);
                clock.advance(self.wait_ns());
                futex::on_waitv_exit(maps, clock, task);
            }
            65..=74 => {
                let (_, task) = self.pick();
                counters::on_user_fault(maps, task);
            }
            75..=84 => {
                let (idx, task) = self.pick();
                let sector = if self.rng.gen_bool(0.7) {
                    self.sectors[idx] + self.rng.gen_range(8..64)
                } else {
                    self.rng.gen_range(0..1 << 30)
                };
                self.sectors[idx] = sector;
                io::on_block_complete(maps, task.tgid, sector);
            }
            85..=92 => {
                let (_, task) = self.pick();
                counters::on_llc_sample(maps, cpu as u32, task.tgid);
            }
            93..=97 => {
                let (_, task) = self.pick();
                let pgoff = self.rng.gen_range(0..4096);
                file_fault::on_file_fault(maps, clock, task, || {
                    Some(FilePage {
                        sb_dev: 0x803,
                        ino: u64::from(task.tgid),
                        pgoff,
                    })
                });
            }
            _ => self.fork_or_exit(maps),
        }
    }

    /// Futex waits cluster around a few hundred µs with a long tail.
    fn wait_ns(&mut self) -> u64 {
        if self.rng.gen_bool(0.05) {
            self.rng.gen_range(5_000_000..20_000_000)
        } else {
            self.rng.gen_range(1_000..800_000)
        }
    }

    fn fork_or_exit(&mut self, maps: &HostMaps) {
        if !self.children.is_empty() && self.rng.gen_bool(0.5) {
            let idx = self.rng.gen_range(0..self.children.len());
            let child = self.children.swap_remove(idx);
            membership::on_exit(maps, TaskIds::new(child, child));
            return;
        }
        let (_, parent) = self.pick();
        let child = self.next_child;
        self.next_child += 1;
        if membership::on_fork(maps, parent.tgid, child) {
            self.children.push(child);
        }
    }

    /// `(tgid, tids)` for every seeded group.
    fn groups(&self) -> Vec<(u32, Vec<u32>)> {
        let mut out: Vec<(u32, Vec<u32>)> = Vec::new();
        for task in self.tasks.iter().filter(|t| t.tgid != OUTSIDER_TGID) {
            match out.iter_mut().find(|(tgid, _)| *tgid == task.tgid) {
                Some((_, tids)) => tids.push(task.tid),
                None => out.push((task.tgid, vec![task.tid])),
            }
        }
        out
    }
}

fn drain(ring: &RecordRing, channel: ChannelKind, metrics: &Metrics, rate_cap: u64) -> usize {
    let n = ring.drain(|rec| {
        dispatch(channel, rec, metrics, rate_cap);
    });
    if n == 0 {
        metrics.inc_empty_poll();
    }
    n
}

/// Runs the workload and returns the final snapshot.
pub fn run(
    cfg: &SimulationConfig,
    tuner: TunerConfig,
    metrics: &Metrics,
) -> anyhow::Result<Snapshot> {
    let mut maps = HostMaps::new(cfg.cpus.max(1));
    maps.write_config(tuner)?;

    let mut workload = Workload::new(cfg);
    let roots: Vec<u32> = workload.groups().iter().map(|(tgid, _)| *tgid).collect();
    seed_targets(&mut maps, &roots, &[], tuner.follows_descendants())
        .context("failed to seed simulated groups")?;

    let clock = ManualClock::new(1_000_000_000);
    let drain_every = 512;
    for step in 0..cfg.steps {
        workload.step(&maps, &clock);
        if step % drain_every == drain_every - 1 {
            drain(&maps.comm_events, ChannelKind::Comm, metrics, cfg.rate_cap);
            drain(&maps.events, ChannelKind::Events, metrics, cfg.rate_cap);
            drain(&maps.prefetch_events, ChannelKind::Prefetch, metrics, cfg.rate_cap);
            metrics.rollup();
        }
    }
    drain(&maps.comm_events, ChannelKind::Comm, metrics, cfg.rate_cap);
    drain(&maps.events, ChannelKind::Events, metrics, cfg.rate_cap);
    drain(&maps.prefetch_events, ChannelKind::Prefetch, metrics, cfg.rate_cap);

    let dropped =
        maps.comm_events.dropped() + maps.events.dropped() + maps.prefetch_events.dropped();
    info!(
        "[simulate] {} steps, {} live children, {} records dropped",
        cfg.steps,
        workload.children.len(),
        dropped
    );

    snapshot::collect(
        &mut maps,
        metrics.inc_snapshot(),
        &workload.groups(),
        metrics.snapshot(),
    )
}
