//! Membership seeding and probe configuration.

use anyhow::{Context, anyhow};
use aya::Ebpf;
use aya::maps::{Array, HashMap, MapData};
use log::{debug, info};
use std::collections::{BTreeSet, VecDeque};
use tuner_ebpf_common::TunerConfig;

use crate::host::HostMaps;
use crate::loader::{MAP_TARGET_TGIDS, MAP_TUNER_CFG, PodOf};

/// Where the monitored set lives.
pub trait Membership {
    fn add(&mut self, tgid: u32) -> anyhow::Result<()>;
    fn remove(&mut self, tgid: u32) -> anyhow::Result<()>;
    fn list(&self) -> anyhow::Result<Vec<u32>>;
    fn write_config(&mut self, cfg: TunerConfig) -> anyhow::Result<()>;
}

/// Handles to the kernel membership table and config slot.
pub struct KernelControl {
    targets: HashMap<MapData, u32, u8>,
    config: Array<MapData, PodOf<TunerConfig>>,
}

impl KernelControl {
    pub fn take(bpf: &mut Ebpf) -> anyhow::Result<Self> {
        let targets = HashMap::try_from(
            bpf.take_map(MAP_TARGET_TGIDS)
                .ok_or_else(|| anyhow!("{MAP_TARGET_TGIDS} map not found"))?,
        )?;
        let config = Array::try_from(
            bpf.take_map(MAP_TUNER_CFG)
                .ok_or_else(|| anyhow!("{MAP_TUNER_CFG} map not found"))?,
        )?;
        Ok(Self { targets, config })
    }
}

impl Membership for KernelControl {
    fn add(&mut self, tgid: u32) -> anyhow::Result<()> {
        self.targets
            .insert(tgid, 1u8, 0)
            .with_context(|| format!("failed to add tgid {tgid} to {MAP_TARGET_TGIDS}"))
    }

    fn remove(&mut self, tgid: u32) -> anyhow::Result<()> {
        self.targets
            .remove(&tgid)
            .with_context(|| format!("failed to remove tgid {tgid} from {MAP_TARGET_TGIDS}"))
    }

    fn list(&self) -> anyhow::Result<Vec<u32>> {
        let mut out = Vec::new();
        for key in self.targets.keys() {
            out.push(key?);
        }
        Ok(out)
    }

    fn write_config(&mut self, cfg: TunerConfig) -> anyhow::Result<()> {
        self.config
            .set(0, PodOf(cfg), 0)
            .context("failed to write probe config")
    }
}

impl Membership for HostMaps {
    fn add(&mut self, tgid: u32) -> anyhow::Result<()> {
        if self.seed(tgid) {
            Ok(())
        } else {
            Err(anyhow!("membership table full, tgid {tgid} not added"))
        }
    }

    fn remove(&mut self, tgid: u32) -> anyhow::Result<()> {
        self.clear(tgid);
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<u32>> {
        Ok(self.members.keys())
    }

    fn write_config(&mut self, cfg: TunerConfig) -> anyhow::Result<()> {
        self.set_config(cfg);
        Ok(())
    }
}

/// `(pid, ppid)` for every live process.
pub fn process_tree() -> anyhow::Result<Vec<(u32, u32)>> {
    let mut tree = Vec::new();
    for process in procfs::process::all_processes().context("failed to list /proc")? {
        // processes exit while we walk
        let Ok(process) = process else { continue };
        let Ok(stat) = process.stat() else { continue };
        tree.push((stat.pid as u32, stat.ppid as u32));
    }
    Ok(tree)
}

/// Every process below `root` in `tree`, not including `root`.
pub fn descendants_of(root: u32, tree: &[(u32, u32)]) -> Vec<u32> {
    let mut found = BTreeSet::new();
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        for &(pid, ppid) in tree {
            if ppid == parent && pid != root && found.insert(pid) {
                queue.push_back(pid);
            }
        }
    }
    found.into_iter().collect()
}

/// Seeds `roots` and, when following descendants, the processes already
/// running beneath them; the fork hook only sees children created later.
pub fn seed_targets<M: Membership>(
    store: &mut M,
    roots: &[u32],
    tree: &[(u32, u32)],
    follow_descendants: bool,
) -> anyhow::Result<usize> {
    let mut seeded = BTreeSet::new();
    for &root in roots {
        seeded.insert(root);
        if follow_descendants {
            seeded.extend(descendants_of(root, tree));
        }
    }
    for &tgid in &seeded {
        store.add(tgid)?;
        debug!("[tunerd] seeded tgid {tgid}");
    }
    info!("[tunerd] monitoring {} process group(s)", seeded.len());
    Ok(seeded.len())
}

/// The membership table is pinned, so groups from an earlier run can linger
/// after their exit went unobserved. Drops every tgid not in `tree`.
pub fn prune_stale<M: Membership>(store: &mut M, tree: &[(u32, u32)]) -> anyhow::Result<usize> {
    let alive: BTreeSet<u32> = tree.iter().map(|&(pid, _)| pid).collect();
    let mut pruned = 0;
    for tgid in store.list()? {
        if !alive.contains(&tgid) {
            store.remove(tgid)?;
            pruned += 1;
        }
    }
    if pruned > 0 {
        info!("[tunerd] pruned {pruned} stale tgid(s) from {MAP_TARGET_TGIDS}");
    }
    Ok(pruned)
}
