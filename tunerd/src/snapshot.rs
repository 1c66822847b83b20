//! Periodic reads of the statistics tables.

use anyhow::{Context, anyhow};
use aya::Ebpf;
use aya::maps::{HashMap, MapData, MapError, PerCpuArray, PerCpuHashMap, PerCpuValues};
use aya::util::nr_cpus;
use serde::Serialize;
use std::collections::HashMap as StdHashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tuner_ebpf_common::{Agg, IoPattern, TaskStats};

use crate::host::HostMaps;
use crate::loader::{MAP_AGG, MAP_IO_PAT, MAP_LLC_MISS, MAP_TID_STATS, PodOf};
use crate::metrics::MetricsSnapshot;

/// Read access to the statistics tables, kernel or host.
pub trait StatsSource {
    /// Sums the per-CPU aggregate, then zeroes every partition.
    fn read_and_reset_agg(&mut self) -> anyhow::Result<Agg>;
    /// Per-CPU sum for one group; 0 when it never missed.
    fn llc_misses(&self, tgid: u32) -> anyhow::Result<u64>;
    /// `(seq, rnd)`; `(0, 0)` when the group has no completions.
    fn io_pattern(&self, tgid: u32) -> anyhow::Result<(u64, u64)>;
    fn thread_stats(&self) -> anyhow::Result<Vec<(u32, TaskStats)>>;
}

pub struct KernelStats {
    task_stats: HashMap<MapData, u32, PodOf<TaskStats>>,
    agg: PerCpuArray<MapData, PodOf<Agg>>,
    io_patterns: HashMap<MapData, u32, PodOf<IoPattern>>,
    llc_misses: PerCpuHashMap<MapData, u32, u64>,
}

fn take<T>(bpf: &mut Ebpf, name: &str) -> anyhow::Result<T>
where
    T: TryFrom<aya::maps::Map, Error = MapError>,
{
    let map = bpf
        .take_map(name)
        .ok_or_else(|| anyhow!("{name} map not found"))?;
    T::try_from(map).with_context(|| format!("{name} has an unexpected map type"))
}

impl KernelStats {
    pub fn take(bpf: &mut Ebpf) -> anyhow::Result<Self> {
        Ok(Self {
            task_stats: take(bpf, MAP_TID_STATS)?,
            agg: take(bpf, MAP_AGG)?,
            io_patterns: take(bpf, MAP_IO_PAT)?,
            llc_misses: take(bpf, MAP_LLC_MISS)?,
        })
    }
}

impl StatsSource for KernelStats {
    fn read_and_reset_agg(&mut self) -> anyhow::Result<Agg> {
        let values = self.agg.get(&0, 0).context("failed to read AGG")?;
        let total = values.iter().map(|v| v.0).fold(Agg::default(), Agg::merge);
        let cpus = nr_cpus().map_err(|(_, e)| e)?;
        let zeroed = PerCpuValues::try_from(vec![PodOf(Agg::default()); cpus])?;
        self.agg.set(0, zeroed, 0).context("failed to reset AGG")?;
        Ok(total)
    }

    fn llc_misses(&self, tgid: u32) -> anyhow::Result<u64> {
        match self.llc_misses.get(&tgid, 0) {
            Ok(values) => Ok(sum_per_cpu(values.iter().copied())),
            Err(MapError::KeyNotFound) => Ok(0),
            Err(e) => Err(e).context("failed to read LLC_MISS"),
        }
    }

    fn io_pattern(&self, tgid: u32) -> anyhow::Result<(u64, u64)> {
        match self.io_patterns.get(&tgid, 0) {
            Ok(pat) => Ok((pat.0.seq, pat.0.rnd)),
            Err(MapError::KeyNotFound) => Ok((0, 0)),
            Err(e) => Err(e).context("failed to read IO_PAT"),
        }
    }

    fn thread_stats(&self) -> anyhow::Result<Vec<(u32, TaskStats)>> {
        let mut out = Vec::new();
        for entry in self.task_stats.iter() {
            // entries can vanish between key and value reads
            match entry {
                Ok((tid, stats)) => out.push((tid, stats.0)),
                Err(MapError::KeyNotFound) => continue,
                Err(e) => return Err(e).context("failed to iterate TID_STATS"),
            }
        }
        Ok(out)
    }
}

impl StatsSource for HostMaps {
    fn read_and_reset_agg(&mut self) -> anyhow::Result<Agg> {
        Ok(HostMaps::read_and_reset_agg(self))
    }

    fn llc_misses(&self, tgid: u32) -> anyhow::Result<u64> {
        Ok(self.llc_misses_for(tgid))
    }

    fn io_pattern(&self, tgid: u32) -> anyhow::Result<(u64, u64)> {
        Ok(self.io_pattern_for(tgid))
    }

    fn thread_stats(&self) -> anyhow::Result<Vec<(u32, TaskStats)>> {
        Ok(self.task_stats.entries())
    }
}

pub fn sum_per_cpu(values: impl IntoIterator<Item = u64>) -> u64 {
    values.into_iter().fold(0u64, u64::saturating_add)
}

/// Statistics of one process group, merged over its threads.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct GroupSummary {
    pub tgid: u32,
    /// Threads with a statistics entry.
    pub threads: usize,
    /// Mean of the nonzero per-thread run-queue EWMAs.
    pub mean_runq_us: u64,
    pub max_runq_us: u64,
    pub max_futex_us: u64,
    pub page_faults: u64,
    pub total_oncpu_us: u64,
    pub llc_misses: u64,
    pub io_seq: u64,
    pub io_rnd: u64,
}

/// Merges the entries of `tids` found in `stats`.
pub fn group_summary(
    tgid: u32,
    tids: &[u32],
    stats: &StdHashMap<u32, TaskStats>,
) -> GroupSummary {
    let mut summary = GroupSummary {
        tgid,
        ..GroupSummary::default()
    };
    let mut runq_sum = 0u64;
    let mut runq_samples = 0u64;
    for s in tids.iter().filter_map(|tid| stats.get(tid)) {
        summary.threads += 1;
        if s.ewma_runq_us > 0 {
            runq_sum = runq_sum.saturating_add(s.ewma_runq_us);
            runq_samples += 1;
        }
        summary.max_runq_us = summary.max_runq_us.max(s.ewma_runq_us);
        summary.max_futex_us = summary.max_futex_us.max(s.ewma_futex_us);
        summary.page_faults = summary.page_faults.saturating_add(s.page_faults);
        summary.total_oncpu_us = summary.total_oncpu_us.saturating_add(s.total_oncpu_us);
    }
    if runq_samples > 0 {
        summary.mean_runq_us = runq_sum / runq_samples;
    }
    summary
}

/// Thread ids of a live group; empty once it has exited.
pub fn tids_of(tgid: u32) -> Vec<u32> {
    let Ok(process) = procfs::process::Process::new(tgid as i32) else {
        return Vec::new();
    };
    let Ok(tasks) = process.tasks() else {
        return Vec::new();
    };
    tasks.flatten().map(|task| task.tid as u32).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub seq: u64,
    pub ts_ms: u64,
    pub agg: Agg,
    pub threads_tracked: usize,
    pub groups: Vec<GroupSummary>,
    pub metrics: MetricsSnapshot,
}

/// Reads every table once. `groups` pairs each tgid with its thread ids.
pub fn collect<S: StatsSource>(
    source: &mut S,
    seq: u64,
    groups: &[(u32, Vec<u32>)],
    metrics: MetricsSnapshot,
) -> anyhow::Result<Snapshot> {
    let agg = source.read_and_reset_agg()?;
    let stats: StdHashMap<u32, TaskStats> = source.thread_stats()?.into_iter().collect();
    let mut summaries = Vec::with_capacity(groups.len());
    for (tgid, tids) in groups {
        let mut summary = group_summary(*tgid, tids, &stats);
        summary.llc_misses = source.llc_misses(*tgid)?;
        (summary.io_seq, summary.io_rnd) = source.io_pattern(*tgid)?;
        summaries.push(summary);
    }
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Ok(Snapshot {
        seq,
        ts_ms,
        agg,
        threads_tracked: stats.len(),
        groups: summaries,
        metrics,
    })
}

/// Appends `snapshot` as one JSON line.
pub async fn append_ndjson(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut line = serde_json::to_vec(snapshot)?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open snapshot file {}", path.display()))?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuner_ebpf_common::engine::{PerCpuSlot, PerCpuTable, Table};

    fn stats(runq: u64, futex: u64, faults: u64, oncpu: u64) -> TaskStats {
        TaskStats {
            ewma_runq_us: runq,
            ewma_futex_us: futex,
            page_faults: faults,
            total_oncpu_us: oncpu,
            ..TaskStats::default()
        }
    }

    #[test]
    fn summary_merges_only_the_groups_threads() {
        let table = StdHashMap::from([
            (100, stats(40, 7, 3, 1000)),
            (101, stats(0, 9, 2, 500)),
            (102, stats(20, 1, 1, 250)),
            (200, stats(999, 999, 999, 999)),
        ]);
        let s = group_summary(100, &[100, 101, 102, 103], &table);
        assert_eq!(s.threads, 3);
        assert_eq!(s.mean_runq_us, 30);
        assert_eq!(s.max_runq_us, 40);
        assert_eq!(s.max_futex_us, 9);
        assert_eq!(s.page_faults, 6);
        assert_eq!(s.total_oncpu_us, 1750);
    }

    #[test]
    fn summary_of_unknown_group_is_empty() {
        let s = group_summary(7, &[7], &StdHashMap::new());
        assert_eq!(
            s,
            GroupSummary {
                tgid: 7,
                ..GroupSummary::default()
            }
        );
    }

    #[test]
    fn per_cpu_sum_saturates() {
        assert_eq!(sum_per_cpu([1, 2, 3]), 6);
        assert_eq!(sum_per_cpu([u64::MAX, 1]), u64::MAX);
        assert_eq!(sum_per_cpu([]), 0);
    }

    #[test]
    fn collect_reads_and_resets_host_tables() {
        let mut maps = HostMaps::new(2);
        maps.agg.modify_local(0, |a| a.futex_us += 5);
        maps.agg.modify_local(1, |a| a.futex_us += 7);
        maps.task_stats.upsert(&10, &stats(12, 0, 4, 80));
        maps.llc_misses.insert_local(0, &10, &3);
        maps.llc_misses.insert_local(1, &10, &4);

        let snap = collect(&mut maps, 1, &[(10, vec![10])], MetricsSnapshot::default()).unwrap();
        assert_eq!(snap.agg.futex_us, 12);
        assert_eq!(snap.threads_tracked, 1);
        assert_eq!(snap.groups[0].llc_misses, 7);
        assert_eq!(snap.groups[0].page_faults, 4);
        assert_eq!((snap.groups[0].io_seq, snap.groups[0].io_rnd), (0, 0));

        let again = collect(&mut maps, 2, &[], MetricsSnapshot::default()).unwrap();
        assert_eq!(again.agg, Agg::default());
    }

    #[tokio::test]
    async fn snapshots_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/snapshots.ndjson");
        let mut maps = HostMaps::new(1);
        for seq in 1..=2 {
            let snap = collect(&mut maps, seq, &[], MetricsSnapshot::default()).unwrap();
            append_ndjson(&path, &snap).await.unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["seq"], 2);
        assert_eq!(lines[0]["agg"]["futex_us"], 0);
    }
}
