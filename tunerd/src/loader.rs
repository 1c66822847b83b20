//! Locates the probe object, loads it with the discovered kernel layout and
//! attaches every hook the configuration asks for.

use anyhow::{Context, anyhow};
use aya::programs::{
    BtfTracePoint, CgroupAttachMode, KProbe, PerfEvent, SockOps, TracePoint, perf_event,
};
use aya::util::online_cpus;
use aya::{Ebpf, EbpfLoader, Pod};
use aya_log::EbpfLogger;
use log::{info, warn};
use std::fs;
use std::path::Path;
use tuner_ebpf_common::KernelLayout;

use crate::config::ProbesConfig;

pub const MAP_TARGET_TGIDS: &str = "TARGET_TGIDS";
pub const MAP_TID_STATS: &str = "TID_STATS";
pub const MAP_AGG: &str = "AGG";
pub const MAP_IO_PAT: &str = "IO_PAT";
pub const MAP_LLC_MISS: &str = "LLC_MISS";
pub const MAP_TUNER_CFG: &str = "TUNER_CFG";
pub const MAP_COMM_EVENTS: &str = "COMM_EVENTS";
pub const MAP_EVENTS: &str = "EVENTS";
pub const MAP_PREFETCH_EVENTS: &str = "PREFETCH_EVENTS";

const ENV_BPF_PATH: &str = "TUNER_BPF_PATH";
const BPF_OBJECT_NAME: &str = "tuner-ebpf-ebpf";

/// Lets a shared-crate record cross into aya, which has its own `Pod`.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct PodOf<T>(pub T);

unsafe impl<T: bytemuck::Pod> Pod for PodOf<T> {}

pub struct LoadedProbes {
    pub bpf: Ebpf,
    _logger: Option<EbpfLogger>,
    pub report: AttachReport,
}

/// Which hooks ended up live.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct AttachReport {
    pub attached: Vec<String>,
    pub skipped: Vec<String>,
}

impl AttachReport {
    fn record(&mut self, name: &str, result: anyhow::Result<()>) {
        match result {
            Ok(()) => self.attached.push(name.to_string()),
            Err(err) => {
                warn!("[tunerd] optional probe {name} not attached: {err:?}");
                self.skipped.push(name.to_string());
            }
        }
    }

    fn disabled(&mut self, name: &str) {
        info!("[tunerd] probe {name} disabled by config");
        self.skipped.push(name.to_string());
    }
}

/// Generate search paths for the probe object in canonical order: installed
/// location first, then release builds relative to a few working directories.
fn bpf_search_paths(base_name: &str) -> Vec<String> {
    let mut paths = vec![
        format!("/usr/local/share/tuner/{base_name}"),
        format!("/usr/local/share/tuner/{base_name}.o"),
    ];
    for prefix in &["target", "./target", "../target", "../../target"] {
        paths.push(format!("{prefix}/bpfel-unknown-none/release/{base_name}"));
    }
    paths
}

/// `env_var` overrides every search path.
fn read_bpf_object(env_var: &str, base_name: &str) -> anyhow::Result<(Vec<u8>, String)> {
    if let Ok(path) = std::env::var(env_var) {
        let data = fs::read(&path)
            .with_context(|| format!("{env_var} points to {path}, but failed to read"))?;
        return Ok((data, path));
    }

    let candidates = bpf_search_paths(base_name);
    for candidate in &candidates {
        if Path::new(candidate).exists() {
            return Ok((fs::read(candidate)?, candidate.clone()));
        }
    }

    anyhow::bail!(
        "BPF object '{}' not found. Searched:\n  {}\n\nSet {} to specify custom location, or install to /usr/local/share/tuner/",
        base_name,
        candidates.join("\n  "),
        env_var
    )
}

fn attach_btf_tracepoint_internal(
    bpf: &mut Ebpf,
    btf: &aya::Btf,
    program: &str,
) -> anyhow::Result<()> {
    let tp: &mut BtfTracePoint = bpf
        .program_mut(program)
        .ok_or_else(|| anyhow!("{program} program not found"))?
        .try_into()?;
    tp.load(program, btf)?;
    tp.attach()?;
    Ok(())
}

fn attach_tracepoint_internal(
    bpf: &mut Ebpf,
    program: &str,
    category: &str,
    name: &str,
) -> anyhow::Result<()> {
    let tp: &mut TracePoint = bpf
        .program_mut(program)
        .ok_or_else(|| anyhow!("{program} program not found"))?
        .try_into()?;
    tp.load()?;
    tp.attach(category, name)?;
    Ok(())
}

fn attach_kprobe_internal(bpf: &mut Ebpf, program: &str, symbol: &str) -> anyhow::Result<()> {
    let probe: &mut KProbe = bpf
        .program_mut(program)
        .ok_or_else(|| anyhow!("{program} program not found"))?
        .try_into()?;
    probe.load()?;
    probe.attach(symbol, 0)?;
    Ok(())
}

/// One hardware cache-miss sampler per online CPU.
fn attach_llc_sampler(bpf: &mut Ebpf, sample_period: u64) -> anyhow::Result<()> {
    let program: &mut PerfEvent = bpf
        .program_mut("llc_miss")
        .ok_or_else(|| anyhow!("llc_miss program not found"))?
        .try_into()?;
    program.load()?;
    let cpus = online_cpus().map_err(|(_, e)| e)?;
    for cpu in &cpus {
        program.attach(
            perf_event::PerfTypeId::Hardware,
            perf_event::perf_hw_id::PERF_COUNT_HW_CACHE_MISSES as u64,
            perf_event::PerfEventScope::AllProcessesOneCpu { cpu: *cpu },
            perf_event::SamplePolicy::Period(sample_period.max(1)),
            false,
        )?;
    }
    info!(
        "[tunerd] LLC miss sampler attached to {} CPUs (period {sample_period})",
        cpus.len()
    );
    Ok(())
}

fn attach_sockops(bpf: &mut Ebpf, cgroup_path: &Path) -> anyhow::Result<()> {
    let program: &mut SockOps = bpf
        .program_mut("tune_connection")
        .ok_or_else(|| anyhow!("tune_connection program not found"))?
        .try_into()?;
    program.load()?;
    let cgroup = fs::File::open(cgroup_path)
        .with_context(|| format!("failed to open cgroup {}", cgroup_path.display()))?;
    program.attach(cgroup, CgroupAttachMode::Single)?;
    Ok(())
}

/// Loads the probe object and attaches hooks. The scheduler hooks are
/// required; everything else degrades to a warning.
/// Membership lifecycle programs to attach. Exit cleanup is always on.
fn lifecycle_hooks(probes: &ProbesConfig) -> &'static [&'static str] {
    if probes.follow_new {
        &["sched_process_fork", "sched_process_exit"]
    } else {
        &["sched_process_exit"]
    }
}

pub fn load(
    probes: &ProbesConfig,
    layout: KernelLayout,
    pin_path: &Path,
) -> anyhow::Result<LoadedProbes> {
    let (bytes, chosen_path) = read_bpf_object(ENV_BPF_PATH, BPF_OBJECT_NAME)?;
    info!("[tunerd] Using BPF object: {chosen_path}");

    fs::create_dir_all(pin_path)
        .with_context(|| format!("failed to create pin directory {}", pin_path.display()))?;

    let layout = PodOf(layout);
    let mut loader = EbpfLoader::new();
    loader.set_global("KERNEL_LAYOUT", &layout, true);
    loader.map_pin_path(pin_path);
    let mut bpf = loader
        .load(&bytes)
        .context("failed to load probe object")?;

    let logger = match EbpfLogger::init(&mut bpf) {
        Ok(logger) => {
            info!("[tunerd] BPF logger initialized.");
            Some(logger)
        }
        Err(e) => {
            warn!("[tunerd] BPF logger not active: {e}");
            None
        }
    };

    let btf = aya::Btf::from_sys_fs().context("kernel BTF unavailable for btf tracepoints")?;
    attach_btf_tracepoint_internal(&mut bpf, &btf, "sched_waking")?;
    attach_btf_tracepoint_internal(&mut bpf, &btf, "sched_switch")?;
    info!("[tunerd] Scheduler hooks attached.");

    let mut report = AttachReport {
        attached: vec!["sched_waking".into(), "sched_switch".into()],
        skipped: Vec::new(),
    };

    for &program in lifecycle_hooks(probes) {
        let result = attach_btf_tracepoint_internal(&mut bpf, &btf, program);
        report.record(program, result);
    }
    if !probes.follow_new {
        report.disabled("sched_process_fork");
    }

    for (program, category, name) in [
        ("sys_enter_futex", "syscalls", "sys_enter_futex"),
        ("sys_exit_futex", "syscalls", "sys_exit_futex"),
        ("sys_enter_futex_waitv", "syscalls", "sys_enter_futex_waitv"),
        ("sys_exit_futex_waitv", "syscalls", "sys_exit_futex_waitv"),
        ("page_fault_user", "exceptions", "page_fault_user"),
    ] {
        let result = attach_tracepoint_internal(&mut bpf, program, category, name);
        report.record(program, result);
    }

    if probes.enable_block_io {
        let result =
            attach_tracepoint_internal(&mut bpf, "block_rq_complete", "block", "block_rq_complete");
        report.record("block_rq_complete", result);
    } else {
        report.disabled("block_rq_complete");
    }

    if !probes.enable_prefetch {
        report.disabled("filemap_fault");
    } else if !layout.0.file_chain_known() {
        warn!("[tunerd] file fault offsets unknown; filemap_fault not attached");
        report.skipped.push("filemap_fault".into());
    } else {
        let result = attach_kprobe_internal(&mut bpf, "filemap_fault", "filemap_fault");
        report.record("filemap_fault", result);
    }

    if probes.enable_llc {
        let result = attach_llc_sampler(&mut bpf, probes.llc_sample_period);
        report.record("llc_miss", result);
    } else {
        report.disabled("llc_miss");
    }

    if probes.attach_sockops {
        let result = attach_sockops(&mut bpf, &probes.cgroup_path);
        report.record("tune_connection", result);
    } else {
        report.disabled("tune_connection");
    }

    Ok(LoadedProbes {
        bpf,
        _logger: logger,
        report,
    })
}
