use anyhow::{Context, anyhow};
use aya::maps::ring_buf::RingBuf;
use caps::{CapSet, Capability};
use clap::Parser;
use log::{info, warn};
use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use tunerd::bpf_config::derive_kernel_layout;
use tunerd::config::Config;
use tunerd::control::{KernelControl, Membership, process_tree, prune_stale, seed_targets};
use tunerd::loader::{self, MAP_COMM_EVENTS, MAP_EVENTS, MAP_PREFETCH_EVENTS};
use tunerd::metrics::{ChannelKind, Metrics};
use tunerd::runtime::start_ring_listener;
use tunerd::simulate::{self, SimulationConfig};
use tunerd::snapshot::{self, KernelStats, tids_of};

/// Spawn background tasks for metrics collection and logging.
fn spawn_metrics_tasks(metrics: Arc<Metrics>) {
    // Roll up records/s every second
    {
        let metrics_clone = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                metrics_clone.rollup();
            }
        });
    }

    // Log metrics summary every 10 seconds
    {
        let metrics_clone = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let snap = metrics_clone.snapshot();
                log::debug!(
                    "metrics: records/s={} decode_failures={} rate_limited={} empty_polls={}",
                    snap.records_per_sec,
                    snap.decode_failures,
                    snap.rate_limited,
                    snap.empty_polls
                );
            }
        });
    }
}

#[derive(Parser, Debug)]
#[command(name = "tunerd")]
#[command(about = "Membership-scoped kernel telemetry daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", env = "TUNER_CONFIG")]
    config: Option<PathBuf>,
    /// Process group to monitor; repeatable
    #[arg(long = "pid", value_name = "PID")]
    pids: Vec<u32>,
    /// Follow children of monitored groups, including ones already running
    #[arg(long)]
    with_descendants: bool,
    /// Suppress wake and futex-op records
    #[arg(long)]
    quiet_comm: bool,
    /// Attach the connection tuner to the configured cgroup
    #[arg(long)]
    attach_sockops: bool,
    /// Snapshot period
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,
    /// Load and attach, then exit
    #[arg(long)]
    dry_run: bool,
    /// Replay a synthetic workload through the probe logic instead of loading it
    #[arg(long)]
    simulate: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if self.with_descendants {
            config.probes.follow_descendants = true;
        }
        if self.quiet_comm {
            config.probes.quiet_comm = true;
        }
        if self.attach_sockops {
            config.probes.attach_sockops = true;
        }
        if let Some(ms) = self.interval_ms {
            config.runtime.interval_ms = ms;
        }
    }
}

fn check_capabilities() -> anyhow::Result<()> {
    if std::env::var("TUNER_SKIP_CAP_CHECK").is_ok() {
        warn!("Skipping capability check (TUNER_SKIP_CAP_CHECK set)");
        return Ok(());
    }

    let has_bpf = caps::has_cap(None, CapSet::Effective, Capability::CAP_BPF)
        .context("failed to query CAP_BPF")?;
    let has_perfmon = caps::has_cap(None, CapSet::Effective, Capability::CAP_PERFMON)
        .context("failed to query CAP_PERFMON")?;

    if has_bpf && has_perfmon {
        info!("Running with CAP_BPF + CAP_PERFMON");
        return Ok(());
    }

    eprintln!("\nERROR: Missing required capabilities CAP_BPF and CAP_PERFMON");
    eprintln!("\nFix:");
    eprintln!("  sudo setcap cap_bpf,cap_perfmon,cap_net_admin=ep $(which tunerd)");
    eprintln!("\nRequires: Linux 5.8+ with BTF support (/sys/kernel/btf/vmlinux)\n");

    anyhow::bail!("missing CAP_BPF and CAP_PERFMON")
}

fn check_kernel_version(min_major: u32, min_minor: u32) -> anyhow::Result<()> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("failed to read /proc/sys/kernel/osrelease")?;
    let version =
        parse_kernel_version(&release).context("unable to parse kernel release string")?;

    if version < (min_major, min_minor) {
        anyhow::bail!(
            "kernel {}.{} lacks required eBPF support (need >= {}.{})",
            version.0,
            version.1,
            min_major,
            min_minor
        );
    }
    Ok(())
}

fn ensure_environment() -> anyhow::Result<()> {
    check_capabilities()?;
    check_kernel_version(5, 8)?;
    Ok(())
}

fn parse_kernel_version(raw: &str) -> Option<(u32, u32)> {
    let version_part = raw.trim().split('-').next()?;
    let mut segments = version_part.split('.');
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

fn run_simulation(config: &Config) -> anyhow::Result<()> {
    let metrics = Metrics::new();
    let sim = SimulationConfig {
        rate_cap: config.runtime.events_rate_cap,
        ..SimulationConfig::default()
    };
    let snap = simulate::run(&sim, config.probes.tuner_config(), &metrics)?;
    println!("{}", serde_json::to_string_pretty(&snap)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    args.apply(&mut config);

    if args.simulate {
        return run_simulation(&config);
    }

    info!("[tunerd] Starting telemetry daemon...");
    ensure_environment()?;

    let derived = derive_kernel_layout().context("unable to derive kernel offsets from BTF")?;
    if let Some(reason) = &derived.file_chain_error {
        warn!("[tunerd] file fault offsets unavailable ({reason}); prefetch capture disabled");
    }

    let mut probes = loader::load(&config.probes, derived.layout, &config.runtime.pin_path)?;
    info!(
        "[tunerd] probes attached: {}; skipped: {}",
        probes.report.attached.join(","),
        probes.report.skipped.join(",")
    );

    let mut control = KernelControl::take(&mut probes.bpf)?;
    control.write_config(config.probes.tuner_config())?;

    let tree = process_tree()?;
    prune_stale(&mut control, &tree)?;
    seed_targets(
        &mut control,
        &args.pids,
        &tree,
        config.probes.tuner_config().follows_descendants(),
    )?;

    if args.dry_run {
        println!("{}", serde_json::to_string(&probes.report)?);
        return Ok(());
    }

    let metrics = Arc::new(Metrics::new());
    spawn_metrics_tasks(Arc::clone(&metrics));

    for (name, channel) in [
        (MAP_COMM_EVENTS, ChannelKind::Comm),
        (MAP_EVENTS, ChannelKind::Events),
        (MAP_PREFETCH_EVENTS, ChannelKind::Prefetch),
    ] {
        let map = probes
            .bpf
            .take_map(name)
            .ok_or_else(|| anyhow!("{name} map not found"))?;
        let ring = RingBuf::try_from(map)?;
        start_ring_listener(
            ring,
            channel,
            Arc::clone(&metrics),
            config.runtime.events_rate_cap,
            Duration::from_millis(config.runtime.poll_ms.max(1)),
        );
    }

    let mut stats = KernelStats::take(&mut probes.bpf)?;
    let mut interval =
        tokio::time::interval(Duration::from_millis(config.runtime.interval_ms.max(1)));
    let snapshot_file = config.logging.snapshot_file.clone();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[tunerd] shutting down; {} stays pinned", config.runtime.pin_path.display());
                break;
            }
            _ = interval.tick() => {
                let groups: Vec<(u32, Vec<u32>)> = match control.list() {
                    Ok(tgids) => tgids.into_iter().map(|tgid| (tgid, tids_of(tgid))).collect(),
                    Err(err) => {
                        warn!("[tunerd] membership read failed: {err:#}");
                        continue;
                    }
                };
                let snap = match snapshot::collect(
                    &mut stats,
                    metrics.inc_snapshot(),
                    &groups,
                    metrics.snapshot(),
                ) {
                    Ok(snap) => snap,
                    Err(err) => {
                        warn!("[tunerd] snapshot failed: {err:#}");
                        continue;
                    }
                };
                info!(
                    "[snapshot] seq={} groups={} threads={} futex_us={}",
                    snap.seq,
                    snap.groups.len(),
                    snap.threads_tracked,
                    snap.agg.futex_us
                );
                if let Some(path) = &snapshot_file
                    && let Err(err) = snapshot::append_ndjson(path, &snap).await
                {
                    warn!("[tunerd] snapshot write failed ({}): {err:#}", path.display());
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_version_parses_distro_suffixes() {
        assert_eq!(parse_kernel_version("6.8.0-45-generic\n"), Some((6, 8)));
        assert_eq!(parse_kernel_version("5"), Some((5, 0)));
        assert_eq!(parse_kernel_version("garbage"), None);
    }

    #[test]
    fn cli_flags_override_config() {
        let args = Args::parse_from([
            "tunerd",
            "--pid",
            "42",
            "--pid",
            "43",
            "--with-descendants",
            "--quiet-comm",
            "--interval-ms",
            "250",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(args.pids, vec![42, 43]);
        assert!(config.probes.follow_descendants);
        assert!(config.probes.quiet_comm);
        assert!(!config.probes.attach_sockops);
        assert_eq!(config.runtime.interval_ms, 250);

        let tuner = config.probes.tuner_config();
        assert!(tuner.follows_descendants());
        assert!(!tuner.comm_enabled());
    }
}
