use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use tuner_ebpf_common::{DEFAULT_FUTEX_SPIKE_US, TunerConfig};

const DEFAULT_CONFIG_PATH: &str = "/etc/tuner/tuner.toml";
const ENV_CONFIG_PATH: &str = "TUNER_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub probes: ProbesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden
    /// with the `TUNER_CONFIG` environment variable. If the file
    /// is missing or fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&PathBuf::from(path))
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("ignoring unparsable config {}: {err}", path.display());
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Snapshot period.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Back-off after a failed ring buffer readiness wait.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_pin_path")]
    pub pin_path: PathBuf,
    /// Correlation records logged per second before sampling kicks in.
    #[serde(default = "default_events_rate_cap")]
    pub events_rate_cap: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            poll_ms: default_poll_ms(),
            pin_path: default_pin_path(),
            events_rate_cap: default_events_rate_cap(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}
fn default_poll_ms() -> u64 {
    100
}
fn default_pin_path() -> PathBuf {
    PathBuf::from("/sys/fs/bpf/tuner")
}
fn default_events_rate_cap() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbesConfig {
    #[serde(default)]
    pub follow_descendants: bool,
    /// Attach the fork hook, so children forked while running can join
    /// when `follow_descendants` is set.
    #[serde(default = "default_true")]
    pub follow_new: bool,
    #[serde(default)]
    pub quiet_comm: bool,
    #[serde(default = "default_futex_spike_us")]
    pub futex_spike_us: u64,
    /// block_rq_complete layout differs across kernels; opt in.
    #[serde(default)]
    pub enable_block_io: bool,
    #[serde(default = "default_true")]
    pub enable_prefetch: bool,
    #[serde(default = "default_true")]
    pub enable_llc: bool,
    #[serde(default = "default_llc_sample_period")]
    pub llc_sample_period: u64,
    #[serde(default)]
    pub attach_sockops: bool,
    #[serde(default = "default_cgroup_path")]
    pub cgroup_path: PathBuf,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            follow_descendants: false,
            follow_new: default_true(),
            quiet_comm: false,
            futex_spike_us: default_futex_spike_us(),
            enable_block_io: false,
            enable_prefetch: default_true(),
            enable_llc: default_true(),
            llc_sample_period: default_llc_sample_period(),
            attach_sockops: false,
            cgroup_path: default_cgroup_path(),
        }
    }
}

impl ProbesConfig {
    /// Flags as the probes see them.
    pub fn tuner_config(&self) -> TunerConfig {
        TunerConfig {
            follow_descendants: self.follow_descendants as u32,
            quiet_comm: self.quiet_comm as u32,
            futex_spike_us: self.futex_spike_us,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_futex_spike_us() -> u64 {
    DEFAULT_FUTEX_SPIKE_US
}
fn default_llc_sample_period() -> u64 {
    10_000
}
fn default_cgroup_path() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Append each snapshot as one JSON line.
    #[serde(default)]
    pub snapshot_file: Option<PathBuf>,
}
