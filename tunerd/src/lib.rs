pub mod bpf_config;
pub mod config;
pub mod control;
pub mod host;
pub mod loader;
pub mod metrics;
pub mod runtime;
pub mod simulate;
pub mod snapshot;

pub use config::{Config, LoggingConfig, ProbesConfig, RuntimeConfig};
pub use metrics::Metrics;
