use anyhow::{Context, Result};
use std::process::Command;

const BPF_PACKAGE: &str = "tuner-ebpf-ebpf";
const BPF_TARGET: &str = "bpfel-unknown-none";
const DEFAULT_BPF_TOOLCHAIN: &str = "nightly-2024-12-10";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: cargo xtask <command>");
        eprintln!("Commands:");
        eprintln!("  build-ebpf    Build the probe object");
        eprintln!("  build         Build the probe object, then tunerd");
        std::process::exit(1);
    }

    match args[1].as_str() {
        "build-ebpf" => build_ebpf(),
        "build" => {
            build_ebpf()?;
            build_daemon()
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            std::process::exit(1);
        }
    }
}

/// The probe crate needs a nightly with build-std; TUNER_BPF_TOOLCHAIN
/// overrides the pinned one.
fn build_ebpf() -> Result<()> {
    let toolchain = std::env::var("TUNER_BPF_TOOLCHAIN")
        .unwrap_or_else(|_| DEFAULT_BPF_TOOLCHAIN.to_string());
    let status = Command::new("cargo")
        .args([
            "build",
            "--package",
            BPF_PACKAGE,
            "--release",
            "--target",
            BPF_TARGET,
            "-Z",
            "build-std=core",
        ])
        .env("RUSTUP_TOOLCHAIN", &toolchain)
        .status()
        .context("Failed to execute cargo build for eBPF")?;

    if !status.success() {
        anyhow::bail!("eBPF build failed with exit code: {}", status);
    }

    println!("probe object built: target/{BPF_TARGET}/release/{BPF_PACKAGE}");
    Ok(())
}

fn build_daemon() -> Result<()> {
    let status = Command::new("cargo")
        .args(["build", "--package", "tunerd", "--release"])
        .status()
        .context("Failed to execute cargo build for tunerd")?;

    if !status.success() {
        anyhow::bail!("tunerd build failed with exit code: {}", status);
    }
    Ok(())
}
