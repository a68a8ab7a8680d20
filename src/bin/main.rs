//! Headless CLI front-end for the firmware update engine (§6, §10.3).
//!
//! Drives a [`Coordinator`] run for one mode across every attached
//! gateway (or a single `--port` override), logging state transitions
//! and printing aggregate progress as it streams in. Exit code is `0`
//! on all-success, non-zero on any failure, matching the headless
//! contract external tooling (a GUI shell, a CI job) relies on.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use modi_fw_updater::catalog::ModuleType;
use modi_fw_updater::coordinator::{Coordinator, UpdateMode};
use modi_fw_updater::store::{FirmwareManifest, FirmwareStore};

/// Flash new firmware into MODI-style modules, network modules, or their ESP co-processor.
#[derive(Parser, Debug)]
#[command(name = "modi-fw-updater", version, about)]
struct Args {
    /// Which update operation to run across every discovered gateway.
    #[arg(long, value_enum)]
    mode: Mode,

    /// Path to the firmware manifest (`firmware_version.json`).
    ///
    /// Defaults to `<user_docs>/modi/module_firmware/firmware_version.json`.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Root directory the firmware store resolves binaries under.
    ///
    /// Defaults to `<user_docs>/modi/module_firmware`.
    #[arg(long)]
    store_root: Option<PathBuf>,

    /// Directory of bundled fallback assets used when `store_root` is missing a blob.
    #[arg(long, default_value = "assets")]
    assets: PathBuf,

    /// Explicit serial port path, bypassing gateway auto-enumeration.
    #[arg(long)]
    port: Option<String>,

    /// Target module type for `--mode change-type` (required only in that mode).
    #[arg(long, value_enum)]
    target_type: Option<CliModuleType>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all but error-level logging.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Mode {
    /// Discover and flash peripheral modules behind each gateway.
    Modules,
    /// Flash each gateway's own application MCU.
    Network,
    /// Put each gateway into bootloader-only mode and wait for it to reappear.
    NetworkBootloader,
    /// Run the ESP SLIP bootloader session on each gateway.
    Esp,
    /// Reset each gateway's ESP interpreter without a full flashing session.
    EspReset,
    /// Retarget discovered modules' uuids to `--target-type`.
    ChangeType,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum CliModuleType {
    Battery,
    Env,
    Imu,
    Mic,
    Button,
    Dial,
    Ultrasonic,
    Ir,
    Joystick,
    Tof,
    Camera,
    Display,
    Motor,
    Led,
    Speaker,
}

impl From<CliModuleType> for ModuleType {
    fn from(value: CliModuleType) -> Self {
        match value {
            CliModuleType::Battery => ModuleType::Battery,
            CliModuleType::Env => ModuleType::Env,
            CliModuleType::Imu => ModuleType::Imu,
            CliModuleType::Mic => ModuleType::Mic,
            CliModuleType::Button => ModuleType::Button,
            CliModuleType::Dial => ModuleType::Dial,
            CliModuleType::Ultrasonic => ModuleType::Ultrasonic,
            CliModuleType::Ir => ModuleType::Ir,
            CliModuleType::Joystick => ModuleType::Joystick,
            CliModuleType::Tof => ModuleType::Tof,
            CliModuleType::Camera => ModuleType::Camera,
            CliModuleType::Display => ModuleType::Display,
            CliModuleType::Motor => ModuleType::Motor,
            CliModuleType::Led => ModuleType::Led,
            CliModuleType::Speaker => ModuleType::Speaker,
        }
    }
}

fn default_docs_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|d| d.document_dir().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("modi")
        .join("module_firmware")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.quiet {
        log::LevelFilter::Error
    } else {
        match args.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::new().filter_level(level).init();

    let docs_dir = default_docs_dir();
    let store_root = args.store_root.unwrap_or_else(|| docs_dir.clone());
    let manifest_path = args.manifest.unwrap_or_else(|| docs_dir.join("firmware_version.json"));

    log::info!("loading firmware manifest from {}", manifest_path.display());
    let manifest = FirmwareManifest::load(&manifest_path)
        .with_context(|| format!("failed to load firmware manifest at {}", manifest_path.display()))?;
    let store = FirmwareStore::new(store_root, args.assets);

    let mode = match args.mode {
        Mode::Modules => UpdateMode::Modules,
        Mode::Network => UpdateMode::Network,
        Mode::NetworkBootloader => UpdateMode::NetworkBootloader,
        Mode::Esp => UpdateMode::Esp,
        Mode::EspReset => UpdateMode::EspReset,
        Mode::ChangeType => {
            let target = args
                .target_type
                .context("--target-type is required for --mode change-type")?;
            UpdateMode::ChangeType(target.into())
        }
    };

    let coordinator = Coordinator::new(manifest, store);
    let on_progress = |snapshots: &[modi_fw_updater::ProgressSnapshot]| {
        let total = modi_fw_updater::coordinator::aggregate_percent(snapshots);
        log::info!("overall progress: {total:.1}% across {} gateway(s)", snapshots.len());
        for (i, snap) in snapshots.iter().enumerate() {
            log::debug!(
                "gateway {i}: phase={:?} unit={}/{} sub={}% type={:?}",
                snap.phase,
                snap.completed_units,
                snap.total_units,
                snap.current_subprogress,
                snap.current_type,
            );
        }
    };

    let report = match &args.port {
        Some(port) => coordinator.run_on_port(port, mode, on_progress).await,
        None => coordinator.run(mode, on_progress).await,
    };

    let report = match report {
        Ok(report) => report,
        Err(e) => {
            log::error!("{e}");
            anyhow::bail!(e);
        }
    };

    for gateway in &report.gateways {
        if gateway.success {
            log::info!("{}: done", gateway.path);
        } else {
            log::warn!("{}: {}", gateway.path, gateway.error_text.as_deref().unwrap_or("failed"));
        }
    }

    if !report.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
