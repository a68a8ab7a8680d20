//! Runs the ESP SLIP bootloader session against the first attached
//! gateway, then leaves its interpreter reset if no manifest is given.
//!
//! ```text
//! cargo run --example flash_esp -- /path/to/firmware_version.json
//! ```

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use modi_fw_updater::coordinator::{Coordinator, UpdateMode};
use modi_fw_updater::store::{FirmwareManifest, FirmwareStore};

#[tokio::main]
async fn main() -> Result<()> {
    let manifest_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: flash_esp <firmware_version.json>")?;

    println!("📡 loading manifest from {}", manifest_path.display());
    let manifest = FirmwareManifest::load(&manifest_path)
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let store_root = manifest_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let store = FirmwareStore::new(store_root, PathBuf::from("assets"));

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.yellow} [{bar:40.yellow/black}] {pos}%")
            .unwrap()
            .progress_chars("#>-"),
    );

    let coordinator = Coordinator::new(manifest, store);
    let report = coordinator
        .run(UpdateMode::Esp, |snapshots| {
            let percent = modi_fw_updater::coordinator::aggregate_percent(snapshots).round() as u64;
            bar.set_position(percent);
        })
        .await?;
    bar.finish_with_message("esp session complete");

    for gateway in &report.gateways {
        if gateway.success {
            println!("✅ {}: esp co-processor reflashed", gateway.path);
        } else {
            println!(
                "❌ {}: {}",
                gateway.path,
                gateway.error_text.as_deref().unwrap_or("failed")
            );
        }
    }

    if !report.all_succeeded() {
        anyhow::bail!("one or more gateways failed");
    }
    Ok(())
}
