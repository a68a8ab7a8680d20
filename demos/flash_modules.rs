//! Flashes every peripheral module behind the first attached gateway,
//! rendering progress with a live `indicatif` bar.
//!
//! Run against real hardware with:
//!
//! ```text
//! cargo run --example flash_modules -- /path/to/firmware_version.json
//! ```

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use modi_fw_updater::coordinator::{Coordinator, UpdateMode};
use modi_fw_updater::store::{FirmwareManifest, FirmwareStore};
use modi_fw_updater::Phase;

#[tokio::main]
async fn main() -> Result<()> {
    let manifest_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: flash_modules <firmware_version.json>")?;

    println!("🔧 loading manifest from {}", manifest_path.display());
    let manifest = FirmwareManifest::load(&manifest_path)
        .with_context(|| format!("reading {}", manifest_path.display()))?;
    let store_root = manifest_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let store = FirmwareStore::new(store_root, PathBuf::from("assets"));

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );

    let coordinator = Coordinator::new(manifest, store);
    let report = coordinator
        .run(UpdateMode::Modules, |snapshots| {
            let percent =
                modi_fw_updater::coordinator::aggregate_percent(snapshots).round() as u64;
            bar.set_position(percent);
            let phase = snapshots.first().map(|s| s.phase).unwrap_or(Phase::WaitingUuid);
            bar.set_message(format!("{phase:?}"));
        })
        .await?;
    bar.finish_with_message("done");

    for gateway in &report.gateways {
        if gateway.success {
            println!("✅ {}: all modules updated", gateway.path);
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
