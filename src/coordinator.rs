//! Spawns one flasher per discovered gateway, aggregates progress, and
//! signals completion/failure (C9).
//!
//! Each gateway's flasher runs as its own `tokio` task — the async
//! equivalent of the reference implementation's "own worker thread" per
//! gateway (§5) — publishing through a [`watch`] channel the coordinator
//! polls on a fixed interval rather than locking shared state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::catalog::ModuleType;
use crate::error::CoordinatorError;
use crate::esp_flasher::EspFlasher;
use crate::module_flasher::ModuleFlasher;
use crate::network_flasher::NetworkFlasher;
use crate::progress::{Phase, ProgressSnapshot};
use crate::store::{FirmwareManifest, FirmwareStore};
use crate::transport::{enumerate_gateways, GatewayPort, SerialTransport, Transport};

/// At most this many gateways are driven in one run (§4.9).
pub const MAX_GATEWAYS: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Which update operation the coordinator drives across every gateway.
#[derive(Debug, Clone)]
pub enum UpdateMode {
    /// Discover and flash peripheral modules behind each gateway (C6).
    Modules,
    /// Flash each gateway's own application MCU (C7).
    Network,
    /// Command each gateway into bootloader-only mode and wait for reappearance (C7).
    NetworkBootloader,
    /// Run the ESP SLIP bootloader session on each gateway (C8).
    Esp,
    /// Reset each gateway's ESP interpreter without a full flashing session (C8).
    EspReset,
    /// Retarget every discovered module's uuid to `target` (§4.6.3).
    ChangeType(ModuleType),
}

/// Terminal outcome of one gateway's run.
#[derive(Debug, Clone)]
pub struct GatewayResult {
    /// OS path the gateway was opened at.
    pub path: String,
    /// True if the gateway reached `Done` with no recorded error.
    pub success: bool,
    /// Failure or partial-failure detail, if any.
    pub error_text: Option<String>,
}

/// Aggregate result of one coordinator run across every discovered gateway.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Per-gateway terminal result, in enumeration order.
    pub gateways: Vec<GatewayResult>,
}

impl RunReport {
    /// True only if every gateway finished with no error at all.
    pub fn all_succeeded(&self) -> bool {
        self.gateways.iter().all(|g| g.success)
    }

    /// True if at least one gateway finished but at least one module (or
    /// the gateway itself) recorded an error — the `partial_failure`
    /// classification from §4.6.2 scenario 3.
    pub fn is_partial_failure(&self) -> bool {
        !self.gateways.is_empty() && !self.all_succeeded()
    }
}

/// Computes the coordinator's total progress as the mean of every
/// gateway's own [`ProgressSnapshot::percent`] (§4.9).
pub fn aggregate_percent(snapshots: &[ProgressSnapshot]) -> f64 {
    if snapshots.is_empty() {
        return 0.0;
    }
    let sum: f64 = snapshots.iter().map(ProgressSnapshot::percent).sum();
    sum / snapshots.len() as f64
}

/// Spawns one flasher task per discovered gateway and aggregates progress.
pub struct Coordinator {
    manifest: Arc<FirmwareManifest>,
    store: Arc<FirmwareStore>,
}

impl Coordinator {
    /// Builds a coordinator against an already-loaded manifest and firmware store.
    pub fn new(manifest: FirmwareManifest, store: FirmwareStore) -> Self {
        Self {
            manifest: Arc::new(manifest),
            store: Arc::new(store),
        }
    }

    /// Runs `mode` across every enumerated gateway (capped at [`MAX_GATEWAYS`]),
    /// invoking `on_progress` at the 100 ms poll interval with every gateway's
    /// current snapshot, until each one reaches `Done` or `Failed`.
    ///
    /// Returns [`CoordinatorError::NoGateways`] immediately if enumeration
    /// finds nothing to drive (§8 scenario 5).
    pub async fn run(
        &self,
        mode: UpdateMode,
        on_progress: impl FnMut(&[ProgressSnapshot]),
    ) -> Result<RunReport, CoordinatorError> {
        let gateways = enumerate_gateways().map_err(|_| CoordinatorError::NoGateways)?;
        if gateways.is_empty() {
            return Err(CoordinatorError::NoGateways);
        }
        let gateways: Vec<GatewayPort> = gateways.into_iter().take(MAX_GATEWAYS).collect();
        self.drive(gateways, mode, on_progress).await
    }

    /// Runs `mode` against a single, explicitly-named port instead of
    /// enumerating gateways — the `--port` override of the CLI contract (§6).
    pub async fn run_on_port(
        &self,
        path: &str,
        mode: UpdateMode,
        on_progress: impl FnMut(&[ProgressSnapshot]),
    ) -> Result<RunReport, CoordinatorError> {
        let gateway = GatewayPort {
            path: path.to_string(),
            kind: crate::transport::PortKind::Serial,
        };
        self.drive(vec![gateway], mode, on_progress).await
    }

    async fn drive(
        &self,
        gateways: Vec<GatewayPort>,
        mode: UpdateMode,
        mut on_progress: impl FnMut(&[ProgressSnapshot]),
    ) -> Result<RunReport, CoordinatorError> {
        let mut receivers = Vec::with_capacity(gateways.len());
        let mut handles = Vec::with_capacity(gateways.len());
        let mut paths = Vec::with_capacity(gateways.len());

        for gateway in gateways {
            let (tx, rx) = watch::channel(ProgressSnapshot::waiting());
            paths.push(gateway.path.clone());
            receivers.push(rx);
            let manifest = self.manifest.clone();
            let store = self.store.clone();
            let mode = mode.clone();
            handles.push(tokio::spawn(async move {
                run_one_gateway(&gateway, mode, manifest, store, tx).await;
            }));
        }

        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let snapshots: Vec<ProgressSnapshot> = receivers.iter().map(|r| r.borrow().clone()).collect();
            on_progress(&snapshots);
            if snapshots.iter().all(|s| matches!(s.phase, Phase::Done | Phase::Failed)) {
                break;
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        let gateways = paths
            .into_iter()
            .zip(receivers.iter())
            .map(|(path, rx)| {
                let snap = rx.borrow();
                GatewayResult {
                    path,
                    success: snap.phase == Phase::Done && snap.error_text.is_none(),
                    error_text: snap.error_text.clone(),
                }
            })
            .collect();

        Ok(RunReport { gateways })
    }
}

async fn run_one_gateway(
    gateway: &GatewayPort,
    mode: UpdateMode,
    manifest: Arc<FirmwareManifest>,
    store: Arc<FirmwareStore>,
    progress: watch::Sender<ProgressSnapshot>,
) {
    log::info!("starting {:?} on gateway {}", mode, gateway.path);
    let transport: Arc<dyn Transport> = match SerialTransport::open(gateway) {
        Ok(t) => Arc::new(t) as Arc<dyn Transport>,
        Err(e) => {
            log::error!("failed to open gateway {}: {e}", gateway.path);
            let _ = progress.send(ProgressSnapshot {
                phase: Phase::Failed,
                error_text: Some(e.to_string()),
                ..ProgressSnapshot::waiting()
            });
            return;
        }
    };

    let result: Result<(), String> = match mode {
        UpdateMode::Modules => {
            let mut flasher = ModuleFlasher::new(transport.clone());
            flasher.run(&manifest, &store, &progress).await.map_err(|e| e.to_string())
        }
        UpdateMode::Network => {
            let mut flasher = NetworkFlasher::new(transport.clone());
            flasher
                .flash_app(&store, &manifest.network.app, &progress)
                .await
                .map_err(|e| e.to_string())
        }
        UpdateMode::NetworkBootloader => {
            let mut flasher = NetworkFlasher::new(transport.clone());
            flasher.enter_bootloader(&progress).await.map_err(|e| e.to_string())
        }
        UpdateMode::Esp => {
            let flasher = EspFlasher::new(transport.clone());
            match store.esp_app_images(&manifest.network.sub) {
                Ok(images) => flasher
                    .run(&images, &manifest.network.sub, &progress)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        UpdateMode::EspReset => {
            let flasher = EspFlasher::new(transport.clone());
            flasher.reset_interpreter().await.map_err(|e| e.to_string())
        }
        UpdateMode::ChangeType(target) => {
            let mut flasher = ModuleFlasher::new(transport.clone());
            match flasher.discover(&manifest).await {
                Ok(modules) => flasher.change_type(&modules, target).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
    };

    let _ = transport.close().await;

    // Several flashers (module/network) already publish their own terminal
    // snapshot; the esp flasher and the reset-only flows do not (§4.8 has
    // no progress argument for `reset_interpreter`), so finalize here only
    // if the phase hasn't already reached a terminal state.
    let already_terminal = matches!(progress.borrow().phase, Phase::Done | Phase::Failed);
    if !already_terminal {
        let _ = progress.send(match result {
            Ok(()) => ProgressSnapshot {
                current_subprogress: 100,
                completed_units: 1,
                total_units: 1,
                current_type: None,
                phase: Phase::Done,
                error_text: None,
            },
            Err(error_text) => ProgressSnapshot {
                phase: Phase::Failed,
                error_text: Some(error_text),
                ..ProgressSnapshot::waiting()
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(phase: Phase, completed: u32, total: u32, sub: u8) -> ProgressSnapshot {
        ProgressSnapshot {
            current_subprogress: sub,
            completed_units: completed,
            total_units: total,
            current_type: None,
            phase,
            error_text: None,
        }
    }

    #[test]
    fn aggregate_percent_of_empty_set_is_zero() {
        assert_eq!(aggregate_percent(&[]), 0.0);
    }

    #[test]
    fn aggregate_percent_is_mean_of_per_gateway_percent() {
        let done = snap(Phase::Done, 0, 0, 0); // percent() == 100
        let halfway = snap(Phase::Updating, 1, 2, 0); // percent() == 50
        assert_eq!(aggregate_percent(&[done, halfway]), 75.0);
    }

    #[test]
    fn run_report_distinguishes_partial_failure_from_total_failure() {
        let report = RunReport {
            gateways: vec![
                GatewayResult { path: "a".into(), success: true, error_text: None },
                GatewayResult {
                    path: "b".into(),
                    success: false,
                    error_text: Some("partial_failure".into()),
                },
            ],
        };
        assert!(!report.all_succeeded());
        assert!(report.is_partial_failure());
    }

    #[test]
    fn max_gateways_caps_enumeration_to_ten() {
        let many: Vec<u32> = (0..25).collect();
        let capped: Vec<_> = many.into_iter().take(MAX_GATEWAYS).collect();
        assert_eq!(capped.len(), 10);
    }
}
