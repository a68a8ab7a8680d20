//! Per-gateway state machine that discovers modules on the bus,
//! classifies each into a starting section, and drives the page-level
//! erase/write/CRC loop to completion (C6).
//!
//! The retry/phase bookkeeping here is deliberately flat (page index ×
//! phase × retry counter) rather than nested loops with `continue`, per
//! the redesign note about deep control-flow for retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};

use crate::catalog::{retarget_uuid, type_from_uuid, uuid_type_tag, ModuleType, Section};
use crate::codec::{self, encode, pack_u16_le, pack_u32_le, unpack_u16_le, unpack_u48_le, FrameReader};
use crate::crc::page_checksum;
use crate::error::FlashError;
use crate::progress::{Phase, ProgressSnapshot};
use crate::store::{FirmwareManifest, FirmwareStore, FlashLayout};
use crate::transport::Transport;
use crate::version::pack_version;
use crate::wire::*;

const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);
const END_FLASH_TIMEOUT: Duration = Duration::from_secs(5);
/// Two additional retries beyond the first attempt: three tries per phase.
const MAX_PHASE_RETRIES: u8 = 2;
/// A module is abandoned after its third failed section attempt.
const MAX_SECTION_RETRIES: u8 = 3;
const PAGE_PACING: Duration = Duration::from_millis(1);
const DISCOVERY_POLL_WINDOW: Duration = Duration::from_secs(1);
const CHANGE_TYPE_TIMEOUT: Duration = Duration::from_secs(5);
const CHANGE_TYPE_RESEND: Duration = Duration::from_secs(1);

/// Whether a module has announced itself as ready to update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Discovered but not yet confirmed ready.
    Unknown,
    /// Sent a warning frame confirming it is ready to be flashed.
    UpdateReady,
}

/// One discovered peripheral module and its update state.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// The module's 48-bit bus identity.
    pub uuid: u64,
    /// The module's on-bus source id.
    pub bus_id: u16,
    /// Type derived from `uuid`'s top 32 bits.
    pub type_tag: ModuleType,
    /// Discovery/readiness state.
    pub state: ModuleState,
    /// Section currently being driven (or the starting section).
    pub section: Section,
    /// Number of section attempts that have failed so far.
    pub retry_count: u8,
}

fn all_zero(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Drives module discovery and the page-flashing protocol for one gateway.
pub struct ModuleFlasher {
    transport: Arc<dyn Transport>,
    inbound: mpsc::Receiver<codec::Frame>,
    network_uuid: Option<u64>,
}

impl ModuleFlasher {
    /// Wraps an open gateway [`Transport`], starting its inbound reader task.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let reader_transport = transport.clone();
        tokio::spawn(async move {
            let mut reader = FrameReader::new();
            loop {
                match reader_transport.read(256).await {
                    Ok(bytes) if !bytes.is_empty() => {
                        reader.feed(&bytes);
                        while let Some(frame) = reader.next_frame() {
                            if tx.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        });
        Self {
            transport,
            inbound: rx,
            network_uuid: None,
        }
    }

    /// The gateway's own uuid, once discovered.
    pub fn network_uuid(&self) -> Option<u64> {
        self.network_uuid
    }

    async fn send(&self, command: u8, sid: u16, did: u16, payload: &[u8]) -> Result<(), FlashError> {
        let line = encode(command, sid, did, payload);
        self.transport
            .write(line.as_bytes())
            .await
            .map_err(FlashError::Transport)
    }

    async fn next_frame(&mut self, deadline: Duration) -> Option<codec::Frame> {
        timeout(deadline, self.inbound.recv()).await.ok().flatten()
    }

    /// Runs the discovery window (§4.6.1), returning every module found.
    pub async fn discover(&mut self, manifest: &FirmwareManifest) -> Result<Vec<ModuleInfo>, FlashError> {
        let mut modules: Vec<ModuleInfo> = Vec::new();
        let mut network_uuid = self.network_uuid;

        for _ in 0..3 {
            self.send(CMD_REQUEST_NETWORK_ID, 0, BROADCAST_ID, &[0xFF, 0x0F]).await?;
            sleep(Duration::from_millis(10)).await;
        }
        for _ in 0..2 {
            self.send(
                CMD_SET_MODULE_STATE,
                0,
                BROADCAST_ID,
                &[module_state::UPDATE_FIRMWARE, pnp::OFF],
            )
            .await?;
            sleep(Duration::from_millis(500)).await;
        }

        let window_start = Instant::now();
        while window_start.elapsed() < DISCOVERY_POLL_WINDOW {
            let remaining = DISCOVERY_POLL_WINDOW.saturating_sub(window_start.elapsed());
            let poll = remaining.min(Duration::from_millis(50));
            if let Some(frame) = self.next_frame(poll).await {
                self.handle_discovery_frame(frame, &mut modules, &mut network_uuid, manifest)
                    .await?;
            }
        }
        self.network_uuid = network_uuid;
        log::info!("discovery window closed with {} module(s) found", modules.len());
        Ok(modules)
    }

    async fn handle_discovery_frame(
        &self,
        frame: codec::Frame,
        modules: &mut Vec<ModuleInfo>,
        network_uuid: &mut Option<u64>,
        manifest: &FirmwareManifest,
    ) -> Result<(), FlashError> {
        match frame.command {
            CMD_REQUEST_UUID_ECHO => {
                if frame.sid != 0 {
                    self.send(CMD_REQUEST_MODULE_ID, 0, frame.sid, &[0xFF, 0x0F]).await?;
                }
            }
            CMD_UUID_ANNOUNCE => {
                if frame.payload.len() >= 6 {
                    let uuid = unpack_u48_le(&frame.payload, 0);
                    let type_tag = type_from_uuid(uuid);
                    if type_tag == ModuleType::Network {
                        *network_uuid = Some(uuid);
                    } else if !modules.iter().any(|m| m.uuid == uuid) {
                        modules.push(ModuleInfo {
                            uuid,
                            bus_id: frame.sid,
                            type_tag,
                            state: ModuleState::Unknown,
                            section: Section::App,
                            retry_count: 0,
                        });
                    }
                }
            }
            CMD_WARNING => {
                self.handle_warning(frame, modules, manifest).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_warning(
        &self,
        frame: codec::Frame,
        modules: &mut Vec<ModuleInfo>,
        manifest: &FirmwareManifest,
    ) -> Result<(), FlashError> {
        if frame.payload.len() < 7 {
            return Ok(());
        }
        let uuid = unpack_u48_le(&frame.payload, 0);
        let warning_type = frame.payload[6];
        match warning_type {
            0 => Ok(()),
            1 => {
                self.send(
                    CMD_SET_MODULE_STATE,
                    0,
                    frame.sid,
                    &[module_state::UPDATE_FIRMWARE_READY, pnp::OFF],
                )
                .await
            }
            2 => {
                let type_tag = type_from_uuid(uuid);
                let section = if frame.payload.len() < 10 {
                    Section::SecondBootloader
                } else {
                    let reported = frame.payload[7];
                    let boot_version = unpack_u16_le(&frame.payload, 8);
                    let reported_section = match reported {
                        0 => Section::App,
                        1 => Section::Bootloader,
                        _ => Section::SecondBootloader,
                    };
                    if reported_section == Section::App {
                        let required = manifest
                            .modules
                            .get(&type_tag)
                            .and_then(|v| pack_version(&v.bootloader));
                        match required {
                            Some(r) if r != boot_version => Section::SecondBootloader,
                            _ => Section::App,
                        }
                    } else {
                        reported_section
                    }
                };
                if let Some(existing) = modules.iter_mut().find(|m| m.uuid == uuid) {
                    existing.state = ModuleState::UpdateReady;
                    existing.section = section;
                } else {
                    modules.push(ModuleInfo {
                        uuid,
                        bus_id: frame.sid,
                        type_tag,
                        state: ModuleState::UpdateReady,
                        section,
                        retry_count: 0,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn wait_for_state(
        &mut self,
        bus_id: u16,
        complete_code: u8,
        error_code: u8,
        deadline: Duration,
    ) -> Result<bool, FlashError> {
        let start = Instant::now();
        loop {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(FlashError::Timeout);
            }
            let Some(frame) = self.next_frame(remaining).await else {
                return Err(FlashError::Timeout);
            };
            if frame.command != CMD_FIRMWARE_STATE || frame.sid != bus_id || frame.payload.len() < 5 {
                continue;
            }
            let state = frame.payload[4];
            if state == complete_code {
                return Ok(true);
            }
            if state == error_code {
                return Ok(false);
            }
        }
    }

    async fn send_firmware_command_with_retry(
        &mut self,
        bus_id: u16,
        sub_cmd: u8,
        value: u32,
        addr: u32,
        deadline: Duration,
    ) -> Result<(), FlashError> {
        let (complete_code, error_code) = if sub_cmd == fw_subcmd::ERASE {
            (stream_state::ERASE_COMPLETE, stream_state::ERASE_ERROR)
        } else {
            (stream_state::CRC_COMPLETE, stream_state::CRC_ERROR)
        };
        let mut attempt = 0u8;
        loop {
            attempt += 1;
            let mut payload = [0u8; 8];
            pack_u32_le(&mut payload, 0, value);
            pack_u32_le(&mut payload, 4, addr);
            let sid = ((sub_cmd as u16) << 8) | 1;
            self.send(CMD_FIRMWARE_COMMAND, sid, bus_id, &payload).await?;
            match self.wait_for_state(bus_id, complete_code, error_code, deadline).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    if attempt > MAX_PHASE_RETRIES {
                        return Err(FlashError::ProtocolError(error_code));
                    }
                }
                Err(e) => {
                    if attempt > MAX_PHASE_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn stream_page(&self, bus_id: u16, page: &[u8]) -> Result<(), FlashError> {
        for (seq, chunk) in page.chunks_exact(8).enumerate() {
            self.send(CMD_FIRMWARE_DATA, seq as u16, bus_id, chunk).await?;
            sleep(PAGE_PACING).await;
        }
        Ok(())
    }

    async fn run_page_loop(
        &mut self,
        bus_id: u16,
        blob: &[u8],
        layout: &FlashLayout,
        progress_ctx: Option<(&watch::Sender<ProgressSnapshot>, u32, u32, ModuleType)>,
    ) -> Result<(), FlashError> {
        let bin_size = blob.len() as u32;
        let span = bin_size.saturating_sub(layout.bin_begin);
        let bin_end = layout.bin_begin + (span / layout.page_size) * layout.page_size;
        let page_count = ((bin_end - layout.bin_begin) / layout.page_size).max(1);
        let mut page_begin = layout.bin_begin;
        let mut page_index = 0u32;
        while page_begin < bin_end {
            let page = &blob[page_begin as usize..(page_begin + layout.page_size) as usize];
            let page_addr = layout.flash_base + page_begin + layout.page_offset;
            let skip = page_addr == layout.end_flash_address || Some(page_addr) == layout.flash_info_address;
            if !skip && !all_zero(page) {
                self.send_firmware_command_with_retry(
                    bus_id,
                    fw_subcmd::ERASE,
                    layout.erase_page_num,
                    page_addr,
                    COMMAND_TIMEOUT,
                )
                .await?;
                self.stream_page(bus_id, page).await?;
                let crc = page_checksum(page, 0);
                self.send_firmware_command_with_retry(bus_id, fw_subcmd::CRC, crc, page_addr, COMMAND_TIMEOUT)
                    .await?;
            }
            page_index += 1;
            if let Some((progress, completed, total, type_tag)) = progress_ctx {
                let _ = progress.send(ProgressSnapshot {
                    current_subprogress: ((page_index * 100) / page_count).min(100) as u8,
                    completed_units: completed,
                    total_units: total,
                    current_type: Some(type_tag),
                    phase: Phase::Updating,
                    error_text: None,
                });
            }
            page_begin += layout.page_size;
        }
        Ok(())
    }

    async fn write_end_flash_record(
        &mut self,
        bus_id: u16,
        layout: &FlashLayout,
        os_version: u16,
        app_version: u16,
        success: bool,
    ) -> Result<(), FlashError> {
        let mut record = [0u8; 16];
        record[0] = if success { 0xAA } else { 0xFF };
        pack_u16_le(&mut record, 6, os_version);
        pack_u16_le(&mut record, 8, app_version);
        pack_u32_le(&mut record, 12, layout.reset_vector);

        self.send_firmware_command_with_retry(
            bus_id,
            fw_subcmd::ERASE,
            layout.erase_page_num,
            layout.end_flash_address,
            END_FLASH_TIMEOUT,
        )
        .await?;
        self.stream_page(bus_id, &record).await?;
        let crc = page_checksum(&record, 0);
        self.send_firmware_command_with_retry(
            bus_id,
            fw_subcmd::CRC,
            crc,
            layout.end_flash_address,
            END_FLASH_TIMEOUT,
        )
        .await
    }

    async fn flash_section(
        &mut self,
        module: &ModuleInfo,
        section: Section,
        manifest: &FirmwareManifest,
        store: &FirmwareStore,
        progress_ctx: (&watch::Sender<ProgressSnapshot>, u32, u32),
    ) -> Result<(), FlashError> {
        let versions = manifest
            .modules
            .get(&module.type_tag)
            .ok_or(FlashError::ModuleError { uuid: module.uuid })?;
        let blob = match section {
            Section::App => store.module_blob(module.type_tag, &versions.app)?,
            Section::Bootloader | Section::SecondBootloader => {
                store.bootloader_blob(module.type_tag, section, &versions.bootloader)?
            }
            Section::Done | Section::Error => return Ok(()),
        };
        let layout = FlashLayout::for_module(module.type_tag, section);

        let (progress, completed, total) = progress_ctx;
        let result = self
            .run_page_loop(
                module.bus_id,
                &blob,
                &layout,
                Some((progress, completed, total, module.type_tag)),
            )
            .await;
        let success = result.is_ok();

        let (os_version, app_version) = if section == Section::App {
            (
                versions.os.as_str(),
                versions.app.as_str(),
            )
        } else {
            ("", "")
        };
        self.write_end_flash_record(
            module.bus_id,
            &layout,
            pack_version(os_version).unwrap_or(0),
            pack_version(app_version).unwrap_or(0),
            success,
        )
        .await?;

        result.map_err(|_| FlashError::SectionAborted {
            section,
            retries: MAX_PHASE_RETRIES + 1,
        })
    }

    async fn drive_sections(
        &mut self,
        module: &mut ModuleInfo,
        manifest: &FirmwareManifest,
        store: &FirmwareStore,
        progress_ctx: (&watch::Sender<ProgressSnapshot>, u32, u32),
    ) -> Result<(), FlashError> {
        let sections: &[Section] = match module.section {
            Section::SecondBootloader => &[Section::SecondBootloader, Section::Bootloader, Section::App],
            Section::Bootloader => &[Section::Bootloader, Section::App],
            _ => &[Section::App],
        };

        for &section in sections {
            loop {
                match self.flash_section(module, section, manifest, store, progress_ctx).await {
                    Ok(()) => break,
                    Err(e) => {
                        module.retry_count += 1;
                        log::warn!(
                            "module {:#x} section {section:?} attempt {} failed: {e}",
                            module.uuid,
                            module.retry_count
                        );
                        if module.retry_count >= MAX_SECTION_RETRIES {
                            module.section = Section::Error;
                            return Err(FlashError::ModuleError { uuid: module.uuid });
                        }
                    }
                }
            }
            module.section = match section {
                Section::SecondBootloader => Section::Bootloader,
                Section::Bootloader => Section::App,
                Section::App => Section::Done,
                other => other,
            };
            if section != Section::App {
                self.send(CMD_SET_MODULE_STATE, 0, module.bus_id, &[module_state::REBOOT, pnp::OFF])
                    .await?;
            }
        }
        Ok(())
    }

    /// Drives every discovered module through its remaining sections,
    /// publishing a [`ProgressSnapshot`] after each page within the
    /// current section as well as after each module completes.
    ///
    /// Returns `Ok(())` even when individual modules end in `error`: the
    /// run is then a partial failure, reflected in the final snapshot's
    /// `error_text`, not in this function's `Result`.
    pub async fn run(
        &mut self,
        manifest: &FirmwareManifest,
        store: &FirmwareStore,
        progress: &watch::Sender<ProgressSnapshot>,
    ) -> Result<(), FlashError> {
        let _ = progress.send(ProgressSnapshot {
            phase: Phase::WaitingModules,
            ..ProgressSnapshot::waiting()
        });

        let mut modules = self.discover(manifest).await?;
        if modules.is_empty() {
            let _ = progress.send(ProgressSnapshot {
                phase: Phase::Failed,
                error_text: Some("No modules discovered".to_string()),
                ..ProgressSnapshot::waiting()
            });
            return Err(FlashError::NoModules);
        }

        let total = modules.len() as u32;
        for (completed, module) in modules.iter_mut().enumerate() {
            let _ = progress.send(ProgressSnapshot {
                current_subprogress: 0,
                completed_units: completed as u32,
                total_units: total,
                current_type: Some(module.type_tag),
                phase: Phase::Updating,
                error_text: None,
            });
            let _ = self
                .drive_sections(module, manifest, store, (progress, completed as u32, total))
                .await;
        }

        let _ = self
            .send(CMD_SET_MODULE_STATE, 0, BROADCAST_ID, &[module_state::REBOOT, pnp::OFF])
            .await;

        let failed = modules.iter().any(|m| m.section == Section::Error);
        let _ = progress.send(ProgressSnapshot {
            current_subprogress: 100,
            completed_units: total,
            total_units: total,
            current_type: None,
            phase: Phase::Done,
            error_text: if failed { Some("partial_failure".to_string()) } else { None },
        });
        Ok(())
    }

    /// Type-reassignment mode (§4.6.3): retargets every discovered module's
    /// uuid to `target_type`'s canonical tag instead of running the page loop.
    pub async fn change_type(&mut self, modules: &[ModuleInfo], target_type: ModuleType) -> Result<(), FlashError> {
        for module in modules {
            let target_uuid =
                retarget_uuid(module.uuid, target_type).ok_or(FlashError::ModuleError { uuid: module.uuid })?;
            self.send(CMD_CHANGE_TYPE, 0, module.bus_id, &target_uuid.to_le_bytes())
                .await?;
        }
        sleep(Duration::from_millis(50)).await;
        self.send(CMD_SET_MODULE_STATE, 0, BROADCAST_ID, &[module_state::REBOOT, pnp::ON])
            .await?;

        let target_tag = uuid_type_tag(target_type).ok_or(FlashError::NoModules)?;
        let start = Instant::now();
        let mut last_resend = Instant::now();
        loop {
            if start.elapsed() >= CHANGE_TYPE_TIMEOUT {
                return Err(FlashError::Timeout);
            }
            if last_resend.elapsed() >= CHANGE_TYPE_RESEND {
                self.send(CMD_SET_MODULE_STATE, 0, BROADCAST_ID, &[module_state::REBOOT, pnp::ON])
                    .await?;
                last_resend = Instant::now();
            }
            if let Some(frame) = self.next_frame(Duration::from_millis(100)).await {
                if frame.command == CMD_UUID_ANNOUNCE && frame.payload.len() >= 6 {
                    let uuid = unpack_u48_le(&frame.payload, 0);
                    if (uuid >> 32) as u32 == target_tag {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zero_detects_blank_pages() {
        assert!(all_zero(&[0u8; 32]));
        assert!(!all_zero(&[0u8, 0, 1, 0]));
    }

    #[test]
    fn discovery_window_and_retry_constants_match_the_wire_contract() {
        assert_eq!(MAX_PHASE_RETRIES, 2);
        assert_eq!(MAX_SECTION_RETRIES, 3);
        assert_eq!(DISCOVERY_POLL_WINDOW, Duration::from_secs(1));
    }
}
