//! SLIP-framed session with the ESP ROM bootloader, reached by putting
//! the gateway's own MCU into a serial pass-through mode (C8).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

use crate::codec::encode;
use crate::error::EspError;
use crate::progress::{Phase, ProgressSnapshot};
use crate::store::EspAppImages;
use crate::transport::Transport;
use crate::wire::{module_state, pnp, BROADCAST_ID, CMD_ENTER_ESP_PASSTHROUGH, CMD_SET_MODULE_STATE};
use tokio::sync::watch;

/// Byte-stuffing framing used by the ESP ROM bootloader.
pub mod slip {
    /// Frame delimiter.
    pub const END: u8 = 0xC0;
    /// Escape byte.
    pub const ESC: u8 = 0xDB;
    /// Escaped `END`.
    pub const ESC_END: u8 = 0xDC;
    /// Escaped `ESC`.
    pub const ESC_ESC: u8 = 0xDD;

    /// Wraps `data` in `END` delimiters, escaping `END` and `ESC` bytes within it.
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 2);
        out.push(END);
        for &b in data {
            match b {
                END => out.extend_from_slice(&[ESC, ESC_END]),
                ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
                _ => out.push(b),
            }
        }
        out.push(END);
        out
    }

    /// Inverse of [`encode`]: strips delimiters and unescapes in place.
    ///
    /// Tolerant of arbitrary input: a trailing lone `ESC` byte (a
    /// truncated escape sequence) is passed through unescaped rather
    /// than panicking, since a desynced stream must not crash the session.
    pub fn decode(frame: &[u8]) -> Vec<u8> {
        let body: Vec<u8> = frame.iter().copied().filter(|&b| b != END).collect();
        let mut out = Vec::with_capacity(body.len());
        let mut i = 0;
        while i < body.len() {
            if body[i] == ESC && i + 1 < body.len() {
                match body[i + 1] {
                    ESC_END => out.push(END),
                    ESC_ESC => out.push(ESC),
                    other => out.push(other),
                }
                i += 2;
            } else {
                out.push(body[i]);
                i += 1;
            }
        }
        out
    }
}

const DEVICE_SYNC: u8 = 0x08;
const SPI_ATTACH_REQ: u8 = 0x0D;
const SPI_FLASH_SET: u8 = 0x0B;
const ESP_FLASH_BEGIN: u8 = 0x02;
const ESP_FLASH_DATA: u8 = 0x03;
const ESP_BOOT_APP: u8 = 0xA0;
const ESP_SET_VERSION_SUBCMD: u8 = 24;
const ESP_GET_VERSION_SUBCMD: u8 = 25;

const ESP_FLASH_BLOCK: usize = 512;
const ESP_FLASH_CHUNK: usize = 16384;
const ESP_CHECKSUM_MAGIC: u8 = 0xEF;
const ESP_FLASH_OFFSETS: [(usize, &str); 5] = [
    (0x1000, "bootloader"),
    (0x8000, "partitions"),
    (0xD000, "ota_data_initial"),
    (0x10000, "modi_ota_factory"),
    (0xD0000, "esp32"),
];

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_SUCCESS_STATUS: u8 = 0x01;

fn build_packet(direction: u8, command: u8, checksum: u32, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(8 + payload.len());
    pkt.push(direction);
    pkt.push(command);
    pkt.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    pkt.extend_from_slice(&checksum.to_le_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// Drives the SLIP bootloader session over a gateway already in pass-through mode.
pub struct EspFlasher {
    transport: Arc<dyn Transport>,
}

impl EspFlasher {
    /// Wraps an open gateway [`Transport`].
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Commands the gateway's network MCU to stop its interpreter and
    /// forward the serial channel to the ESP (command `0x2B`, `b=0x00`).
    pub async fn enter_passthrough(&self) -> Result<(), EspError> {
        self.transport
            .write(encode(CMD_SET_MODULE_STATE, 0, BROADCAST_ID, &[module_state::FORCED_PAUSE, pnp::OFF]).as_bytes())
            .await?;
        self.transport
            .write(encode(CMD_ENTER_ESP_PASSTHROUGH, 0, BROADCAST_ID, &[0x00]).as_bytes())
            .await?;
        Ok(())
    }

    /// A safe recovery flow: send only the stop-interpreter command and
    /// return, without attempting a full SLIP session.
    pub async fn reset_interpreter(&self) -> Result<(), EspError> {
        self.transport
            .write(encode(CMD_SET_MODULE_STATE, 0, BROADCAST_ID, &[module_state::FORCED_PAUSE, pnp::OFF]).as_bytes())
            .await?;
        Ok(())
    }

    async fn read_slip_frame(&self, deadline: Duration) -> Result<Vec<u8>, EspError> {
        let start = Instant::now();
        let mut buf = Vec::new();
        let mut seen_start = false;
        loop {
            if start.elapsed() >= deadline {
                return Err(EspError::Timeout);
            }
            let remaining = deadline.saturating_sub(start.elapsed());
            let chunk = timeout(remaining, self.transport.read(256))
                .await
                .map_err(|_| EspError::Timeout)??;
            for &b in &chunk {
                if b == slip::END {
                    if seen_start && !buf.is_empty() {
                        return Ok(slip::decode(&buf));
                    }
                    seen_start = true;
                    buf.clear();
                } else if seen_start {
                    buf.push(b);
                }
            }
        }
    }

    async fn send_and_wait(&self, command: u8, payload: &[u8], deadline: Duration, continuous: bool) -> Result<Vec<u8>, EspError> {
        self.send_and_wait_checksummed(command, 0, payload, deadline, continuous).await
    }

    async fn send_and_wait_checksummed(
        &self,
        command: u8,
        checksum: u32,
        payload: &[u8],
        deadline: Duration,
        continuous: bool,
    ) -> Result<Vec<u8>, EspError> {
        let framed = slip::encode(&build_packet(0x00, command, checksum, payload));
        let start = Instant::now();
        loop {
            self.transport.write(&framed).await?;
            let poll_deadline = if continuous {
                Duration::from_millis(100)
            } else {
                deadline.saturating_sub(start.elapsed())
            };
            match self.read_slip_frame(poll_deadline).await {
                Ok(reply) if reply.len() >= 8 && reply[1] == command => {
                    let status = *reply.last().unwrap_or(&0);
                    if status != RESPONSE_SUCCESS_STATUS {
                        return Err(EspError::BadStatus(status));
                    }
                    return Ok(reply[8..].to_vec());
                }
                Ok(reply) if reply.len() >= 2 => {
                    if !continuous {
                        return Err(EspError::Protocol {
                            expected_cmd: command,
                            got_cmd: reply[1],
                        });
                    }
                }
                _ => {}
            }
            if start.elapsed() >= deadline {
                return Err(EspError::Timeout);
            }
        }
    }

    /// Step 1: the 36-byte sync packet, resent continuously until acked
    /// or the 10 s timeout elapses.
    pub async fn sync(&self) -> Result<(), EspError> {
        let mut payload = vec![0x07, 0x07, 0x12, 0x20];
        payload.extend(std::iter::repeat(0x55u8).take(32));
        self.send_and_wait(DEVICE_SYNC, &payload, SYNC_TIMEOUT, true)
            .await
            .map(|_| ())
            .map_err(|_| EspError::Sync)
    }

    /// Step 2: flash attach, a 16 zero-byte payload.
    pub async fn flash_attach(&self) -> Result<(), EspError> {
        self.send_and_wait(SPI_ATTACH_REQ, &[0u8; 16], SYNC_TIMEOUT, false)
            .await
            .map(|_| ())
    }

    /// Step 3: set flash parameters.
    pub async fn set_flash_param(&self) -> Result<(), EspError> {
        let mut payload = Vec::with_capacity(20);
        payload.extend_from_slice(&0u32.to_le_bytes()); // flash_id
        payload.extend_from_slice(&(2 * 1024 * 1024u32).to_le_bytes()); // total_size: 2 MiB
        payload.extend_from_slice(&(64 * 1024u32).to_le_bytes()); // block_size: 64 KiB
        payload.extend_from_slice(&(4 * 1024u32).to_le_bytes()); // sector_size: 4 KiB
        payload.extend_from_slice(&256u32.to_le_bytes()); // page_size
        payload.extend_from_slice(&0xFFFFu32.to_le_bytes()); // status_mask
        self.send_and_wait(SPI_FLASH_SET, &payload, SYNC_TIMEOUT, false)
            .await
            .map(|_| ())
    }

    async fn flash_begin(&self, size: u32, offset: u32) -> Result<(), EspError> {
        let num_blocks = size.div_ceil(ESP_FLASH_BLOCK as u32);
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&size.to_le_bytes());
        payload.extend_from_slice(&num_blocks.to_le_bytes());
        payload.extend_from_slice(&(ESP_FLASH_BLOCK as u32).to_le_bytes());
        payload.extend_from_slice(&offset.to_le_bytes());
        self.send_and_wait(ESP_FLASH_BEGIN, &payload, SYNC_TIMEOUT, false)
            .await
            .map(|_| ())
    }

    async fn flash_data_block(&self, seq: u32, data: &[u8]) -> Result<(), EspError> {
        let checksum = data.iter().fold(ESP_CHECKSUM_MAGIC, |acc, &b| acc ^ b) as u32;
        let mut payload = Vec::with_capacity(16 + data.len());
        payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
        payload.extend_from_slice(&seq.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(data);
        self.send_and_wait_checksummed(ESP_FLASH_DATA, checksum, &payload, SYNC_TIMEOUT, false)
            .await
            .map(|_| ())
    }

    /// Step 4: concatenates the image set at the fixed offset table and
    /// streams it as 16 KiB chunks, each chunk's blocks preceded by its
    /// own flash-begin.
    pub async fn flash_images(
        &self,
        images: &EspAppImages,
        progress: &watch::Sender<ProgressSnapshot>,
    ) -> Result<(), EspError> {
        let end = ESP_FLASH_OFFSETS
            .iter()
            .map(|(offset, name)| offset + image_len(images, name))
            .max()
            .unwrap_or(0);
        let mut stream = vec![0xFFu8; end];
        for (offset, name) in ESP_FLASH_OFFSETS {
            let data = image_bytes(images, name);
            stream[offset..offset + data.len()].copy_from_slice(data);
        }

        let total_chunks = stream.len().div_ceil(ESP_FLASH_CHUNK);
        for (chunk_idx, chunk) in stream.chunks(ESP_FLASH_CHUNK).enumerate() {
            let chunk_offset = chunk_idx * ESP_FLASH_CHUNK;
            self.flash_begin(chunk.len() as u32, chunk_offset as u32).await?;
            for (block_idx, block) in chunk.chunks(ESP_FLASH_BLOCK).enumerate() {
                self.flash_data_block(block_idx as u32, block).await?;
            }
            let _ = progress.send(ProgressSnapshot {
                current_subprogress: (((chunk_idx + 1) * 100) / total_chunks.max(1)) as u8,
                completed_units: chunk_idx as u32 + 1,
                total_units: total_chunks as u32,
                current_type: None,
                phase: Phase::Updating,
                error_text: None,
            });
        }
        Ok(())
    }

    /// Step 5: an app-layer command that restarts the ESP out of the
    /// ROM bootloader and into the just-flashed application.
    pub async fn boot_to_app(&self) -> Result<(), EspError> {
        self.transport
            .write(encode(ESP_BOOT_APP, 0, BROADCAST_ID, &[0u8; 8]).as_bytes())
            .await?;
        Ok(())
    }

    /// Step 6: writes then verifies an 8-byte ASCII version tag.
    pub async fn set_version_tag(&self, version: &str) -> Result<(), EspError> {
        let mut padded = [0u8; 8];
        let bytes = version.as_bytes();
        let take = bytes.len().min(8);
        padded[8 - take..].copy_from_slice(&bytes[..take]);
        self.transport
            .write(encode(ESP_BOOT_APP, ESP_SET_VERSION_SUBCMD as u16, BROADCAST_ID, &padded).as_bytes())
            .await?;
        self.transport
            .write(encode(ESP_BOOT_APP, ESP_GET_VERSION_SUBCMD as u16, BROADCAST_ID, &[0u8; 8]).as_bytes())
            .await?;
        Ok(())
    }

    /// Runs the full session in order: sync, attach, set-param, chunked
    /// flash, boot-to-app, version tag.
    pub async fn run(
        &self,
        images: &EspAppImages,
        version: &str,
        progress: &watch::Sender<ProgressSnapshot>,
    ) -> Result<(), EspError> {
        log::info!("starting esp bootloader session, target version {version}");
        self.enter_passthrough().await?;
        sleep(Duration::from_millis(100)).await;
        self.sync().await?;
        self.flash_attach().await?;
        self.set_flash_param().await?;
        self.flash_images(images, progress).await?;
        self.boot_to_app().await?;
        self.set_version_tag(version).await?;
        Ok(())
    }
}

fn image_bytes<'a>(images: &'a EspAppImages, name: &str) -> &'a [u8] {
    match name {
        "bootloader" => &images.bootloader,
        "partitions" => &images.partitions,
        "ota_data_initial" => &images.ota_data_initial,
        "modi_ota_factory" => &images.modi_ota_factory,
        "esp32" => &images.esp32,
        _ => &[],
    }
}

fn image_len(images: &EspAppImages, name: &str) -> usize {
    image_bytes(images, name).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slip_encode_escapes_end_and_esc_bytes() {
        let data = [slip::END, slip::ESC, 0x01];
        let encoded = slip::encode(&data);
        assert_eq!(
            encoded,
            vec![
                slip::END,
                slip::ESC,
                slip::ESC_END,
                slip::ESC,
                slip::ESC_ESC,
                0x01,
                slip::END
            ]
        );
    }

    #[test]
    fn slip_decode_is_the_inverse_of_encode_on_arbitrary_bytes() {
        let data: Vec<u8> = (0u8..=255).collect();
        let encoded = slip::encode(&data);
        let decoded = slip::decode(&encoded);
        assert_eq!(decoded, data);
    }

    #[test]
    fn flash_begin_num_blocks_matches_block_count_formula() {
        let size: u32 = 1172; // not a multiple of 512
        let expected_blocks = size.div_ceil(512);
        assert_eq!(expected_blocks, 3);
    }

    #[test]
    fn flash_data_checksum_is_magic_xor_every_byte() {
        let data = [1u8, 2, 3, 4];
        let checksum = data.iter().fold(ESP_CHECKSUM_MAGIC, |acc, &b| acc ^ b);
        assert_eq!(checksum, 0xEF ^ 1 ^ 2 ^ 3 ^ 4);
    }

    #[test]
    fn chunk_count_for_the_documented_image_size() {
        let total_len: usize = 1_172_032;
        let chunks = total_len.div_ceil(ESP_FLASH_CHUNK);
        assert_eq!(chunks, 72);
    }
}
