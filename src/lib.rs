//! # Firmware update engine for MODI-style modular robotics devices
//!
//! This crate flashes new firmware into a family of modular robotics
//! devices ("modules") that sit behind a USB-CDC/serial gateway device
//! (the "network module"). A host can flash:
//!
//! - general peripheral modules (buttons, sensors, motors, a display, a
//!   speaker, …) that live behind the network module on a shared bus,
//! - the network module's own application microcontroller, and
//! - a secondary microcontroller ("ESP") embedded in the network module,
//!   using the vendor ROM bootloader's SLIP-framed protocol.
//!
//! Multiple gateways can be driven in parallel from one host; see
//! [`coordinator::Coordinator`].
//!
//! # Architecture
//!
//! - [`transport`] enumerates gateways and opens a byte-stream session to one.
//! - [`codec`] frames/unframes the JSON line protocol used on the module bus.
//! - [`catalog`] maps a module's uuid to its type and back.
//! - [`crc`] implements the bootloader ROM's CRC-32/CRC-64 checksum.
//! - [`store`] resolves `(type, section, version)` to a firmware blob and
//!   its flash addressing, and loads the firmware manifest.
//! - [`module_flasher`] discovers and flashes peripheral modules (C6).
//! - [`network_flasher`] flashes the gateway's own application MCU (C7).
//! - [`esp_flasher`] runs the ESP SLIP bootloader session (C8).
//! - [`coordinator`] runs any of the above across every discovered gateway
//!   in parallel and aggregates progress (C9).
//!
//! This crate does not implement the desktop GUI, the firmware-archive
//! downloader, or the manifest editor that a full product ships with —
//! those are external collaborators that drive this engine headlessly
//! through [`coordinator::Coordinator::run`] and its `ProgressSnapshot` stream.

#![deny(missing_docs)]

pub mod catalog;
pub mod codec;
pub mod coordinator;
pub mod crc;
pub mod error;
pub mod esp_flasher;
pub mod module_flasher;
pub mod network_flasher;
pub mod progress;
pub mod store;
pub mod transport;
pub mod version;
pub mod wire;

pub use coordinator::{Coordinator, RunReport, UpdateMode};
pub use progress::{Phase, ProgressSnapshot};
