//! Command bytes and module-state constants shared by the module,
//! network, and coordinator layers (§6's command table).

/// Broadcast destination id.
pub const BROADCAST_ID: u16 = 0xFFF;

/// Inbound: a newly-powered module's request-uuid echo.
pub const CMD_REQUEST_UUID_ECHO: u8 = 0x00;
/// Inbound: uuid announcement, `uuid(6) + version(2)`.
pub const CMD_UUID_ANNOUNCE: u8 = 0x05;
/// Outbound: request-module-id, payload `0xFF 0x0F`.
pub const CMD_REQUEST_MODULE_ID: u8 = 0x08;
/// Outbound: set-module-state, payload `state(1) + pnp(1)`.
pub const CMD_SET_MODULE_STATE: u8 = 0x09;
/// Inbound: warning, payload `uuid(6) + type(1) [+ section(1) + bootver(2)]`.
pub const CMD_WARNING: u8 = 0x0A;
/// Outbound: firmware-data, 8 raw bytes, sequence number in `s`.
pub const CMD_FIRMWARE_DATA: u8 = 0x0B;
/// Inbound: firmware-state, stream state at payload byte 4.
pub const CMD_FIRMWARE_STATE: u8 = 0x0C;
/// Outbound: firmware-command (erase/crc), payload `crc_or_count(4) + addr(4)`.
pub const CMD_FIRMWARE_COMMAND: u8 = 0x0D;
/// Outbound: change-type, payload is the target uuid, 8 bytes little-endian.
pub const CMD_CHANGE_TYPE: u8 = 0x0E;
/// Outbound: request-network-id, payload `0xFF 0x0F`.
pub const CMD_REQUEST_NETWORK_ID: u8 = 0x28;
/// Outbound: enter-esp-passthrough, payload `0x00`.
pub const CMD_ENTER_ESP_PASSTHROUGH: u8 = 0x2B;
/// Outbound: select-swu-mode, payload `mode(1) + legacy(1)`.
pub const CMD_SELECT_SWU_MODE: u8 = 0x2C;
/// Outbound: set-network-module-state, payload `state(1) + pnp(1)`.
pub const CMD_SET_NETWORK_MODULE_STATE: u8 = 0xA4;

/// `set-module-state` state values.
pub mod module_state {
    /// Running normally.
    pub const RUN: u8 = 0;
    /// Warning condition active.
    pub const WARNING: u8 = 1;
    /// Forced pause.
    pub const FORCED_PAUSE: u8 = 2;
    /// Stopped on error.
    pub const ERROR_STOP: u8 = 3;
    /// Enter update-firmware mode.
    pub const UPDATE_FIRMWARE: u8 = 4;
    /// Signal the module its firmware update may proceed.
    pub const UPDATE_FIRMWARE_READY: u8 = 5;
    /// Reboot.
    pub const REBOOT: u8 = 6;
}

/// Plug-and-play flag values carried alongside a state command.
pub mod pnp {
    /// Plug-and-play on.
    pub const ON: u8 = 1;
    /// Plug-and-play off.
    pub const OFF: u8 = 2;
}

/// `firmware-state` stream-state codes (payload byte 4 of command `0x0C`).
pub mod stream_state {
    /// CRC check failed.
    pub const CRC_ERROR: u8 = 4;
    /// CRC check passed.
    pub const CRC_COMPLETE: u8 = 5;
    /// Erase failed.
    pub const ERASE_ERROR: u8 = 6;
    /// Erase completed.
    pub const ERASE_COMPLETE: u8 = 7;
}

/// `firmware-command` sub-command values, packed into the high byte of `s`.
pub mod fw_subcmd {
    /// CRC check of a just-streamed page.
    pub const CRC: u8 = 1;
    /// Erase a page before streaming it.
    pub const ERASE: u8 = 2;
}
