//! Typed error kinds for each boundary the engine exposes.
//!
//! Library-internal code returns one of these so a caller other than
//! the CLI can match on kind; the CLI flattens everything into
//! [`anyhow::Error`] at its own boundary.

use crate::catalog::ModuleType;

/// Errors raised while enumerating or talking to a serial transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The port exists but is already held by another process.
    #[error("port busy")]
    PortBusy,
    /// No matching gateway is attached.
    #[error("no gateway present")]
    NotPresent,
    /// The underlying OS call failed.
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
    /// The transport was closed and the operation cannot proceed.
    #[error("transport closed")]
    Closed,
}

/// Errors raised resolving a firmware blob or manifest.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No binary exists for the requested `(type, section, version)`.
    #[error("missing firmware blob: {module_type:?} {section:?} {version}")]
    Missing {
        /// Module type the lookup was for.
        module_type: ModuleType,
        /// Section the lookup was for.
        section: crate::catalog::Section,
        /// Version string the lookup was for.
        version: String,
    },
    /// Reading the manifest or a blob from disk failed.
    #[error("firmware store io error: {0}")]
    Io(#[from] std::io::Error),
    /// The manifest file was not valid JSON.
    #[error("firmware manifest parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised driving the module/network page-flashing loop.
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    /// A section was abandoned after exhausting its retry budget.
    #[error("section {section:?} aborted after {retries} retries")]
    SectionAborted {
        /// Section that was aborted.
        section: crate::catalog::Section,
        /// Number of retries attempted before giving up.
        retries: u8,
    },
    /// A module exhausted its retry budget across sections.
    #[error("module {uuid:#x} entered error state")]
    ModuleError {
        /// UUID of the failed module.
        uuid: u64,
    },
    /// A command response did not arrive before its deadline.
    #[error("timed out waiting for firmware state response")]
    Timeout,
    /// A state frame reported an explicit protocol error code.
    #[error("protocol error code {0:#x}")]
    ProtocolError(u8),
    /// No modules were discovered before the discovery window closed.
    #[error("no modules discovered")]
    NoModules,
    /// The firmware store could not resolve a binary.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised during an ESP SLIP bootloader session.
#[derive(Debug, thiserror::Error)]
pub enum EspError {
    /// The sync packet was not acknowledged before its deadline.
    #[error("esp sync timed out")]
    Sync,
    /// A reply's command byte did not match the request.
    #[error("esp protocol mismatch: expected cmd {expected_cmd:#x}, got {got_cmd:#x}")]
    Protocol {
        /// Command byte that was sent.
        expected_cmd: u8,
        /// Command byte the reply actually carried.
        got_cmd: u8,
    },
    /// A reply's status byte was not `0x01`.
    #[error("esp reported bad status {0:#x}")]
    BadStatus(u8),
    /// No reply arrived before the session deadline.
    #[error("esp session timed out")]
    Timeout,
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised by the multi-gateway coordinator itself, as opposed to
/// any one gateway's flasher.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Enumeration found zero eligible gateways.
    #[error("No MODI port is connected")]
    NoGateways,
}
