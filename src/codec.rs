//! Encode/decode the JSON line frame used on the module bus, and the
//! little-endian packing helpers used inside its payload.

use base64::Engine;
use serde::{Deserialize, Serialize};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// A decoded bus frame: command, source/sub field, destination, and
/// raw payload bytes (already base64-decoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command byte.
    pub command: u8,
    /// Source id, or a sub-command packed into the high byte.
    pub sid: u16,
    /// Destination id (12-bit bus address, or a broadcast sentinel).
    pub did: u16,
    /// Decoded payload, at most 8 bytes.
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    c: u8,
    s: u16,
    d: u16,
    b: String,
    l: u8,
}

/// Encodes a frame as the compact JSON line the module bus expects.
///
/// `payload` must be 8 bytes or fewer; longer payloads are truncated to
/// their first 8 bytes since no frame on the bus ever carries more.
pub fn encode(command: u8, sid: u16, did: u16, payload: &[u8]) -> String {
    let payload = if payload.len() > 8 { &payload[..8] } else { payload };
    let wire = WireFrame {
        c: command,
        s: sid,
        d: did,
        b: B64.encode(payload),
        l: payload.len() as u8,
    };
    serde_json::to_string(&wire).expect("wire frame always serializes")
}

/// Decodes exactly one frame from a `{`-to-`}` delimited JSON slice.
///
/// Returns `None` on any parse failure or base64 failure; callers must
/// drop malformed frames silently rather than treat them as fatal.
pub fn decode(frame_bytes: &[u8]) -> Option<Frame> {
    let wire: WireFrame = serde_json::from_slice(frame_bytes).ok()?;
    let payload = B64.decode(wire.b).ok()?;
    Some(Frame {
        command: wire.c,
        sid: wire.s,
        did: wire.d,
        payload,
    })
}

/// Accumulates raw transport bytes and extracts complete `{`…`}` frames.
///
/// Bytes before the first `{` are discarded; malformed frames between
/// valid delimiters are dropped silently so one bad frame never stalls
/// the stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read transport bytes to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pulls the next complete frame out of the buffer, if any.
    ///
    /// Loops past malformed frames internally; returns `None` only when
    /// no complete `{`…`}` span remains in the buffer.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let start = self.buffer.iter().position(|&b| b == b'{')?;
            let end = self.buffer[start..].iter().position(|&b| b == b'}')?;
            let end = start + end;
            let frame_bytes = self.buffer[start..=end].to_vec();
            self.buffer.drain(..=end);
            if let Some(frame) = decode(&frame_bytes) {
                return Some(frame);
            }
            // Malformed: drop and keep scanning the remaining buffer.
        }
    }
}

/// Reads a little-endian `u16` at `offset` within `data`.
pub fn unpack_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Reads a little-endian `u32` at `offset` within `data`.
pub fn unpack_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Reads a little-endian 48-bit unsigned integer (a module UUID) at
/// `offset` within `data`.
pub fn unpack_u48_le(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(&data[offset..offset + 6]);
    u64::from_le_bytes(bytes)
}

/// Writes a little-endian `u32` into `buf` at `offset`.
pub fn pack_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Writes a little-endian `u16` into `buf` at `offset`.
pub fn pack_u16_le(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let line = encode(0x0D, 0x0201, 0xFFF, &payload);
        let frame = decode(line.as_bytes()).unwrap();
        assert_eq!(frame.command, 0x0D);
        assert_eq!(frame.sid, 0x0201);
        assert_eq!(frame.did, 0xFFF);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn frame_round_trip_with_brace_bytes_in_payload() {
        let payload = [b'{', b'}', 0, 0, 0, 0, 0, 0];
        let line = encode(0x0B, 0, 1, &payload);
        let frame = decode(line.as_bytes()).unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn frame_reader_skips_malformed_frame() {
        let mut reader = FrameReader::new();
        let good1 = encode(0x05, 0, 0, &[1, 2, 3]);
        let good2 = encode(0x0A, 0, 0, &[4, 5, 6]);
        let mut stream = Vec::new();
        stream.extend_from_slice(good1.as_bytes());
        stream.extend_from_slice(b"{\"c\":\"oops\"}");
        stream.extend_from_slice(good2.as_bytes());
        reader.feed(&stream);

        let first = reader.next_frame().unwrap();
        assert_eq!(first.command, 0x05);
        let second = reader.next_frame().unwrap();
        assert_eq!(second.command, 0x0A);
        assert!(reader.next_frame().is_none());
    }

    #[test]
    fn frame_reader_waits_for_incomplete_frame() {
        let mut reader = FrameReader::new();
        reader.feed(b"{\"c\":5,\"s\":0");
        assert!(reader.next_frame().is_none());
        reader.feed(b",\"d\":0,\"b\":\"AQ==\",\"l\":1}");
        assert!(reader.next_frame().is_some());
    }

    #[test]
    fn unpack_helpers_read_little_endian() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        assert_eq!(unpack_u16_le(&data, 0), 0x0201);
        assert_eq!(unpack_u32_le(&data, 0), 0x0403_0201);
        assert_eq!(unpack_u48_le(&data, 0), 0x0000_0605_0403_0201);
    }

    #[test]
    fn pack_helpers_write_little_endian() {
        let mut buf = [0u8; 8];
        pack_u32_le(&mut buf, 0, 0x0403_0201);
        pack_u16_le(&mut buf, 4, 0x0605);
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x00, 0x00]);
    }
}
