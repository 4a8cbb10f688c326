//! Serial frame layout and timing
//!
//! Every framed message is a 20-byte header followed by the payload:
//!
//! ```text
//! [opcode:u32 LE] [payload_len:u32 LE] [timeout_ms:u32 LE]
//! [payload_crc32:u32 LE] [header_crc32:u32 LE]
//! ```
//!
//! `header_crc32` covers the first 16 header bytes. Opcodes encode
//! direction and logical channel: `100 + channel` writes toward the node,
//! `200 + channel` reads from it.

use crate::codec::{BytesReader, BytesWriter};
use crate::connector::Channel;
use crate::error::{Error, Result};
use std::time::Duration;

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 20;

/// Opcode base for writes toward the node
pub const BASE_WRITE: u32 = 100;

/// Opcode base for reads from the node
pub const BASE_READ: u32 = 200;

/// Extra wait granted to the receiver to process a frame and answer
pub const ACK_MARGIN: Duration = Duration::from_millis(250);

/// Floor for the per-packet transfer timeout
pub const MIN_PACKET_TIMEOUT: Duration = Duration::from_millis(100);

/// Opcode for writing `channel`
pub fn write_opcode(channel: Channel) -> u32 {
    BASE_WRITE + channel as u32
}

/// Opcode for reading `channel`
pub fn read_opcode(channel: Channel) -> u32 {
    BASE_READ + channel as u32
}

/// CRC32 (IEEE 802.3, reflected, poly 0xEDB88320), bitwise
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Time budget for one frame on the wire.
///
/// Transfer time at `bitrate` with a 4x safety factor, floored at
/// [`MIN_PACKET_TIMEOUT`].
pub fn packet_timeout(frame_len: usize, bitrate: u32) -> Duration {
    let bits = frame_len as u64 * 8;
    let millis = bits * 1000 * 4 / bitrate.max(1) as u64;
    MIN_PACKET_TIMEOUT.max(Duration::from_millis(millis))
}

/// Parsed frame header (the trailing header CRC already validated)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Direction base + channel
    pub opcode: u32,
    /// Payload bytes following the header
    pub payload_len: u32,
    /// Sender's processing budget hint
    pub timeout_ms: u32,
    /// CRC32 of the payload
    pub payload_crc32: u32,
}

/// Build a complete frame: header (with both CRCs) + payload
pub fn encode_frame(opcode: u32, timeout_ms: u32, payload: &[u8]) -> Vec<u8> {
    let mut w = BytesWriter::with_capacity(HEADER_SIZE + payload.len());
    w.write_u32(opcode);
    w.write_u32(payload.len() as u32);
    w.write_u32(timeout_ms);
    w.write_u32(crc32(payload));
    let header_crc = crc32(&w.as_bytes()[..16]);
    w.write_u32(header_crc);
    w.write_bytes(payload);
    w.into_bytes()
}

/// Parse and validate a 20-byte header
pub fn parse_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::OutOfRange(format!(
            "header needs {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }
    let expected = crc32(&bytes[..16]);
    let mut r = BytesReader::new(bytes);
    let opcode = r.read_u32()?;
    let payload_len = r.read_u32()?;
    let timeout_ms = r.read_u32()?;
    let payload_crc32 = r.read_u32()?;
    let header_crc32 = r.read_u32()?;

    if header_crc32 != expected {
        return Err(Error::ChecksumMismatch {
            expected,
            actual: header_crc32,
        });
    }

    Ok(Header {
        opcode,
        payload_len,
        timeout_ms,
        payload_crc32,
    })
}

/// Check a received payload against its header's CRC
pub fn verify_payload(header: &Header, payload: &[u8]) -> Result<()> {
    let actual = crc32(payload);
    if actual != header.payload_crc32 {
        return Err(Error::ChecksumMismatch {
            expected: header.payload_crc32,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vectors() {
        // Standard check value for "123456789"
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn frame_round_trip() {
        let payload = b"hello node";
        let frame = encode_frame(write_opcode(Channel::Device), 500, payload);
        assert_eq!(frame.len(), HEADER_SIZE + payload.len());

        let header = parse_header(&frame).unwrap();
        assert_eq!(header.opcode, 101);
        assert_eq!(header.payload_len, payload.len() as u32);
        assert_eq!(header.timeout_ms, 500);
        verify_payload(&header, payload).unwrap();
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let mut frame = encode_frame(write_opcode(Channel::Network), 100, b"x");
        frame[0] ^= 0xFF;
        assert!(matches!(
            parse_header(&frame),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let mut frame = encode_frame(write_opcode(Channel::Network), 100, b"abcdef");
        let header = parse_header(&frame).unwrap();
        frame[HEADER_SIZE] ^= 0x01;
        assert!(matches!(
            verify_payload(&header, &frame[HEADER_SIZE..]),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn opcode_bases() {
        assert_eq!(write_opcode(Channel::Network), 100);
        assert_eq!(write_opcode(Channel::Device), 101);
        assert_eq!(write_opcode(Channel::Clock), 102);
        assert_eq!(read_opcode(Channel::Network), 200);
        assert_eq!(read_opcode(Channel::Clock), 202);
    }

    #[test]
    fn packet_timeout_floors_and_scales() {
        // Tiny frame stays at the floor
        assert_eq!(packet_timeout(10, 115_200), Duration::from_millis(100));
        // 115200 baud, 14400 bytes/s: 36000 bytes = 2.5 s, times 4 = 10 s
        assert_eq!(packet_timeout(36_000, 115_200), Duration::from_millis(10_000));
    }
}
