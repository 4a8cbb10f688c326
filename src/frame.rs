//! Command/response frame layout and correlation-id allocation
//!
//! Request frame:  `[opcode:u8] [request_id:u32 LE] [payload…]`
//! Response frame: `[opcode:u8] [request_id:u32 LE] [error_code:u8] [payload…]`
//!
//! A non-zero `error_code` means the node rejected the request; the payload
//! layout after the error code is opcode-specific (e.g. a config response
//! carries `config_size:u32 LE` followed by that many raw bytes).

use crate::codec::{BytesReader, BytesWriter};
use crate::error::{Error, Result};

/// Correlation-id allocator.
///
/// Ids live in `[1, 2^32 − 1]`; 0 is never handed out and the counter wraps
/// back to 1 after `u32::MAX`. Owned by whichever component issues requests,
/// never a module global.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    /// Start allocating from 1
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Hand out the next id and advance, wrapping past `u32::MAX` to 1
    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = if self.next == u32::MAX { 1 } else { self.next + 1 };
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a request frame
pub fn encode_request(opcode: u8, request_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut w = BytesWriter::with_capacity(5 + payload.len());
    w.write_u8(opcode);
    w.write_u32(request_id);
    w.write_bytes(payload);
    w.into_bytes()
}

/// Parsed and validated response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Opcode echoed by the node
    pub opcode: u8,
    /// Correlation id echoed by the node
    pub request_id: u32,
    /// Opcode-specific payload after the error code
    pub payload: Vec<u8>,
}

/// Parse a response frame and check it against the originating request.
///
/// Checks, in order: opcode match (`InvalidResponseFlag`), correlation id
/// match (`InvalidResponseUuid`), error code zero (`NodeError`).
pub fn decode_response(bytes: &[u8], expected_opcode: u8, expected_id: u32) -> Result<Response> {
    let mut r = BytesReader::new(bytes);
    let opcode = r.read_u8()?;
    let request_id = r.read_u32()?;
    let error_code = r.read_u8()?;

    if opcode != expected_opcode {
        return Err(Error::InvalidResponseFlag {
            expected: expected_opcode,
            actual: opcode,
        });
    }
    if request_id != expected_id {
        return Err(Error::InvalidResponseUuid {
            expected: expected_id,
            actual: request_id,
        });
    }
    if error_code != 0 {
        return Err(Error::NodeError(error_code));
    }

    let payload = r.read_bytes(r.remaining())?.to_vec();
    Ok(Response {
        opcode,
        request_id,
        payload,
    })
}

/// Extract a size-prefixed blob (`size:u32 LE` + raw bytes) from a response
/// payload, as used by config-style reads.
pub fn decode_sized_payload(payload: &[u8]) -> Result<Vec<u8>> {
    let mut r = BytesReader::new(payload);
    let size = r.read_u32()? as usize;
    Ok(r.read_bytes(size)?.to_vec())
}

/// A peer joined the network
pub const NOTIFY_PEER_JOINED: u8 = 0xD0;
/// A peer left the network
pub const NOTIFY_PEER_LEFT: u8 = 0xD1;

/// Unsolicited node-originated notification.
///
/// Shares the inbound path with responses but is never correlated with a
/// request: the first byte is a reserved notification opcode and the rest
/// of the message is the peer's MAC address in ASCII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A peer node joined the network
    PeerJoined {
        /// MAC address of the peer
        mac: String,
    },
    /// A peer node left the network
    PeerLeft {
        /// MAC address of the peer
        mac: String,
    },
}

/// Decode an inbound message as a notification; `None` means the message
/// is a regular response and belongs to whoever is awaiting it
pub fn decode_notification(bytes: &[u8]) -> Option<Notification> {
    let mut r = BytesReader::new(bytes);
    let opcode = r.read_u8().ok()?;
    let mac = String::from_utf8(r.read_bytes(r.remaining()).ok()?.to_vec()).ok()?;
    match opcode {
        NOTIFY_PEER_JOINED => Some(Notification::PeerJoined { mac }),
        NOTIFY_PEER_LEFT => Some(Notification::PeerLeft { mac }),
        _ => None,
    }
}

/// Firmware-update control frames.
///
/// The OTA sequence is always: reset → begin → chunked write loop → end,
/// with settle delays owned by the connector driving the sequence.
pub mod ota {
    use super::BytesWriter;

    /// Reboot the node's updater
    pub const RESET: u8 = 0xE0;
    /// Start an update of a given total size (triggers flash erase)
    pub const BEGIN: u8 = 0xE1;
    /// One firmware chunk at an absolute byte offset
    pub const WRITE: u8 = 0xE2;
    /// Finish, carrying the total number of bytes written
    pub const END: u8 = 0xE3;

    /// Build the reset frame
    pub fn encode_reset() -> Vec<u8> {
        vec![RESET]
    }

    /// Build the begin frame for a firmware of `size` bytes
    pub fn encode_begin(size: u32) -> Vec<u8> {
        let mut w = BytesWriter::with_capacity(5);
        w.write_u8(BEGIN);
        w.write_u32(size);
        w.into_bytes()
    }

    /// Build a write frame for `chunk` at byte `offset`
    pub fn encode_write(offset: u32, chunk: &[u8]) -> Vec<u8> {
        let mut w = BytesWriter::with_capacity(5 + chunk.len());
        w.write_u8(WRITE);
        w.write_u32(offset);
        w.write_bytes(chunk);
        w.into_bytes()
    }

    /// Build the end frame after `written` bytes were delivered
    pub fn encode_end(written: u32) -> Vec<u8> {
        let mut w = BytesWriter::with_capacity(5);
        w.write_u8(END);
        w.write_u32(written);
        w.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_allocator_starts_at_one_and_wraps_skipping_zero() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);

        let mut ids = IdAllocator { next: u32::MAX };
        assert_eq!(ids.next_id(), u32::MAX);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn request_layout() {
        let frame = encode_request(0x42, 0x0102_0304, &[0xAA, 0xBB]);
        assert_eq!(frame, vec![0x42, 0x04, 0x03, 0x02, 0x01, 0xAA, 0xBB]);
    }

    #[test]
    fn response_round_trip() {
        // opcode 0x42, id 7, error 0, payload [1,2,3]
        let bytes = [0x42, 7, 0, 0, 0, 0x00, 1, 2, 3];
        let resp = decode_response(&bytes, 0x42, 7).unwrap();
        assert_eq!(resp.payload, vec![1, 2, 3]);
    }

    #[test]
    fn response_opcode_mismatch() {
        let bytes = [0x41, 7, 0, 0, 0, 0x00];
        assert!(matches!(
            decode_response(&bytes, 0x42, 7),
            Err(Error::InvalidResponseFlag {
                expected: 0x42,
                actual: 0x41
            })
        ));
    }

    #[test]
    fn response_id_mismatch() {
        let bytes = [0x42, 8, 0, 0, 0, 0x00];
        assert!(matches!(
            decode_response(&bytes, 0x42, 7),
            Err(Error::InvalidResponseUuid {
                expected: 7,
                actual: 8
            })
        ));
    }

    #[test]
    fn response_error_code_surfaces() {
        let bytes = [0x42, 7, 0, 0, 0, 0x05];
        assert!(matches!(
            decode_response(&bytes, 0x42, 7),
            Err(Error::NodeError(0x05))
        ));
    }

    #[test]
    fn sized_payload_extraction() {
        // size 3 + payload + trailing garbage the node may append
        let payload = [3, 0, 0, 0, 0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(
            decode_sized_payload(&payload).unwrap(),
            vec![0xDE, 0xAD, 0xBE]
        );
    }

    #[test]
    fn peer_notifications_decode() {
        let mut joined = vec![NOTIFY_PEER_JOINED];
        joined.extend_from_slice(b"AA:BB:CC:DD:EE:FF");
        assert_eq!(
            decode_notification(&joined),
            Some(Notification::PeerJoined {
                mac: "AA:BB:CC:DD:EE:FF".to_string()
            })
        );

        let mut left = vec![NOTIFY_PEER_LEFT];
        left.extend_from_slice(b"AA:BB:CC:DD:EE:FF");
        assert_eq!(
            decode_notification(&left),
            Some(Notification::PeerLeft {
                mac: "AA:BB:CC:DD:EE:FF".to_string()
            })
        );
    }

    #[test]
    fn regular_responses_are_not_notifications() {
        assert_eq!(decode_notification(&[0x42, 7, 0, 0, 0, 0x00]), None);
        assert_eq!(decode_notification(&[]), None);
    }

    #[test]
    fn ota_frames() {
        assert_eq!(ota::encode_reset(), vec![0xE0]);
        assert_eq!(ota::encode_begin(0x100), vec![0xE1, 0x00, 0x01, 0, 0]);
        assert_eq!(
            ota::encode_write(0x10, &[0xAB]),
            vec![0xE2, 0x10, 0, 0, 0, 0xAB]
        );
        assert_eq!(ota::encode_end(0x11), vec![0xE3, 0x11, 0, 0, 0]);
    }
}
