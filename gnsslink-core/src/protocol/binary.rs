//! Vendor binary log framing.
//!
//! ```text
//! AA 44 12 | headerLen(u8) | msgId(u16 LE) @4 | ... | payloadLen(u16 LE) @8 | ...
//!          | payload @headerLen | crc32(u32 LE)
//! ```
//!
//! The CRC covers header and payload and uses [`crc32_block`].

use super::crc::crc32_block;
use crate::error::ParseError;

/// Sync bytes that start every binary log
pub const PREAMBLE: [u8; 3] = [0xAA, 0x44, 0x12];

/// Smallest header that still contains the id and length fields
pub const MIN_HEADER_LEN: usize = 10;

/// Header length emitted by current firmware
pub const STANDARD_HEADER_LEN: usize = 28;

/// CRC32 trailer size
pub const CRC_LEN: usize = 4;

/// Fixed header fields needed for framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHeader {
    pub header_len: usize,
    pub message_id: u16,
    pub payload_len: usize,
}

impl BinaryHeader {
    /// Total frame size including the CRC trailer
    pub fn frame_len(&self) -> usize {
        self.header_len + self.payload_len + CRC_LEN
    }
}

/// Parse the framing fields from the start of a buffer.
pub fn parse_header(buf: &[u8]) -> Result<BinaryHeader, ParseError> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(ParseError::TooShort {
            expected: MIN_HEADER_LEN,
            actual: buf.len(),
        });
    }
    if buf[..3] != PREAMBLE {
        return Err(ParseError::InvalidHeader {
            expected: PREAMBLE.to_vec(),
            actual: buf[..3].to_vec(),
        });
    }
    let header_len = buf[3] as usize;
    if header_len < MIN_HEADER_LEN {
        return Err(ParseError::InvalidFrame(format!(
            "header length {} below minimum {}",
            header_len, MIN_HEADER_LEN
        )));
    }
    Ok(BinaryHeader {
        header_len,
        message_id: u16::from_le_bytes([buf[4], buf[5]]),
        payload_len: u16::from_le_bytes([buf[8], buf[9]]) as usize,
    })
}

/// Verify the CRC trailer of a complete frame.
///
/// Returns the trailer value and whether it matched.
pub fn check_crc(frame: &[u8]) -> (u32, bool) {
    if frame.len() < CRC_LEN {
        return (0, false);
    }
    let split = frame.len() - CRC_LEN;
    let trailer = u32::from_le_bytes([
        frame[split],
        frame[split + 1],
        frame[split + 2],
        frame[split + 3],
    ]);
    (trailer, crc32_block(&frame[..split]) == trailer)
}

/// Build a complete frame with a standard-length header.
///
/// Used to inject logs in tests and by tools replaying recorded payloads.
pub fn build_frame(message_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; STANDARD_HEADER_LEN];
    frame[..3].copy_from_slice(&PREAMBLE);
    frame[3] = STANDARD_HEADER_LEN as u8;
    frame[4..6].copy_from_slice(&message_id.to_le_bytes());
    frame[8..10].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    let crc = crc32_block(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_parse_header() {
        let frame = build_frame(42, &[1, 2, 3, 4]);
        let header = parse_header(&frame).unwrap();
        assert_eq!(header.header_len, 28);
        assert_eq!(header.message_id, 42);
        assert_eq!(header.payload_len, 4);
        assert_eq!(header.frame_len(), frame.len());
        assert!(check_crc(&frame).1);
    }

    #[test]
    fn test_parse_header_too_short() {
        assert_eq!(
            parse_header(&PREAMBLE),
            Err(ParseError::TooShort {
                expected: 10,
                actual: 3
            })
        );
    }

    #[test]
    fn test_parse_header_wrong_preamble() {
        let mut frame = build_frame(1, &[]);
        frame[2] = 0x13;
        assert!(matches!(
            parse_header(&frame),
            Err(ParseError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_check_crc_detects_flipped_payload() {
        let mut frame = build_frame(101, &[9, 8, 7]);
        frame[STANDARD_HEADER_LEN + 1] ^= 0x40;
        assert!(!check_crc(&frame).1);
    }
}
