//! RTCM v3 framing.
//!
//! Frame layout:
//!
//! ```text
//! D3 | 6 reserved bits + 10-bit length (BE) | payload | CRC-24Q (BE)
//! ```
//!
//! The payload starts with a 12-bit message number. Station-bearing
//! messages carry a 12-bit reference station id directly after it.
//!
//! [`scan_frame`] is the single frame scanner for the crate: the stream
//! demultiplexer and the NTRIP statistics both use it, so identical bytes
//! always produce identical frame counts.

use super::crc::crc24q;

/// RTCM v3 frame preamble
pub const PREAMBLE: u8 = 0xD3;

/// Bytes before the payload (preamble + length)
pub const HEADER_LEN: usize = 3;

/// CRC-24Q trailer size
pub const CRC_LEN: usize = 3;

/// Largest payload the 10-bit length field can describe
pub const MAX_PAYLOAD_LEN: usize = 1023;

/// MSB-first reader over a byte slice.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current position in bits
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bits left to read
    pub fn remaining(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    /// Read up to 64 bits as an unsigned big-endian value.
    ///
    /// Returns `None` without advancing if not enough bits remain.
    pub fn read(&mut self, bits: usize) -> Option<u64> {
        if bits > 64 || bits > self.remaining() {
            return None;
        }
        let mut value: u64 = 0;
        for _ in 0..bits {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            value = (value << 1) | bit as u64;
            self.pos += 1;
        }
        Some(value)
    }

    /// Read a two's-complement signed value
    pub fn read_signed(&mut self, bits: usize) -> Option<i64> {
        let raw = self.read(bits)?;
        if bits == 0 || bits == 64 {
            return Some(raw as i64);
        }
        let sign = 1u64 << (bits - 1);
        Some(if raw & sign != 0 {
            (raw as i64) - (1i64 << bits)
        } else {
            raw as i64
        })
    }
}

/// Whether a message number carries a reference station id after it
pub fn has_station_id(message_id: u16) -> bool {
    match message_id {
        1005 | 1006 | 1007 | 1008 | 1019 | 1020 | 1033 | 1230 => true,
        // MSM1..MSM7 for every constellation
        1071..=1137 => matches!(message_id % 10, 1..=7),
        _ => false,
    }
}

/// Header fields decoded from a complete frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcmHeader {
    /// 12-bit message number (0 if the payload is shorter than 12 bits)
    pub message_id: u16,
    /// Reference station id for station-bearing messages
    pub station_id: Option<u16>,
    /// Payload length from the 10-bit length field
    pub length: u16,
    /// Whether the CRC-24Q trailer matched
    pub crc_ok: bool,
}

/// Result of scanning a buffer that starts with the RTCM preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanResult {
    /// A complete frame of `frame_len` bytes starts at offset 0
    Frame {
        header: RtcmHeader,
        frame_len: usize,
    },
    /// The frame is not fully buffered yet
    NeedMore,
    /// Byte 0 is not a usable preamble; discard exactly one byte
    Invalid,
}

/// Decode the message number and station id from a frame payload
pub fn decode_payload_header(payload: &[u8]) -> (u16, Option<u16>) {
    let mut reader = BitReader::new(payload);
    let message_id = reader.read(12).unwrap_or(0) as u16;
    let station_id = if has_station_id(message_id) {
        reader.read(12).map(|v| v as u16)
    } else {
        None
    };
    (message_id, station_id)
}

/// Scan one RTCM frame at the start of `buf`.
///
/// The buffer is expected to start with [`PREAMBLE`]; anything else is
/// reported as [`ScanResult::Invalid`]. A zero or oversized length also
/// marks the preamble as spurious.
pub fn scan_frame(buf: &[u8]) -> ScanResult {
    if buf.first() != Some(&PREAMBLE) {
        return ScanResult::Invalid;
    }
    if buf.len() < HEADER_LEN {
        return ScanResult::NeedMore;
    }

    let length = (((buf[1] & 0x03) as usize) << 8) | buf[2] as usize;
    if length == 0 || length > MAX_PAYLOAD_LEN {
        return ScanResult::Invalid;
    }

    let frame_len = HEADER_LEN + length + CRC_LEN;
    if buf.len() < frame_len {
        return ScanResult::NeedMore;
    }

    let body = &buf[..HEADER_LEN + length];
    let trailer = &buf[HEADER_LEN + length..frame_len];
    let expected =
        ((trailer[0] as u32) << 16) | ((trailer[1] as u32) << 8) | trailer[2] as u32;
    let crc_ok = crc24q(body) == expected;

    let (message_id, station_id) = decode_payload_header(&buf[HEADER_LEN..HEADER_LEN + length]);

    ScanResult::Frame {
        header: RtcmHeader {
            message_id,
            station_id,
            length: length as u16,
            crc_ok,
        },
        frame_len,
    }
}

/// Wrap a payload into a complete frame with a valid CRC
#[cfg(test)]
pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![
        PREAMBLE,
        ((payload.len() >> 8) & 0x03) as u8,
        (payload.len() & 0xFF) as u8,
    ];
    frame.extend_from_slice(payload);
    let crc = crc24q(&frame);
    frame.extend_from_slice(&[(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]);
    frame
}

/// Build a payload that starts with a 12-bit message id (and station id)
#[cfg(test)]
pub(crate) fn test_payload(message_id: u16, station_id: u16, len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len.max(3)];
    payload[0] = (message_id >> 4) as u8;
    payload[1] = ((message_id & 0x0F) << 4) as u8 | ((station_id >> 8) & 0x0F) as u8;
    payload[2] = (station_id & 0xFF) as u8;
    payload
}
