//! Receiver wire protocol implementations.
//!
//! This module contains wire format parsing and formatting for every protocol
//! that shares the receiver byte stream. All functions are pure (no I/O).
//!
//! # Structure
//!
//! - [`crc`] - CRC32 (vendor binary) and CRC-24Q (RTCM)
//! - [`binary`] - Vendor binary log header layout
//! - [`rtcm`] - RTCM v3 bit reader and the canonical frame scanner
//! - [`nmea`] - `$`-prefixed NMEA sentences
//! - [`ascii`] - `#`-prefixed vendor ASCII logs
//! - [`command`] - Device command formatting (`LOG`, `UNLOG`)
//! - [`ntrip`] - NTRIP request/status/source-table wire format
//!
//! # Example
//!
//! ```rust
//! use gnsslink_core::protocol::{crc, rtcm};
//!
//! assert_eq!(crc::crc24q(b"123456789"), 0xCDE703);
//!
//! // Truncated frame: the scanner asks for more data
//! assert_eq!(rtcm::scan_frame(&[0xD3, 0x00]), rtcm::ScanResult::NeedMore);
//! ```

pub mod ascii;
pub mod binary;
pub mod command;
pub mod crc;
pub mod nmea;
pub mod ntrip;
pub mod rtcm;

/// Helper function to extract a null-terminated, printable ASCII string from bytes
pub fn c_string(bytes: &[u8]) -> String {
    let null_pos = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..null_pos]
        .iter()
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|&b| b as char)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Split a comma-separated text body into owned fields
pub(crate) fn split_fields(body: &str) -> Vec<String> {
    body.split(',').map(|f| f.trim().to_string()).collect()
}
