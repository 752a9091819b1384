//! Stream demultiplexer.
//!
//! Splits one undifferentiated receiver byte stream into vendor binary logs,
//! RTCM v3 frames and text lines. Frames are emitted in stream order;
//! checksum failures are tagged, never dropped.
//!
//! ```rust
//! use gnsslink_core::demux::{Frame, StreamDemux};
//!
//! let mut demux = StreamDemux::new();
//! let frames = demux.feed(b"$GPGGA,1,2*00\r\n");
//! assert!(matches!(&frames[0], Frame::Text(line) if line.starts_with("$GPGGA")));
//! ```

use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;

use crate::protocol::{binary, rtcm};

/// Buffer size beyond which unframeable bytes are discarded
pub const MAX_UNFRAMED: usize = 4096;

/// Bytes kept after a bounded trim (a preamble may straddle the chunk boundary)
const TRIM_KEEP: usize = 3;

/// A framed vendor binary log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryFrame {
    pub id: u16,
    #[serde(skip)]
    pub payload: Bytes,
    /// CRC32 trailer as received
    pub crc: u32,
    pub crc_ok: bool,
    /// Complete frame including header and trailer
    #[serde(skip)]
    pub raw: Bytes,
}

/// A framed RTCM v3 message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcmFrame {
    pub id: u16,
    pub station_id: Option<u16>,
    pub length: u16,
    pub crc_ok: bool,
}

/// One unit extracted from the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "frame", rename_all = "lowercase")]
pub enum Frame {
    Binary(BinaryFrame),
    Rtcm(RtcmFrame),
    /// A trimmed, non-empty text line
    Text(String),
}

/// Running counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemuxStats {
    pub binary_frames: u64,
    pub rtcm_frames: u64,
    pub text_lines: u64,
    pub crc_failures: u64,
    /// Bytes skipped while resynchronising or trimmed by the size bound
    pub discarded_bytes: u64,
}

enum Step {
    Emit(Frame),
    Continue,
    Wait,
}

#[derive(Clone, Copy)]
enum Marker {
    Binary,
    Rtcm,
    LineEnd,
}

/// Byte stream demultiplexer
#[derive(Debug, Default)]
pub struct StreamDemux {
    buffer: BytesMut,
    /// Leading bytes already known to hold no preamble or line feed
    scanned: usize,
    stats: DemuxStats,
}

impl StreamDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and extract every complete frame
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.step() {
                Step::Emit(frame) => frames.push(frame),
                Step::Continue => continue,
                Step::Wait => break,
            }
        }
        frames
    }

    /// Bytes currently held
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes (transport reconnect)
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    fn discard(&mut self, n: usize) {
        self.consumed(n);
        self.buffer.advance(n);
        self.stats.discarded_bytes += n as u64;
    }

    fn consumed(&mut self, n: usize) {
        self.scanned = self.scanned.saturating_sub(n);
    }

    /// Earliest preamble or line feed, resuming where the last search stopped
    fn next_marker(&mut self) -> Option<(usize, Marker)> {
        let start = self.scanned.min(self.buffer.len());
        let buffer = &self.buffer;
        let found = buffer[start..].iter().enumerate().find_map(|(i, &b)| {
            let pos = start + i;
            match b {
                b'\n' => Some((pos, Marker::LineEnd)),
                rtcm::PREAMBLE => Some((pos, Marker::Rtcm)),
                _ if buffer[pos..].starts_with(&binary::PREAMBLE) => Some((pos, Marker::Binary)),
                _ => None,
            }
        });
        self.scanned = match found {
            Some((pos, _)) => pos,
            // A preamble may straddle the next chunk
            None => self.buffer.len().saturating_sub(binary::PREAMBLE.len() - 1),
        };
        found
    }

    fn step(&mut self) -> Step {
        if self.buffer.is_empty() {
            return Step::Wait;
        }
        if self.buffer.starts_with(&binary::PREAMBLE) {
            return self.extract_binary();
        }

        match self.next_marker() {
            None => {
                if self.buffer.len() > MAX_UNFRAMED {
                    let excess = self.buffer.len() - TRIM_KEEP;
                    self.discard(excess);
                }
                Step::Wait
            }
            Some((pos, Marker::LineEnd)) => {
                self.consumed(pos + 1);
                let line = self.buffer.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if text.is_empty() {
                    return Step::Continue;
                }
                self.stats.text_lines += 1;
                Step::Emit(Frame::Text(text))
            }
            Some((0, Marker::Rtcm)) => self.extract_rtcm(),
            Some((pos, Marker::Rtcm | Marker::Binary)) => {
                self.discard(pos);
                Step::Continue
            }
        }
    }

    fn extract_binary(&mut self) -> Step {
        if self.buffer.len() < binary::MIN_HEADER_LEN {
            return Step::Wait;
        }
        let header = match binary::parse_header(&self.buffer) {
            Ok(header) => header,
            Err(_) => {
                // Spurious preamble
                self.discard(1);
                return Step::Continue;
            }
        };
        let frame_len = header.frame_len();
        if self.buffer.len() < frame_len {
            return Step::Wait;
        }

        self.consumed(frame_len);
        let raw = self.buffer.split_to(frame_len).freeze();
        let (crc, crc_ok) = binary::check_crc(&raw);
        if !crc_ok {
            self.stats.crc_failures += 1;
        }
        self.stats.binary_frames += 1;
        let payload = raw.slice(header.header_len..header.header_len + header.payload_len);
        Step::Emit(Frame::Binary(BinaryFrame {
            id: header.message_id,
            payload,
            crc,
            crc_ok,
            raw,
        }))
    }

    fn extract_rtcm(&mut self) -> Step {
        match rtcm::scan_frame(&self.buffer) {
            rtcm::ScanResult::NeedMore => Step::Wait,
            rtcm::ScanResult::Invalid => {
                self.discard(1);
                Step::Continue
            }
            rtcm::ScanResult::Frame { header, frame_len } => {
                self.consumed(frame_len);
                self.buffer.advance(frame_len);
                if !header.crc_ok {
                    self.stats.crc_failures += 1;
                }
                self.stats.rtcm_frames += 1;
                Step::Emit(Frame::Rtcm(RtcmFrame {
                    id: header.message_id,
                    station_id: header.station_id,
                    length: header.length,
                    crc_ok: header.crc_ok,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::binary::build_frame;
    use crate::protocol::rtcm::{encode_frame, test_payload};

    #[test]
    fn test_valid_binary_frame() {
        let mut demux = StreamDemux::new();
        let frames = demux.feed(&build_frame(42, &[1, 2, 3, 4, 5]));
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Binary(f) => {
                assert_eq!(f.id, 42);
                assert_eq!(&f.payload[..], &[1, 2, 3, 4, 5]);
                assert!(f.crc_ok);
            }
            other => panic!("expected binary frame, got {:?}", other),
        }
        assert_eq!(demux.buffered(), 0);
    }

    #[test]
    fn test_flipped_payload_byte_still_emitted() {
        let payload = [10u8, 20, 30, 40];
        for i in 0..payload.len() {
            let mut frame = build_frame(7, &payload);
            frame[binary::STANDARD_HEADER_LEN + i] ^= 0xFF;
            let mut demux = StreamDemux::new();
            let frames = demux.feed(&frame);
            assert_eq!(frames.len(), 1);
            match &frames[0] {
                Frame::Binary(f) => {
                    assert!(!f.crc_ok);
                    assert_eq!(f.id, 7);
                    assert_eq!(f.payload[i], payload[i] ^ 0xFF);
                }
                other => panic!("expected binary frame, got {:?}", other),
            }
            assert_eq!(demux.stats().crc_failures, 1);
        }
    }

    #[test]
    fn test_mixed_chunk_in_order() {
        let mut chunk = build_frame(42, &[0xD3, 0x0A, 0x00]);
        chunk.extend(encode_frame(&test_payload(1005, 2003, 19)));
        chunk.extend_from_slice(b"#TIMEA,COM1;VALID,1.0\r\n");

        let mut demux = StreamDemux::new();
        let frames = demux.feed(&chunk);
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], Frame::Binary(f) if f.id == 42 && f.crc_ok));
        assert!(matches!(
            &frames[1],
            Frame::Rtcm(f) if f.id == 1005 && f.station_id == Some(2003) && f.crc_ok
        ));
        assert_eq!(frames[2], Frame::Text("#TIMEA,COM1;VALID,1.0".to_string()));
        assert_eq!(demux.buffered(), 0);
    }

    #[test]
    fn test_split_binary_frame() {
        let frame = build_frame(101, &[0u8; 16]);
        let mut demux = StreamDemux::new();
        assert!(demux.feed(&frame[..frame.len() - 2]).is_empty());
        let frames = demux.feed(&frame[frame.len() - 2..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(demux.buffered(), 0);
    }

    #[test]
    fn test_split_rtcm_frame() {
        let frame = encode_frame(&test_payload(1077, 1, 40));
        let mut demux = StreamDemux::new();
        assert!(demux.feed(&frame[..10]).is_empty());
        let frames = demux.feed(&frame[10..]);
        assert!(matches!(&frames[..], [Frame::Rtcm(f)] if f.id == 1077));
    }

    #[test]
    fn test_empty_lines_skipped() {
        let mut demux = StreamDemux::new();
        let frames = demux.feed(b"\r\n\r\n<OK\r\n");
        assert_eq!(frames, vec![Frame::Text("<OK".to_string())]);
        assert_eq!(demux.stats().text_lines, 1);
    }

    #[test]
    fn test_partial_line_waits() {
        let mut demux = StreamDemux::new();
        assert!(demux.feed(b"$GPGGA,1,").is_empty());
        let frames = demux.feed(b"2\n");
        assert_eq!(frames, vec![Frame::Text("$GPGGA,1,2".to_string())]);
    }

    #[test]
    fn test_garbage_before_rtcm_is_discarded() {
        let mut chunk = vec![0x01, 0x02, 0x03];
        chunk.extend(encode_frame(&test_payload(1004, 0, 12)));
        let mut demux = StreamDemux::new();
        let frames = demux.feed(&chunk);
        assert_eq!(frames.len(), 1);
        assert_eq!(demux.stats().discarded_bytes, 3);
    }

    #[test]
    fn test_zero_length_rtcm_preamble_skipped() {
        let mut chunk = vec![0xD3, 0x00, 0x00];
        chunk.extend(encode_frame(&test_payload(1004, 0, 12)));
        let mut demux = StreamDemux::new();
        let frames = demux.feed(&chunk);
        assert!(matches!(&frames[..], [Frame::Rtcm(f)] if f.id == 1004 && f.crc_ok));
    }

    #[test]
    fn test_resync_to_binary_preamble() {
        let mut chunk = vec![0x55, 0x66];
        chunk.extend(build_frame(9, &[1]));
        let mut demux = StreamDemux::new();
        let frames = demux.feed(&chunk);
        assert!(matches!(&frames[..], [Frame::Binary(f)] if f.id == 9));
        assert_eq!(demux.stats().discarded_bytes, 2);
    }

    #[test]
    fn test_spurious_binary_preamble() {
        // Header length byte below the minimum header
        let mut chunk = vec![0xAA, 0x44, 0x12, 0x02, 0, 0, 0, 0, 0, 0];
        chunk.extend_from_slice(b"hello\n");
        let mut demux = StreamDemux::new();
        let frames = demux.feed(&chunk);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Text(line) => assert!(line.ends_with("hello")),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_bounded_trim() {
        let mut demux = StreamDemux::new();
        let junk = vec![0x20u8; MAX_UNFRAMED + 100];
        assert!(demux.feed(&junk).is_empty());
        assert_eq!(demux.buffered(), 3);
        assert_eq!(demux.stats().discarded_bytes, (MAX_UNFRAMED + 97) as u64);
    }

    #[test]
    fn test_many_lines_in_one_chunk() {
        let mut chunk = Vec::new();
        for i in 0..500 {
            chunk.extend_from_slice(format!("<OK {}\r\n", i).as_bytes());
        }
        let mut demux = StreamDemux::new();
        let frames = demux.feed(&chunk);
        assert_eq!(frames.len(), 500);
        assert_eq!(frames[499], Frame::Text("<OK 499".to_string()));
        assert_eq!(demux.buffered(), 0);
    }

    #[test]
    fn test_line_and_preamble_split_across_chunks() {
        let mut demux = StreamDemux::new();
        assert!(demux.feed(b"#BESTPOSA,COM1").is_empty());
        assert!(demux.feed(b";SOL_COMPUTED").is_empty());
        let frames = demux.feed(b",1.0\r\n");
        assert_eq!(frames, vec![Frame::Text("#BESTPOSA,COM1;SOL_COMPUTED,1.0".to_string())]);

        let frame = build_frame(5, &[7, 7]);
        let mut chunk = b"noise".to_vec();
        chunk.extend_from_slice(&frame[..2]);
        assert!(demux.feed(&chunk).is_empty());
        let frames = demux.feed(&frame[2..]);
        assert!(matches!(&frames[..], [Frame::Binary(f)] if f.id == 5 && f.crc_ok));
        assert_eq!(demux.stats().discarded_bytes, 5);
    }

    #[test]
    fn test_reset_drops_buffer() {
        let mut demux = StreamDemux::new();
        demux.feed(b"partial");
        assert_eq!(demux.buffered(), 7);
        demux.reset();
        assert_eq!(demux.buffered(), 0);
    }
}
