//! Bit-exact checksum functions for the two binary protocols on the stream.

/// Reflected CRC32 polynomial used by the vendor binary format
pub const CRC32_POLYNOMIAL: u32 = 0xEDB8_8320;

/// CRC-24Q polynomial used by RTCM v3
pub const CRC24Q_POLYNOMIAL: u32 = 0x0186_4CFB;

/// Vendor binary CRC32.
///
/// Initial value 0, no final XOR, processed byte-by-byte with an
/// 8-iteration bit loop. Computed over header and payload; the result is
/// stored little-endian in the 4-byte frame trailer.
pub fn crc32_block(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC32_POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// RTCM v3 CRC-24Q (24 significant bits).
///
/// MSB-first, initial value 0, masked to 24 bits on every iteration.
/// Computed over preamble, length and payload; stored big-endian in the
/// 3-byte frame trailer.
pub fn crc24q(bytes: &[u8]) -> u32 {
    let mut crc: u32 = 0;
    for &byte in bytes {
        crc ^= (byte as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24Q_POLYNOMIAL;
            }
            crc &= 0x00FF_FFFF;
        }
    }
    crc
}
