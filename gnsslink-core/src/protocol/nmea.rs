//! NMEA 0183 sentence parsing.
//!
//! Format: `$<talker:2><type:3>,<field>,...[*<checksum>]`

use super::split_fields;
use crate::error::ParseError;

/// A parsed NMEA sentence
#[derive(Debug, Clone, PartialEq)]
pub struct NmeaSentence {
    /// Two-letter talker id (e.g. "GP", "GN")
    pub talker: String,
    /// Three-letter sentence type (e.g. "GGA")
    pub sentence_type: String,
    /// Fields after the address, without the checksum
    pub fields: Vec<String>,
    /// `None` when the sentence carries no checksum
    pub checksum_ok: Option<bool>,
}

impl NmeaSentence {
    /// Talker plus type, e.g. "GPGGA"
    pub fn address(&self) -> String {
        format!("{}{}", self.talker, self.sentence_type)
    }
}

/// XOR checksum over the characters between `$` and `*`
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Parse a `$`-prefixed sentence. Checksums are reported, not enforced.
pub fn parse_sentence(line: &str) -> Result<NmeaSentence, ParseError> {
    let line = line.trim();
    let body_with_sum = line
        .strip_prefix('$')
        .ok_or_else(|| ParseError::MalformedSentence(line.to_string()))?;

    let (body, checksum_ok) = match body_with_sum.rsplit_once('*') {
        Some((body, sum)) => {
            let ok = u8::from_str_radix(sum.trim(), 16)
                .map(|expected| expected == checksum(body))
                .unwrap_or(false);
            (body, Some(ok))
        }
        None => (body_with_sum, None),
    };

    let (address, rest) = match body.split_once(',') {
        Some((address, rest)) => (address, Some(rest)),
        None => (body, None),
    };
    if address.len() < 5 || !address.is_ascii() {
        return Err(ParseError::MalformedSentence(line.to_string()));
    }

    // Proprietary addresses ($PXXXX) keep everything after the talker as type
    let split = address.len() - 3;
    Ok(NmeaSentence {
        talker: address[..split].to_string(),
        sentence_type: address[split..].to_string(),
        fields: rest.map(split_fields).unwrap_or_default(),
        checksum_ok,
    })
}

/// Whether a line is a GGA sentence from any talker
pub fn is_gga(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with('$') && line.get(3..7) == Some("GGA,")
}
