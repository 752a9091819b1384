//! TRACKSTAT (message 83): receiver channel tracking status.
//!
//! ```text
//! sol_status u32 | pos_type u32 | cutoff f32 | num_channels u32
//! num_channels x 40-byte channel record
//! ```

use bytes::Buf;
use std::collections::BTreeMap;

use super::{DecodedField, DecodedMessage, FieldValue};
use crate::error::ParseError;

pub const MESSAGE_ID: u16 = 83;
pub const SCHEMA_KEY: &str = "TRACKSTAT";

const FIXED_LEN: usize = 16;
const CHANNEL_LEN: usize = 40;

/// Satellite system from bits 16-18 of the channel tracking status word
fn satellite_system(status: u32) -> &'static str {
    match (status >> 16) & 0x07 {
        0 => "GPS",
        1 => "GLONASS",
        2 => "SBAS",
        3 => "GALILEO",
        4 => "BEIDOU",
        5 => "QZSS",
        6 => "NAVIC",
        _ => "OTHER",
    }
}

fn read_channel(mut buf: &[u8]) -> FieldValue {
    let prn = buf.get_u16_le();
    let glofreq = buf.get_i16_le();
    let status = buf.get_u32_le();
    let psr = buf.get_f64_le();
    let doppler = buf.get_f32_le();
    let cno = buf.get_f32_le();
    let locktime = buf.get_f32_le();
    let psr_res = buf.get_f32_le();
    let reject = buf.get_u32_le();
    let psr_weight = buf.get_f32_le();

    let mut record = BTreeMap::new();
    record.insert("prn".to_string(), FieldValue::UInt(prn as u64));
    record.insert("glofreq".to_string(), FieldValue::Int(glofreq as i64));
    record.insert("ch_tr_status".to_string(), FieldValue::UInt(status as u64));
    record.insert(
        "tracking_state".to_string(),
        FieldValue::UInt((status & 0x1F) as u64),
    );
    record.insert(
        "system".to_string(),
        FieldValue::Text(satellite_system(status).to_string()),
    );
    record.insert("psr".to_string(), FieldValue::Float(psr));
    record.insert("doppler".to_string(), FieldValue::Float(doppler as f64));
    record.insert("cno".to_string(), FieldValue::Float(cno as f64));
    record.insert("locktime".to_string(), FieldValue::Float(locktime as f64));
    record.insert("psr_res".to_string(), FieldValue::Float(psr_res as f64));
    record.insert("reject".to_string(), FieldValue::UInt(reject as u64));
    record.insert("psr_weight".to_string(), FieldValue::Float(psr_weight as f64));
    FieldValue::Record(record)
}

/// Decode a TRACKSTAT payload
pub fn decode(payload: &[u8]) -> Result<DecodedMessage, ParseError> {
    if payload.len() < FIXED_LEN {
        return Err(ParseError::TooShort {
            expected: FIXED_LEN,
            actual: payload.len(),
        });
    }

    let mut buf = payload;
    let sol_status = buf.get_u32_le();
    let pos_type = buf.get_u32_le();
    let cutoff = buf.get_f32_le();
    let num_channels = buf.get_u32_le() as usize;

    let required = num_channels
        .checked_mul(CHANNEL_LEN)
        .and_then(|n| n.checked_add(FIXED_LEN))
        .unwrap_or(usize::MAX);
    if payload.len() < required {
        return Err(ParseError::TooShort {
            expected: required,
            actual: payload.len(),
        });
    }

    let channels = payload[FIXED_LEN..required]
        .chunks_exact(CHANNEL_LEN)
        .map(read_channel)
        .collect();

    let mut message = DecodedMessage::new(SCHEMA_KEY, MESSAGE_ID);
    let mut insert = |name: &str, value: FieldValue, unit: Option<&str>| {
        message.fields.insert(
            name.to_string(),
            DecodedField {
                value,
                unit: unit.map(str::to_string),
                note: None,
            },
        );
    };
    insert("sol_status", FieldValue::UInt(sol_status as u64), None);
    insert("pos_type", FieldValue::UInt(pos_type as u64), None);
    insert("cutoff", FieldValue::Float(cutoff as f64), Some("deg"));
    insert("num_channels", FieldValue::UInt(num_channels as u64), None);
    insert("channels", FieldValue::List(channels), None);
    Ok(message)
}
