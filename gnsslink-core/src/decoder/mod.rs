//! Schema-driven decoding of binary log payloads.
//!
//! Fields are read sequentially from offset 0, little-endian, following the
//! [`MessageLayout`] found by message id. Derived fields are evaluated after
//! all declared fields with the restricted arithmetic in [`expr`].
//!
//! The track-status log ([`track_status::MESSAGE_ID`]) has a variable number
//! of fixed-size channel records and is decoded by hand.

use bytes::Buf;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::ParseError;
use crate::protocol::c_string;
use crate::schema::{FieldDef, FieldType, MessageLayout, SchemaProvider};

pub mod expr;
pub mod track_status;

/// A decoded value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
    Record(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Numeric value of a scalar number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::UInt(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value, also accepting numeric text (NMEA/ASCII fields)
    pub fn to_number(&self) -> Option<f64> {
        match self {
            FieldValue::Text(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        }
    }

    /// Integer code for reference-table lookups
    pub fn as_code(&self) -> Option<String> {
        match self {
            FieldValue::Int(v) => Some(v.to_string()),
            FieldValue::UInt(v) => Some(v.to_string()),
            FieldValue::Text(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
                let code = s.trim_start_matches('0');
                Some(if code.is_empty() { "0" } else { code }.to_string())
            }
            _ => None,
        }
    }

    /// Interpret a text field the way ASCII/NMEA logs encode numbers
    pub fn from_text(text: &str) -> FieldValue {
        if text.is_empty() {
            return FieldValue::Null;
        }
        FieldValue::Text(text.to_string())
    }
}

/// A decoded field with its schema annotations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedField {
    pub value: FieldValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl DecodedField {
    pub fn plain(value: FieldValue) -> Self {
        Self {
            value,
            unit: None,
            note: None,
        }
    }
}

/// Decoder output for one binary frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub schema_key: String,
    pub id: u16,
    pub fields: BTreeMap<String, DecodedField>,
}

impl DecodedMessage {
    fn new(schema_key: &str, id: u16) -> Self {
        Self {
            kind: "binary",
            schema_key: schema_key.to_string(),
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Field values without annotations
    pub fn values(&self) -> BTreeMap<String, FieldValue> {
        self.fields
            .iter()
            .map(|(name, field)| (name.clone(), field.value.clone()))
            .collect()
    }
}

/// Decode a binary payload.
///
/// `crc` is the verified CRC trailer of the frame, used for fields marked
/// `fromCrc`. Returns `Ok(None)` when the schema has no layout for `id`.
pub fn decode_payload(
    schema: &dyn SchemaProvider,
    id: u16,
    payload: &[u8],
    crc: u32,
) -> Result<Option<DecodedMessage>, ParseError> {
    if id == track_status::MESSAGE_ID {
        return track_status::decode(payload).map(Some);
    }
    match schema.lookup_by_id(id) {
        Some(layout) => decode_with_layout(layout, payload, crc).map(Some),
        None => Ok(None),
    }
}

/// Decode a payload with an explicit layout
pub fn decode_with_layout(
    layout: &MessageLayout,
    payload: &[u8],
    crc: u32,
) -> Result<DecodedMessage, ParseError> {
    if let Some(field) = layout
        .fields
        .iter()
        .find(|f| !f.from_crc && (f.count == 0 || f.element_size() == 0))
    {
        return Err(ParseError::InvalidFrame(format!(
            "field '{}' of {} has no wire size",
            field.name, layout.key
        )));
    }
    let required = layout.min_payload_len();
    if payload.len() < required {
        return Err(ParseError::TooShort {
            expected: required,
            actual: payload.len(),
        });
    }

    let mut message = DecodedMessage::new(&layout.key, layout.id);
    let mut offset = 0;
    for field in &layout.fields {
        let value = if field.from_crc {
            FieldValue::UInt(crc as u64)
        } else {
            let size = field.wire_size();
            let value = read_field(field, &payload[offset..offset + size]);
            offset += size;
            value
        };
        message.fields.insert(
            field.name.clone(),
            DecodedField {
                value,
                unit: field.unit.clone(),
                note: field.note.clone(),
            },
        );
    }

    for derived in &layout.derived {
        let value = {
            let fields = &message.fields;
            let lookup = |name: &str| fields.get(name).and_then(|f| f.value.as_f64());
            expr::evaluate(&derived.expr, &lookup)
        };
        message.fields.insert(
            derived.name.clone(),
            DecodedField {
                value: value.map(FieldValue::Float).unwrap_or(FieldValue::Null),
                unit: derived.unit.clone(),
                note: derived.note.clone(),
            },
        );
    }

    Ok(message)
}

/// Read one (possibly repeated) field from exactly its wire bytes
fn read_field(field: &FieldDef, bytes: &[u8]) -> FieldValue {
    let size = field.element_size();
    let mut elements: Vec<FieldValue> = bytes
        .chunks_exact(size)
        .map(|chunk| read_element(field.field_type, chunk))
        .collect();
    if field.count == 1 {
        elements.pop().unwrap_or(FieldValue::Null)
    } else {
        FieldValue::List(elements)
    }
}

fn read_element(field_type: FieldType, mut buf: &[u8]) -> FieldValue {
    match field_type {
        FieldType::U8 => FieldValue::UInt(buf.get_u8() as u64),
        FieldType::I8 => FieldValue::Int(buf.get_i8() as i64),
        FieldType::U16 => FieldValue::UInt(buf.get_u16_le() as u64),
        FieldType::I16 => FieldValue::Int(buf.get_i16_le() as i64),
        FieldType::U32 => FieldValue::UInt(buf.get_u32_le() as u64),
        FieldType::I32 => FieldValue::Int(buf.get_i32_le() as i64),
        FieldType::F32 => FieldValue::Float(buf.get_f32_le() as f64),
        FieldType::F64 => FieldValue::Float(buf.get_f64_le()),
        FieldType::Char => FieldValue::Text(c_string(buf)),
        FieldType::Bytes => FieldValue::Bytes(buf.to_vec()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::catalog::tests::TEST_CATALOG;
    use crate::schema::SchemaCatalog;

    pub(crate) fn bestpos_payload() -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&0u32.to_le_bytes());
        p.extend_from_slice(&16u32.to_le_bytes());
        p.extend_from_slice(&51.116_f64.to_le_bytes());
        p.extend_from_slice(&(-114.038_f64).to_le_bytes());
        p.extend_from_slice(&1064.5_f64.to_le_bytes());
        p.extend_from_slice(&(-16.5_f32).to_le_bytes());
        p.extend_from_slice(b"AB\0\x01");
        p.push(12);
        p
    }

    #[test]
    fn test_decode_bestpos() {
        let catalog = SchemaCatalog::from_json(TEST_CATALOG).unwrap();
        let msg = decode_payload(&catalog, 42, &bestpos_payload(), 0xDEADBEEF)
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind, "binary");
        assert_eq!(msg.schema_key, "BESTPOS");
        assert_eq!(msg.id, 42);
        assert_eq!(msg.fields["sol_status"].value, FieldValue::UInt(0));
        assert_eq!(msg.fields["lat"].value, FieldValue::Float(51.116));
        assert_eq!(msg.fields["lat"].unit.as_deref(), Some("deg"));
        assert_eq!(msg.fields["undulation"].value, FieldValue::Float(-16.5));
        assert_eq!(msg.fields["station_id"].value, FieldValue::Text("AB".into()));
        assert_eq!(msg.fields["num_svs"].note.as_deref(), Some("tracked"));
        assert_eq!(msg.fields["crc"].value, FieldValue::UInt(0xDEADBEEF));
        assert_eq!(
            msg.fields["hgt_ellipsoid"].value,
            FieldValue::Float(1064.5 - 16.5)
        );
    }

    #[test]
    fn test_decode_unknown_id() {
        let catalog = SchemaCatalog::from_json(TEST_CATALOG).unwrap();
        assert_eq!(decode_payload(&catalog, 999, &[0; 8], 0), Ok(None));
    }

    #[test]
    fn test_decode_too_short() {
        let catalog = SchemaCatalog::from_json(TEST_CATALOG).unwrap();
        let payload = bestpos_payload();
        assert_eq!(
            decode_payload(&catalog, 42, &payload[..20], 0),
            Err(ParseError::TooShort {
                expected: 41,
                actual: 20
            })
        );
    }

    #[test]
    fn test_decode_arrays_and_bytes() {
        let catalog = SchemaCatalog::from_json(TEST_CATALOG).unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&2300u32.to_le_bytes());
        for v in [-1i32, 0, 7] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        payload.extend_from_slice(&[0xCA, 0xFE]);
        let msg = decode_payload(&catalog, 268, &payload, 0).unwrap().unwrap();
        assert_eq!(
            msg.fields["accel"].value,
            FieldValue::List(vec![
                FieldValue::Int(-1),
                FieldValue::Int(0),
                FieldValue::Int(7)
            ])
        );
        assert_eq!(msg.fields["tag"].value, FieldValue::Bytes(vec![0xCA, 0xFE]));
    }

    #[test]
    fn test_zero_sized_field_rejected() {
        let layout: MessageLayout = serde_json::from_str(
            r#"{"key": "RAW", "id": 7, "fields": [{"name": "blob", "type": "bytes"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            decode_with_layout(&layout, &[1, 2, 3], 0),
            Err(ParseError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_derived_with_bad_expression_is_null() {
        let layout: MessageLayout = serde_json::from_str(
            r#"{"key": "X", "id": 1,
                "fields": [{"name": "a", "type": "u8"}],
                "derived": [{"name": "b", "expr": "a ^ 2"}, {"name": "c", "expr": "a * 2"}]}"#,
        )
        .unwrap();
        let msg = decode_with_layout(&layout, &[21], 0).unwrap();
        assert_eq!(msg.fields["b"].value, FieldValue::Null);
        assert_eq!(msg.fields["c"].value, FieldValue::Float(42.0));
    }

    #[test]
    fn test_serialized_shape() {
        let layout: MessageLayout = serde_json::from_str(
            r#"{"key": "X", "id": 1, "fields": [{"name": "a", "type": "u8", "unit": "m"}]}"#,
        )
        .unwrap();
        let msg = decode_with_layout(&layout, &[5], 0).unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "binary",
                "schemaKey": "X",
                "id": 1,
                "fields": {"a": {"value": 5, "unit": "m"}}
            })
        );
    }

    #[test]
    fn test_field_value_helpers() {
        assert_eq!(FieldValue::Text(" 4.5".into()).to_number(), Some(4.5));
        assert_eq!(FieldValue::Text("x".into()).as_f64(), None);
        assert_eq!(FieldValue::Text("04".into()).as_code().as_deref(), Some("4"));
        assert_eq!(FieldValue::UInt(3).as_code().as_deref(), Some("3"));
        assert_eq!(FieldValue::from_text(""), FieldValue::Null);
    }
}
