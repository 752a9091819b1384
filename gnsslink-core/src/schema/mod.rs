//! Message schema types and the lookup service used by the decoder and router.
//!
//! The schema describes three things:
//!
//! - binary message layouts (field list in wire order, plus derived fields),
//! - NMEA sentence layouts (positional field names),
//! - per-capability, per-source normalization rules.
//!
//! Decoding and routing code only depends on the [`SchemaProvider`] trait;
//! [`SchemaCatalog`] is the in-memory implementation loaded from JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::capabilities::Capability;

pub(crate) mod catalog;

pub use catalog::SchemaCatalog;

// =============================================================================
// Binary layouts
// =============================================================================

/// Wire encoding of a binary field (all little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
    /// Fixed-length character string (`length` bytes)
    Char,
    /// Fixed-length raw byte array (`length` bytes)
    Bytes,
}

impl FieldType {
    /// Size of one element, `None` for the length-carrying types
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            FieldType::U8 | FieldType::I8 => Some(1),
            FieldType::U16 | FieldType::I16 => Some(2),
            FieldType::U32 | FieldType::I32 | FieldType::F32 => Some(4),
            FieldType::F64 => Some(8),
            FieldType::Char | FieldType::Bytes => None,
        }
    }
}

fn default_count() -> usize {
    1
}

/// One declared field of a binary message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Number of elements; `count > 1` decodes to a sequence
    #[serde(default = "default_count")]
    pub count: usize,
    /// Byte length of one `char`/`bytes` element
    #[serde(default)]
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Populated from the verified frame CRC instead of the payload
    #[serde(default)]
    pub from_crc: bool,
}

impl FieldDef {
    /// Size of one element on the wire
    pub fn element_size(&self) -> usize {
        self.field_type.fixed_size().unwrap_or(self.length)
    }

    /// Bytes consumed from the payload
    pub fn wire_size(&self) -> usize {
        if self.from_crc {
            0
        } else {
            self.element_size() * self.count
        }
    }
}

/// A field computed from already-decoded numeric fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedField {
    pub name: String,
    /// Arithmetic over numbers and field names: `+ - * / ( )`
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Layout of one binary message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLayout {
    /// Message name without format suffix (e.g. "BESTPOS")
    pub key: String,
    pub id: u16,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub derived: Vec<DerivedField>,
}

impl MessageLayout {
    /// Minimum payload size for the declared fields
    pub fn min_payload_len(&self) -> usize {
        self.fields.iter().map(FieldDef::wire_size).sum()
    }
}

// =============================================================================
// NMEA layouts
// =============================================================================

/// Positional field names of an NMEA sentence type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NmeaLayout {
    /// Three-letter sentence type (e.g. "GGA")
    #[serde(rename = "type")]
    pub sentence_type: String,
    pub fields: Vec<String>,
}

// =============================================================================
// Normalization rules
// =============================================================================

/// Named conversions that are not a plain factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamedConversion {
    /// NMEA `dddmm.mmmm` to decimal degrees
    Ddmm,
}

/// Unit conversion applied to a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Conversion {
    Factor(f64),
    Named(NamedConversion),
}

/// A computed field attached to normalized events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraFieldDef {
    pub label: String,
    /// Copy the value of this field (canonical or source name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Or evaluate this expression over the numeric fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// How one source feeds one capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityMapping {
    pub capability: Capability,
    /// Source name as used in subscriptions (e.g. "BESTPOS", "GGA")
    pub source: String,
    /// Source field name to canonical name
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
    /// Canonical field name to conversion
    #[serde(default)]
    pub conversions: BTreeMap<String, Conversion>,
    /// Canonical field name to the source field holding N/S or E/W
    #[serde(default)]
    pub hemisphere: BTreeMap<String, String>,
    /// Canonical field name to code/label table
    #[serde(default)]
    pub reference_tables: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub extra_fields: Vec<ExtraFieldDef>,
}

// =============================================================================
// Lookup service
// =============================================================================

/// Schema lookups needed by the decoder and router
pub trait SchemaProvider {
    /// Binary layout by message id
    fn lookup_by_id(&self, id: u16) -> Option<&MessageLayout>;

    /// Binary layout by key (case-insensitive)
    fn lookup_by_name(&self, key: &str) -> Option<&MessageLayout>;

    /// NMEA layout by three-letter sentence type
    fn lookup_nmea(&self, sentence_type: &str) -> Option<&NmeaLayout>;

    /// Normalization rules for a capability fed by a source
    fn lookup_by_capability_source(
        &self,
        capability: Capability,
        source: &str,
    ) -> Option<&CapabilityMapping>;
}
