//! Field normalization for one capability fed by one source.
//!
//! Order of operations: rename, unit conversion, hemisphere sign,
//! reference-table labels, extra fields. Without a mapping the flattened
//! fields pass through unchanged.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::decoder::{expr, FieldValue};
use crate::schema::{CapabilityMapping, Conversion, NamedConversion};

/// A computed field attached to a capability event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraField {
    pub label: String,
    pub value: FieldValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// NMEA `dddmm.mmmm` to signed decimal degrees
pub fn ddmm_to_degrees(value: f64) -> f64 {
    let magnitude = value.abs();
    let degrees = (magnitude / 100.0).trunc();
    let minutes = magnitude - degrees * 100.0;
    (degrees + minutes / 60.0).copysign(value)
}

fn apply_conversion(conversion: Conversion, value: f64) -> f64 {
    match conversion {
        Conversion::Factor(factor) => value * factor,
        Conversion::Named(NamedConversion::Ddmm) => ddmm_to_degrees(value),
    }
}

/// Normalize flattened source fields
pub fn normalize(
    mapping: Option<&CapabilityMapping>,
    source: BTreeMap<String, FieldValue>,
) -> (BTreeMap<String, FieldValue>, Vec<ExtraField>) {
    let Some(mapping) = mapping else {
        return (source, Vec::new());
    };

    let mut fields = if mapping.field_mapping.is_empty() {
        source.clone()
    } else {
        mapping
            .field_mapping
            .iter()
            .filter_map(|(from, to)| source.get(from).map(|v| (to.clone(), v.clone())))
            .collect()
    };

    for (name, conversion) in &mapping.conversions {
        if let Some(value) = fields.get_mut(name) {
            if let Some(n) = value.to_number() {
                *value = FieldValue::Float(apply_conversion(*conversion, n));
            }
        }
    }

    for (name, indicator_field) in &mapping.hemisphere {
        let negative = matches!(
            source.get(indicator_field),
            Some(FieldValue::Text(s)) if matches!(s.trim(), "S" | "W" | "s" | "w")
        );
        if let Some(value) = fields.get_mut(name) {
            if let Some(n) = value.to_number() {
                *value = FieldValue::Float(if negative { -n.abs() } else { n });
            }
        }
    }

    for (name, table) in &mapping.reference_tables {
        if let Some(value) = fields.get_mut(name) {
            if let Some(label) = value.as_code().and_then(|code| table.get(&code)) {
                *value = FieldValue::Text(label.clone());
            }
        }
    }

    let extras = mapping
        .extra_fields
        .iter()
        .map(|def| {
            let value = if let Some(field) = &def.field {
                fields
                    .get(field)
                    .or_else(|| source.get(field))
                    .cloned()
                    .unwrap_or(FieldValue::Null)
            } else if let Some(expression) = &def.expr {
                let lookup = |name: &str| {
                    fields
                        .get(name)
                        .or_else(|| source.get(name))
                        .and_then(FieldValue::to_number)
                };
                expr::evaluate(expression, &lookup)
                    .map(FieldValue::Float)
                    .unwrap_or(FieldValue::Null)
            } else {
                FieldValue::Null
            };
            ExtraField {
                label: def.label.clone(),
                value,
                format: def.format.clone(),
                unit: def.unit.clone(),
            }
        })
        .collect();

    (fields, extras)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(value: &FieldValue, expected: f64) -> bool {
        value.as_f64().map_or(false, |v| (v - expected).abs() < 1e-6)
    }

    #[test]
    fn test_ddmm_to_degrees() {
        assert!((ddmm_to_degrees(4807.038) - 48.1173).abs() < 1e-9);
        assert!((ddmm_to_degrees(-1131.0) + 11.516_666_666).abs() < 1e-6);
    }

    #[test]
    fn test_pass_through_without_mapping() {
        let mut source = BTreeMap::new();
        source.insert("a".to_string(), FieldValue::UInt(1));
        let (fields, extras) = normalize(None, source.clone());
        assert_eq!(fields, source);
        assert!(extras.is_empty());
    }

    #[test]
    fn test_full_mapping() {
        let mapping: CapabilityMapping = serde_json::from_str(
            r#"{
                "capability": "position",
                "source": "GGA",
                "fieldMapping": {"lat": "latitude", "lon": "longitude", "q": "fix", "alt": "altitude"},
                "conversions": {"latitude": "ddmm", "longitude": "ddmm", "altitude": 0.001},
                "hemisphere": {"latitude": "lat_dir", "longitude": "lon_dir"},
                "referenceTables": {"fix": {"4": "RTK_FIXED"}},
                "extraFields": [
                    {"label": "Quality", "field": "q"},
                    {"label": "Altitude km x2", "expr": "altitude * 2", "unit": "km"},
                    {"label": "Broken", "expr": "altitude % 2"}
                ]
            }"#,
        )
        .unwrap();

        let mut source = BTreeMap::new();
        source.insert("lat".to_string(), FieldValue::Text("4807.038".into()));
        source.insert("lat_dir".to_string(), FieldValue::Text("S".into()));
        source.insert("lon".to_string(), FieldValue::Text("01131.000".into()));
        source.insert("lon_dir".to_string(), FieldValue::Text("E".into()));
        source.insert("q".to_string(), FieldValue::Text("4".into()));
        source.insert("alt".to_string(), FieldValue::Float(545.0));
        source.insert("unmapped".to_string(), FieldValue::UInt(9));

        let (fields, extras) = normalize(Some(&mapping), source);
        assert!(approx(&fields["latitude"], -48.1173));
        assert!(approx(&fields["longitude"], 11.516_666_666));
        assert!(approx(&fields["altitude"], 0.545));
        assert_eq!(fields["fix"], FieldValue::Text("RTK_FIXED".into()));
        assert!(!fields.contains_key("unmapped"));

        assert_eq!(extras.len(), 3);
        assert_eq!(extras[0].value, FieldValue::Text("4".into()));
        assert!(approx(&extras[1].value, 1.09));
        assert_eq!(extras[1].unit.as_deref(), Some("km"));
        assert_eq!(extras[2].value, FieldValue::Null);
    }
}
