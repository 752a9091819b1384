use serde::Deserialize;
use std::collections::HashMap;

use super::{CapabilityMapping, MessageLayout, NmeaLayout, SchemaProvider};
use crate::capabilities::Capability;
use crate::error::SchemaError;

/// On-disk catalog document
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogDocument {
    #[serde(default)]
    messages: Vec<MessageLayout>,
    #[serde(default)]
    nmea: Vec<NmeaLayout>,
    #[serde(default)]
    capabilities: Vec<CapabilityMapping>,
}

/// In-memory schema catalog with lookup indexes
#[derive(Debug, Default, Clone)]
pub struct SchemaCatalog {
    messages: Vec<MessageLayout>,
    nmea: Vec<NmeaLayout>,
    mappings: Vec<CapabilityMapping>,
    by_id: HashMap<u16, usize>,
    by_name: HashMap<String, usize>,
    nmea_by_type: HashMap<String, usize>,
    by_capability_source: HashMap<(Capability, String), usize>,
}

impl SchemaCatalog {
    /// An empty catalog: every lookup misses
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse and index a catalog document
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let doc: CatalogDocument = serde_json::from_str(json)?;
        Self::from_parts(doc.messages, doc.nmea, doc.capabilities)
    }

    /// Build a catalog from already-deserialized parts
    pub fn from_parts(
        messages: Vec<MessageLayout>,
        nmea: Vec<NmeaLayout>,
        mappings: Vec<CapabilityMapping>,
    ) -> Result<Self, SchemaError> {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for (idx, layout) in messages.iter().enumerate() {
            for field in &layout.fields {
                if field.count == 0 || field.element_size() == 0 {
                    return Err(SchemaError::InvalidFieldSize {
                        message: layout.key.clone(),
                        field: field.name.clone(),
                    });
                }
            }
            if by_id.insert(layout.id, idx).is_some() {
                return Err(SchemaError::DuplicateId(layout.id));
            }
            by_name.insert(layout.key.to_ascii_uppercase(), idx);
        }

        let nmea_by_type = nmea
            .iter()
            .enumerate()
            .map(|(idx, layout)| (layout.sentence_type.to_ascii_uppercase(), idx))
            .collect();

        let by_capability_source = mappings
            .iter()
            .enumerate()
            .map(|(idx, m)| ((m.capability, m.source.to_ascii_uppercase()), idx))
            .collect();

        Ok(Self {
            messages,
            nmea,
            mappings,
            by_id,
            by_name,
            nmea_by_type,
            by_capability_source,
        })
    }

    /// Number of binary layouts
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }
}

impl SchemaProvider for SchemaCatalog {
    fn lookup_by_id(&self, id: u16) -> Option<&MessageLayout> {
        self.by_id.get(&id).map(|&idx| &self.messages[idx])
    }

    fn lookup_by_name(&self, key: &str) -> Option<&MessageLayout> {
        self.by_name
            .get(&key.to_ascii_uppercase())
            .map(|&idx| &self.messages[idx])
    }

    fn lookup_nmea(&self, sentence_type: &str) -> Option<&NmeaLayout> {
        self.nmea_by_type
            .get(&sentence_type.to_ascii_uppercase())
            .map(|&idx| &self.nmea[idx])
    }

    fn lookup_by_capability_source(
        &self,
        capability: Capability,
        source: &str,
    ) -> Option<&CapabilityMapping> {
        self.by_capability_source
            .get(&(capability, source.to_ascii_uppercase()))
            .map(|&idx| &self.mappings[idx])
    }
}
