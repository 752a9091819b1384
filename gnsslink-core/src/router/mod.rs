//! Capability router.
//!
//! Consumers subscribe a capability to a `(message selector, source)` pair.
//! Every demultiplexed frame is matched against the live subscriptions,
//! decoded once, and normalized into exactly one [`CapabilityEvent`] per
//! matching capability.
//!
//! A global reference count per `(selector, source)` tracks how many
//! subscriptions want a device log; [`SubscriptionChange`] reports the 0→1
//! and 1→0 transitions so the caller can issue `LOG`/`UNLOG` commands.
//!
//! ```rust
//! use std::sync::Arc;
//! use gnsslink_core::capabilities::Capability;
//! use gnsslink_core::router::{Router, SubscriptionChange};
//! use gnsslink_core::schema::SchemaCatalog;
//!
//! let mut router = Router::new(Arc::new(SchemaCatalog::empty()));
//! assert_eq!(router.subscribe(Capability::Position, "GGA", "GPGGA"), SubscriptionChange::Activated);
//! assert_eq!(router.subscribe(Capability::Time, "GGA", "GPGGA"), SubscriptionChange::Unchanged);
//! ```

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::capabilities::Capability;
use crate::decoder::{decode_payload, FieldValue};
use crate::demux::{BinaryFrame, Frame};
use crate::error::ParseError;
use crate::protocol::{ascii, nmea};
use crate::schema::{FieldType, SchemaProvider};

mod normalize;

pub use normalize::{ddmm_to_degrees, ExtraField};

/// Which frames a subscription matches
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum MessageSelector {
    /// Binary message id
    Id(u16),
    /// NMEA sentence type or ASCII log tag, upper case
    Tag(String),
}

impl MessageSelector {
    /// Coerce a selector string: numeric strings become ids
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        match s.parse::<u16>() {
            Ok(id) => MessageSelector::Id(id),
            Err(_) => MessageSelector::Tag(s.to_ascii_uppercase()),
        }
    }
}

impl From<&str> for MessageSelector {
    fn from(s: &str) -> Self {
        MessageSelector::parse(s)
    }
}

impl From<u16> for MessageSelector {
    fn from(id: u16) -> Self {
        MessageSelector::Id(id)
    }
}

impl fmt::Display for MessageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageSelector::Id(id) => write!(f, "{}", id),
            MessageSelector::Tag(tag) => f.write_str(tag),
        }
    }
}

/// Ref-count transition caused by a subscribe/unsubscribe call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// First subscriber for this `(selector, source)`
    Activated,
    /// Last subscriber removed
    Deactivated,
    Unchanged,
}

/// One normalized output event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityEvent {
    pub capability: Capability,
    pub source: String,
    pub selector: MessageSelector,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<ExtraField>,
}

#[derive(Debug, Clone)]
struct SubscriptionEntry {
    selector: MessageSelector,
    source: String,
    count: u32,
}

/// Capability-based subscription router
pub struct Router {
    schema: Arc<dyn SchemaProvider + Send + Sync>,
    subscriptions: BTreeMap<Capability, Vec<SubscriptionEntry>>,
    ref_counts: HashMap<(MessageSelector, String), u32>,
}

impl Router {
    pub fn new(schema: Arc<dyn SchemaProvider + Send + Sync>) -> Self {
        Self {
            schema,
            subscriptions: BTreeMap::new(),
            ref_counts: HashMap::new(),
        }
    }

    pub fn subscribe(
        &mut self,
        capability: Capability,
        selector: impl Into<MessageSelector>,
        source: &str,
    ) -> SubscriptionChange {
        let selector = selector.into();
        let entries = self.subscriptions.entry(capability).or_default();
        match entries
            .iter()
            .position(|e| e.selector == selector && e.source == source)
        {
            Some(idx) => entries[idx].count += 1,
            None => entries.push(SubscriptionEntry {
                selector: selector.clone(),
                source: source.to_string(),
                count: 1,
            }),
        }

        let count = self.ref_counts.entry((selector, source.to_string())).or_insert(0);
        *count += 1;
        if *count == 1 {
            SubscriptionChange::Activated
        } else {
            SubscriptionChange::Unchanged
        }
    }

    /// Remove one subscription. Unknown subscriptions are ignored.
    pub fn unsubscribe(
        &mut self,
        capability: Capability,
        selector: impl Into<MessageSelector>,
        source: &str,
    ) -> SubscriptionChange {
        let selector = selector.into();
        let Some(entries) = self.subscriptions.get_mut(&capability) else {
            return SubscriptionChange::Unchanged;
        };
        let Some(idx) = entries
            .iter()
            .position(|e| e.selector == selector && e.source == source)
        else {
            return SubscriptionChange::Unchanged;
        };
        entries[idx].count -= 1;
        if entries[idx].count == 0 {
            entries.remove(idx);
        }
        if entries.is_empty() {
            self.subscriptions.remove(&capability);
        }

        let key = (selector, source.to_string());
        let remaining = match self.ref_counts.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return SubscriptionChange::Unchanged,
        };
        if remaining == 0 {
            self.ref_counts.remove(&key);
            SubscriptionChange::Deactivated
        } else {
            SubscriptionChange::Unchanged
        }
    }

    /// Current reference count for a `(selector, source)` pair
    pub fn ref_count(&self, selector: impl Into<MessageSelector>, source: &str) -> u32 {
        self.ref_counts
            .get(&(selector.into(), source.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of `(selector, source)` pairs with a live reference
    pub fn active_count(&self) -> usize {
        self.ref_counts.len()
    }

    /// Active `(selector, source)` pairs for a capability
    pub fn subscriptions(&self, capability: Capability) -> Vec<(MessageSelector, String)> {
        self.subscriptions
            .get(&capability)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| (e.selector.clone(), e.source.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First matching subscription per capability
    fn matches<F>(&self, predicate: F) -> Vec<(Capability, MessageSelector, String)>
    where
        F: Fn(&MessageSelector) -> bool,
    {
        self.subscriptions
            .iter()
            .filter_map(|(capability, entries)| {
                entries
                    .iter()
                    .find(|e| predicate(&e.selector))
                    .map(|e| (*capability, e.selector.clone(), e.source.clone()))
            })
            .collect()
    }

    /// Route one frame to the matching capabilities
    pub fn route(&self, frame: &Frame) -> Result<Vec<CapabilityEvent>, ParseError> {
        match frame {
            Frame::Binary(binary) => self.route_binary(binary),
            Frame::Text(line) if line.starts_with('$') => self.route_nmea(line),
            Frame::Text(line) if ascii::is_ascii_log(line) => self.route_ascii(line),
            _ => Ok(Vec::new()),
        }
    }

    fn route_binary(&self, frame: &BinaryFrame) -> Result<Vec<CapabilityEvent>, ParseError> {
        let matched = self.matches(|s| *s == MessageSelector::Id(frame.id));
        if matched.is_empty() {
            return Ok(Vec::new());
        }
        let decoded = decode_payload(self.schema.as_ref(), frame.id, &frame.payload, frame.crc)?;
        Ok(decoded
            .map(|message| self.emit(matched, message.values()))
            .unwrap_or_default())
    }

    fn route_nmea(&self, line: &str) -> Result<Vec<CapabilityEvent>, ParseError> {
        if self.subscriptions.is_empty() {
            return Ok(Vec::new());
        }
        let sentence = nmea::parse_sentence(line)?;
        let address = sentence.address();
        let matched = self.matches(|s| match s {
            MessageSelector::Tag(tag) => *tag == sentence.sentence_type || *tag == address,
            MessageSelector::Id(_) => false,
        });
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        let names = self
            .schema
            .lookup_nmea(&sentence.sentence_type)
            .map(|layout| layout.fields.clone())
            .unwrap_or_default();
        let fields = sentence
            .fields
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let name = names
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("field_{}", i + 1));
                (name, FieldValue::from_text(value))
            })
            .collect();
        Ok(self.emit(matched, fields))
    }

    fn route_ascii(&self, line: &str) -> Result<Vec<CapabilityEvent>, ParseError> {
        if self.subscriptions.is_empty() {
            return Ok(Vec::new());
        }
        let message = ascii::parse_log(line)?;
        let key = message.layout_key().to_string();
        let matched = self.matches(|s| match s {
            MessageSelector::Tag(tag) => *tag == message.tag || *tag == key,
            MessageSelector::Id(_) => false,
        });
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        let mut fields = BTreeMap::new();
        match self.schema.lookup_by_name(&key) {
            Some(layout) => {
                let mut tokens = message.fields.iter();
                for def in layout.fields.iter().filter(|f| !f.from_crc) {
                    // Strings and byte arrays are one token per element
                    let values: Vec<FieldValue> = tokens
                        .by_ref()
                        .take(def.count)
                        .map(|t| ascii_value(def.field_type, t))
                        .collect();
                    if values.is_empty() {
                        break;
                    }
                    let value = if def.count == 1 {
                        values.into_iter().next().unwrap_or(FieldValue::Null)
                    } else {
                        FieldValue::List(values)
                    };
                    fields.insert(def.name.clone(), value);
                }
            }
            None => {
                for (i, value) in message.fields.iter().enumerate() {
                    fields.insert(format!("field_{}", i + 1), FieldValue::from_text(value));
                }
            }
        }
        Ok(self.emit(matched, fields))
    }

    fn emit(
        &self,
        matched: Vec<(Capability, MessageSelector, String)>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Vec<CapabilityEvent> {
        matched
            .into_iter()
            .map(|(capability, selector, source)| {
                let mapping = self.schema.lookup_by_capability_source(capability, &source);
                let (fields, extras) = normalize::normalize(mapping, fields.clone());
                CapabilityEvent {
                    capability,
                    source,
                    selector,
                    fields,
                    extras,
                }
            })
            .collect()
    }
}

/// Convert an ASCII token per the declared binary type
fn ascii_value(field_type: FieldType, token: &str) -> FieldValue {
    if token.is_empty() {
        return FieldValue::Null;
    }
    let parsed = match field_type {
        FieldType::U8 | FieldType::U16 | FieldType::U32 => token.parse().ok().map(FieldValue::UInt),
        FieldType::I8 | FieldType::I16 | FieldType::I32 => token.parse().ok().map(FieldValue::Int),
        FieldType::F32 | FieldType::F64 => token.parse().ok().map(FieldValue::Float),
        FieldType::Char | FieldType::Bytes => None,
    };
    parsed.unwrap_or_else(|| FieldValue::Text(token.trim_matches('"').to_string()))
}
