//! Request/reply metadata.
//!
//! A case-insensitive multimap of string keys to string or binary values,
//! carried on commands, replies, forwards, and side effects.

use crate::proto::{metadata_entry, Metadata as ProtoMetadata, MetadataEntry};

/// A metadata value: either text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    String(String),
    Bytes(Vec<u8>),
}

impl MetadataValue {
    /// The value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            MetadataValue::Bytes(_) => None,
        }
    }

    /// The value as bytes, if it is binary.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MetadataValue::String(_) => None,
            MetadataValue::Bytes(b) => Some(b),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(b: Vec<u8>) -> Self {
        MetadataValue::Bytes(b)
    }
}

/// Case-insensitive multimap of metadata entries.
///
/// Lookup ignores key case; insertion preserves the key as given. Multiple
/// entries may share a key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for a key, ignoring case.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// All values for a key, ignoring case, in insertion order.
    pub fn get_all(&self, key: &str) -> Vec<&MetadataValue> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
            .collect()
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Append an entry, keeping any existing entries for the key.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Replace all entries for the key with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into();
        self.delete(&key);
        self.entries.push((key, value.into()));
    }

    /// Remove all entries for the key, ignoring case.
    pub fn delete(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Convert to the wire representation. Returns None when empty, since
    /// the protocol omits empty metadata.
    pub fn to_proto(&self) -> Option<ProtoMetadata> {
        if self.entries.is_empty() {
            return None;
        }
        Some(ProtoMetadata {
            entries: self
                .entries
                .iter()
                .map(|(k, v)| MetadataEntry {
                    key: k.clone(),
                    value: Some(match v {
                        MetadataValue::String(s) => {
                            metadata_entry::Value::StringValue(s.clone())
                        }
                        MetadataValue::Bytes(b) => metadata_entry::Value::BytesValue(b.clone()),
                    }),
                })
                .collect(),
        })
    }

    /// Build from the wire representation. Entries with no value decode as
    /// empty strings.
    pub fn from_proto(proto: &ProtoMetadata) -> Self {
        let entries = proto
            .entries
            .iter()
            .map(|e| {
                let value = match &e.value {
                    Some(metadata_entry::Value::StringValue(s)) => {
                        MetadataValue::String(s.clone())
                    }
                    Some(metadata_entry::Value::BytesValue(b)) => MetadataValue::Bytes(b.clone()),
                    None => MetadataValue::String(String::new()),
                };
                (e.key.clone(), value)
            })
            .collect();
        Self { entries }
    }
}
