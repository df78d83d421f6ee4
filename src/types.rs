/// Common types used throughout the cache.
///
/// These types describe the normalized data model: every entity is a
/// [`Record`] addressed by a [`CacheKey`], and records refer to each other
/// by key rather than by embedding. A [`RecordSet`] is the batch produced by
/// one fetch, mutation or push event.
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Stable identifier for one record: `typeName:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key from a type name and an id.
    pub fn new(type_name: impl AsRef<str>, id: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", type_name.as_ref(), id.as_ref()))
    }

    /// Parse a `type:id` string. The id may itself contain `:`.
    pub fn parse(raw: &str) -> CacheResult<Self> {
        match raw.split_once(':') {
            Some((type_name, id)) if !type_name.is_empty() && !id.is_empty() => {
                Ok(Self(raw.to_string()))
            }
            _ => Err(CacheError::InvalidKey(raw.to_string())),
        }
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The type half of the key.
    pub fn type_name(&self) -> &str {
        self.0.split_once(':').map(|(t, _)| t).unwrap_or(&self.0)
    }

    /// The id half of the key.
    pub fn id(&self) -> &str {
        self.0.split_once(':').map(|(_, id)| id).unwrap_or("")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CacheKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// The value of one record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// A plain JSON value. Never an object: objects are records.
    Scalar(JsonValue),
    /// A reference to another record.
    Reference(CacheKey),
    /// An ordered list of references.
    ReferenceList(Vec<CacheKey>),
}

impl FieldValue {
    fn check_normalized(&self) -> Result<(), &'static str> {
        fn embeds_object(value: &JsonValue) -> bool {
            match value {
                JsonValue::Object(_) => true,
                JsonValue::Array(items) => items.iter().any(embeds_object),
                _ => false,
            }
        }

        match self {
            FieldValue::Scalar(value) if embeds_object(value) => {
                Err("scalar field embeds an inline object")
            }
            _ => Ok(()),
        }
    }
}

impl From<JsonValue> for FieldValue {
    fn from(value: JsonValue) -> Self {
        FieldValue::Scalar(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Scalar(JsonValue::String(value.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Scalar(JsonValue::String(value))
    }
}

impl From<CacheKey> for FieldValue {
    fn from(key: CacheKey) -> Self {
        FieldValue::Reference(key)
    }
}

impl From<Vec<CacheKey>> for FieldValue {
    fn from(keys: Vec<CacheKey>) -> Self {
        FieldValue::ReferenceList(keys)
    }
}

/// A normalized entity snapshot: field name → value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set a field.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Get a field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Iterate over fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reject records that embed other records inline.
    pub fn validate(&self, key: &CacheKey) -> CacheResult<()> {
        for (name, value) in &self.fields {
            if name.is_empty() {
                return Err(CacheError::MergeConflict {
                    key: key.to_string(),
                    reason: "empty field name".to_string(),
                });
            }
            value.check_normalized().map_err(|reason| CacheError::MergeConflict {
                key: key.to_string(),
                reason: format!("field '{}': {}", name, reason),
            })?;
        }
        Ok(())
    }

    /// Deep-merge `incoming` into this record.
    ///
    /// Fields absent from `incoming` are preserved. Returns true if at least
    /// one field was added or changed value.
    pub fn merge_from(&mut self, incoming: &Record) -> bool {
        let mut changed = false;
        for (name, value) in &incoming.fields {
            match self.fields.get(name) {
                Some(existing) if existing == value => {}
                _ => {
                    self.fields.insert(name.clone(), value.clone());
                    changed = true;
                }
            }
        }
        changed
    }
}

/// A batch of records produced by one write, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    entries: Vec<(CacheKey, Record)>,
    index: HashMap<CacheKey, usize>,
}

impl RecordSet {
    /// Create an empty record set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: CacheKey, record: Record) -> Self {
        self.insert(key, record);
        self
    }

    /// Insert a record. A repeated key is deep-merged into its first slot.
    pub fn insert(&mut self, key: CacheKey, record: Record) {
        match self.index.get(&key) {
            Some(&slot) => {
                self.entries[slot].1.merge_from(&record);
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, record));
            }
        }
    }

    /// Get a record by key.
    pub fn get(&self, key: &CacheKey) -> Option<&Record> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &Record)> {
        self.entries.iter().map(|(k, r)| (k, r))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.iter().map(|(k, _)| k)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append every record from `other`, merging repeated keys.
    pub fn extend(&mut self, other: RecordSet) {
        for (key, record) in other.entries {
            self.insert(key, record);
        }
    }
}

impl FromIterator<(CacheKey, Record)> for RecordSet {
    fn from_iter<I: IntoIterator<Item = (CacheKey, Record)>>(iter: I) -> Self {
        let mut set = RecordSet::new();
        for (key, record) in iter {
            set.insert(key, record);
        }
        set
    }
}

impl IntoIterator for RecordSet {
    type Item = (CacheKey, Record);
    type IntoIter = std::vec::IntoIter<(CacheKey, Record)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
