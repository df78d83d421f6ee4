//! Operations, selections and cache policies.
//!
//! An [`Operation`] names a remote query, mutation or push subscription and
//! carries the [`Selection`] used to project its result out of the cache.
//! Two requests with the same operation name and the same canonicalized
//! arguments share a [`DedupKey`] and therefore one watch.

use crate::types::CacheKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::sync::Arc;

/// Type name used for the per-query root records.
pub const ROOT_QUERY_TYPE: &str = "Query";

/// Field of a root record that holds the query result.
pub const ROOT_RESULT_FIELD: &str = "result";

/// What kind of remote operation this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Read-only fetch.
    Query,
    /// Remote write.
    Mutation,
    /// Server push stream.
    Subscription,
}

/// Rule governing cache vs. network precedence for a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CachePolicy {
    /// Never touch the network.
    CacheOnly,
    /// Use the cache when complete, otherwise fetch.
    #[default]
    CacheElseNetwork,
    /// Always fetch; the cache only receives the result.
    NetworkOnly,
    /// Emit the cached value first, then the network value.
    CacheThenNetwork,
}

impl CachePolicy {
    /// Whether the policy consults the cache before the network.
    pub fn reads_cache(&self) -> bool {
        !matches!(self, CachePolicy::NetworkOnly)
    }
}

/// One selected field, optionally followed into referenced records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSelection {
    /// Field name on the record
    pub name: String,
    /// Shape of the referenced record(s), for reference fields
    pub nested: Option<Selection>,
}

/// The projected shape of a query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Selection {
    fields: Vec<FieldSelection>,
}

impl Selection {
    /// Select every scalar field; references are rendered as key strings.
    pub fn all() -> Self {
        Self { fields: Vec::new() }
    }

    /// Select the listed fields, none of them followed.
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: names
                .into_iter()
                .map(|name| FieldSelection {
                    name: name.into(),
                    nested: None,
                })
                .collect(),
        }
    }

    /// Add a plain field.
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(FieldSelection {
            name: name.into(),
            nested: None,
        });
        self
    }

    /// Add a reference field followed with a nested selection.
    pub fn nested(mut self, name: impl Into<String>, selection: Selection) -> Self {
        self.fields.push(FieldSelection {
            name: name.into(),
            nested: Some(selection),
        });
        self
    }

    /// True for [`Selection::all`].
    pub fn is_all(&self) -> bool {
        self.fields.is_empty()
    }

    /// The selected fields.
    pub fn selected(&self) -> &[FieldSelection] {
        &self.fields
    }
}

/// A named remote operation and the shape of its result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operation {
    name: Arc<str>,
    kind: OperationKind,
    selection: Selection,
}

impl Operation {
    /// A read-only query.
    pub fn query(name: impl AsRef<str>, selection: Selection) -> Self {
        Self::new(name, OperationKind::Query, selection)
    }

    /// A remote write.
    pub fn mutation(name: impl AsRef<str>, selection: Selection) -> Self {
        Self::new(name, OperationKind::Mutation, selection)
    }

    /// A server push stream.
    pub fn subscription(name: impl AsRef<str>, selection: Selection) -> Self {
        Self::new(name, OperationKind::Subscription, selection)
    }

    /// Create an operation of any kind.
    pub fn new(name: impl AsRef<str>, kind: OperationKind, selection: Selection) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            kind,
            selection,
        }
    }

    /// Operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Projection shape.
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Dedup key for this operation with the given arguments.
    pub fn dedup_key(&self, arguments: &JsonValue) -> DedupKey {
        DedupKey::new(self.name(), arguments)
    }
}

/// Identity of a resolved query: operation name plus canonical arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey(String);

impl DedupKey {
    /// Build the key from an operation name and raw arguments.
    pub fn new(operation: &str, arguments: &JsonValue) -> Self {
        let canonical = canonicalize(arguments);
        let args = match &canonical {
            JsonValue::Null => String::new(),
            other => other.to_string(),
        };
        Self(format!("{}({})", operation, args))
    }

    /// The string form, `name(args)`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the root record holding this query's result.
    pub fn root_key(&self) -> CacheKey {
        CacheKey::new(ROOT_QUERY_TYPE, &self.0)
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rebuild a JSON value with every object's keys in sorted order.
///
/// Empty objects canonicalize to `null` so `{}` and "no arguments" share
/// one dedup key.
pub fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) if map.is_empty() => JsonValue::Null,
        other => canonicalize_nested(other),
    }
}

fn canonicalize_nested(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize_nested(&map[key]));
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize_nested).collect()),
        other => other.clone(),
    }
}
