//! Projection of query results out of the normalized cache.
//!
//! Projecting walks from a root value through references, following the
//! operation's [`Selection`], and records every cache key it looked up,
//! including keys that turned out to be missing. That key set is the
//! watch's dependency set: a later merge touching any of those keys is
//! exactly what can change the projected value.

use crate::operation::{ROOT_RESULT_FIELD, Selection};
use crate::store::TieredCache;
use crate::types::{CacheKey, FieldValue, Record};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};

/// Result of projecting a value from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Best-effort value; missing records and fields project as `null`.
    /// `None` only when the root itself is absent.
    pub value: Option<JsonValue>,
    /// True if every looked-up record and selected field was present
    pub complete: bool,
    /// Every key read while projecting
    pub dependencies: HashSet<CacheKey>,
}

impl Projection {
    /// The value, only if the projection was complete.
    pub fn complete_value(&self) -> Option<&JsonValue> {
        if self.complete {
            self.value.as_ref()
        } else {
            None
        }
    }
}

struct Projector<'a> {
    cache: &'a TieredCache,
    seen: HashMap<CacheKey, Option<Record>>,
    dependencies: HashSet<CacheKey>,
    complete: bool,
}

impl<'a> Projector<'a> {
    fn new(cache: &'a TieredCache) -> Self {
        Self {
            cache,
            seen: HashMap::new(),
            dependencies: HashSet::new(),
            complete: true,
        }
    }

    fn record(&mut self, key: &CacheKey) -> Option<Record> {
        self.dependencies.insert(key.clone());
        if let Some(cached) = self.seen.get(key) {
            return cached.clone();
        }
        let record = self.cache.read(key);
        self.seen.insert(key.clone(), record.clone());
        record
    }

    fn value(&mut self, field: &FieldValue, selection: Option<&Selection>) -> JsonValue {
        match (field, selection) {
            (FieldValue::Scalar(value), _) => value.clone(),
            (FieldValue::Reference(key), Some(nested)) => self.entity(key, nested),
            (FieldValue::Reference(key), None) => JsonValue::String(key.to_string()),
            (FieldValue::ReferenceList(keys), Some(nested)) => {
                JsonValue::Array(keys.iter().map(|key| self.entity(key, nested)).collect())
            }
            (FieldValue::ReferenceList(keys), None) => JsonValue::Array(
                keys.iter()
                    .map(|key| JsonValue::String(key.to_string()))
                    .collect(),
            ),
        }
    }

    fn entity(&mut self, key: &CacheKey, selection: &Selection) -> JsonValue {
        let Some(record) = self.record(key) else {
            self.complete = false;
            return JsonValue::Null;
        };

        let mut object = Map::new();
        object.insert(
            "__typename".to_string(),
            JsonValue::String(key.type_name().to_string()),
        );
        object.insert("id".to_string(), JsonValue::String(key.id().to_string()));

        if selection.is_all() {
            for (name, field) in record.fields() {
                let projected = self.value(field, None);
                object.insert(name.clone(), projected);
            }
            return JsonValue::Object(object);
        }

        for selected in selection.selected() {
            match record.get(&selected.name) {
                Some(field) => {
                    let projected = self.value(field, selected.nested.as_ref());
                    object.insert(selected.name.clone(), projected);
                }
                None if selected.name == "id" || selected.name == "__typename" => {}
                None => {
                    self.complete = false;
                    object.insert(selected.name.clone(), JsonValue::Null);
                }
            }
        }
        JsonValue::Object(object)
    }
}

/// Project the result stored under a query root record.
pub fn project_root(cache: &TieredCache, root: &CacheKey, selection: &Selection) -> Projection {
    let mut projector = Projector::new(cache);

    let result_field = projector
        .record(root)
        .and_then(|record| record.get(ROOT_RESULT_FIELD).cloned());

    let value = match result_field {
        Some(field) => Some(projector.value(&field, Some(selection))),
        None => {
            projector.complete = false;
            None
        }
    };

    Projection {
        value,
        complete: projector.complete,
        dependencies: projector.dependencies,
    }
}

/// Project an arbitrary root value (e.g. a mutation result).
pub fn project_value(cache: &TieredCache, root: &FieldValue, selection: &Selection) -> Projection {
    let mut projector = Projector::new(cache);
    let value = projector.value(root, Some(selection));
    Projection {
        value: Some(value),
        complete: projector.complete,
        dependencies: projector.dependencies,
    }
}
