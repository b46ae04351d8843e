use super::StateValue;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An immutable, cheaply clonable view of session state at a fixed point.
///
/// Every member of a parallel group receives a clone of the same snapshot,
/// so no member can observe a sibling's output.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    values: Arc<HashMap<String, StateValue>>,
}

impl StateSnapshot {
    pub(crate) fn new(values: Arc<HashMap<String, StateValue>>) -> Self {
        Self { values }
    }

    /// Creates a snapshot directly from values (useful for running a single task).
    pub fn from_values<K, V>(values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<StateValue>,
    {
        let map = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<HashMap<_, _>>();
        Self::new(Arc::new(map))
    }

    /// Returns the entry for `key`, including failure records.
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key)
    }

    /// Returns the value for `key`; failure records and nulls are absent.
    pub fn value(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key).and_then(StateValue::as_value)
    }

    /// Returns true if `key` holds any entry.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of keys in the snapshot.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copies the snapshot into an owned map.
    pub fn to_map(&self) -> HashMap<String, StateValue> {
        (*self.values).clone()
    }

    /// Readable values only, ordered by key. Used as template context.
    pub fn visible_values(&self) -> BTreeMap<&str, &JsonValue> {
        self.values
            .iter()
            .filter_map(|(k, v)| v.as_value().map(|value| (k.as_str(), value)))
            .collect()
    }
}
