//! Session state shared by every stage of a run.
//!
//! `SessionState` owns the committed values; readers only ever get a
//! [`StateSnapshot`], an immutable view that later commits cannot touch.
//! Values live behind an `Arc`, so taking a snapshot is a pointer copy and
//! the first commit after a snapshot clones the map (copy-on-write).

mod snapshot;

pub use snapshot::StateSnapshot;

use crate::task::TaskFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// A committed entry in the session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateValue {
    /// A normal value (null, scalar or structured record).
    Value(JsonValue),
    /// The typed error record committed by a failed task.
    Failed(TaskFailure),
}

impl StateValue {
    /// Returns the value as a task would read it.
    ///
    /// Failure records and explicit nulls are both absent.
    pub fn as_value(&self) -> Option<&JsonValue> {
        match self {
            StateValue::Value(JsonValue::Null) | StateValue::Failed(_) => None,
            StateValue::Value(value) => Some(value),
        }
    }

    /// Returns the failure record, if this entry is one.
    pub fn as_failure(&self) -> Option<&TaskFailure> {
        match self {
            StateValue::Failed(failure) => Some(failure),
            StateValue::Value(_) => None,
        }
    }

    /// Returns true if this entry is a failure record.
    pub fn is_failure(&self) -> bool {
        matches!(self, StateValue::Failed(_))
    }
}

impl From<JsonValue> for StateValue {
    fn from(value: JsonValue) -> Self {
        StateValue::Value(value)
    }
}

impl From<TaskFailure> for StateValue {
    fn from(failure: TaskFailure) -> Self {
        StateValue::Failed(failure)
    }
}

/// Keyed state for one session run.
///
/// # Examples
///
/// ```
/// use session_pipeline::state::SessionState;
/// use serde_json::json;
///
/// let mut state = SessionState::with_ids("stocks", "session_1", "user_1");
/// state.set("ticker", json!("AAPL"));
///
/// let snapshot = state.snapshot();
/// state.set("ticker", json!("MSFT"));
///
/// assert_eq!(snapshot.value("ticker"), Some(&json!("AAPL")));
/// assert_eq!(state.value("ticker"), Some(&json!("MSFT")));
/// ```
#[derive(Debug, Clone)]
pub struct SessionState {
    app_name: String,
    session_id: String,
    owner_id: String,
    values: Arc<HashMap<String, StateValue>>,
}

impl SessionState {
    /// Creates an empty state with freshly generated session and owner ids.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self::with_ids(
            app_name,
            format!("session_{:016x}", rand::random::<u64>()),
            format!("user_{:016x}", rand::random::<u64>()),
        )
    }

    /// Creates an empty state with explicit identity.
    pub fn with_ids(
        app_name: impl Into<String>,
        session_id: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            values: Arc::new(HashMap::new()),
        }
    }

    /// Seeds the state with initial values.
    pub fn with_values<K, V>(mut self, values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<StateValue>,
    {
        let map = Arc::make_mut(&mut self.values);
        for (key, value) in values {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Application the session belongs to.
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Opaque session identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Opaque owner (user) identifier.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Returns the committed entry for `key`, including failure records.
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.values.get(key)
    }

    /// Returns the value for `key` as a task would read it.
    pub fn value(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key).and_then(StateValue::as_value)
    }

    /// Sets a single key.
    ///
    /// During a run only the orchestrator's commit step writes; callers use
    /// this to seed state before the run starts.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        Arc::make_mut(&mut self.values).insert(key.into(), value.into());
    }

    /// Applies every write of a resolved stage at once.
    pub(crate) fn commit(&mut self, writes: Vec<(String, StateValue)>) {
        if writes.is_empty() {
            return;
        }
        let map = Arc::make_mut(&mut self.values);
        for (key, value) in writes {
            map.insert(key, value);
        }
    }

    /// Takes an immutable view of the current values.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(Arc::clone(&self.values))
    }

    /// Returns true if `key` holds any entry (value or failure record).
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns every committed entry.
    pub fn values(&self) -> &HashMap<String, StateValue> {
        &self.values
    }

    /// Consumes the state, returning every committed entry.
    pub fn into_values(self) -> HashMap<String, StateValue> {
        Arc::try_unwrap(self.values).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Number of committed keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
