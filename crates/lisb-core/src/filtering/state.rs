//! Keyed state shared by stateful filters

use lisb_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A string-keyed map behind a mutex.
///
/// The lock is only taken for short, synchronous sections and never held
/// across an `.await`. Snapshots are deep copies, so serialising one does not
/// block concurrent filter checks.
#[derive(Debug)]
pub struct StateMap<V> {
    entries: Mutex<BTreeMap<String, V>>,
}

impl<V> Default for StateMap<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<V> StateMap<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, V>> {
        // A panicking filter must not take the whole map down with it
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.lock().insert(key.into(), value);
    }

    /// Run `f` with exclusive access to the whole map
    pub fn with<R>(&self, f: impl FnOnce(&mut BTreeMap<String, V>) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Replace the contents with a persisted JSON object.
    ///
    /// `null` or an empty object clears the map. Anything else that does not
    /// decode leaves the map untouched and reports an error.
    pub fn load_value(&self, value: Value) -> Result<()> {
        let entries: BTreeMap<String, V> = match value {
            Value::Null => BTreeMap::new(),
            other => serde_json::from_value(other)
                .map_err(|e| Error::Storage(format!("Undecodable filter state: {}", e)))?,
        };

        *self.lock() = entries;
        Ok(())
    }

    /// Deep copy of the contents as a JSON object with sorted keys
    pub fn snapshot_value(&self) -> Value {
        let entries = self.lock().clone();
        serde_json::to_value(entries).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}
