//! Request-scoped key/value store shared between handlers and the tasks
//! they spawn.

use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::pool::{Pool, SharedReset};

const MAX_IDLE_MAPS: usize = 1024;

pub(crate) static VALUE_MAPS: LazyLock<Pool<Arc<ValueMap>>> =
    LazyLock::new(|| Pool::new(MAX_IDLE_MAPS, || Arc::new(ValueMap::default())));

type Entry = Arc<dyn Any + Send + Sync>;

/// Concurrent map from string keys to values of any `Send + Sync` type.
#[derive(Default)]
pub struct ValueMap {
    entries: DashMap<String, Entry>,
}

impl ValueMap {
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Arc::new(value));
    }

    /// Returns the value under `key` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = Arc::clone(self.entries.get(key)?.value());
        entry.downcast::<T>().ok()
    }

    /// Returns the existing value under `key`, or stores the one built by `init`.
    pub fn get_or_insert_with<T, F>(&self, key: impl Into<String>, init: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let entry = self
            .entries
            .entry(key.into())
            .or_insert_with(|| Arc::new(init()));
        Arc::clone(entry.value()).downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl SharedReset for ValueMap {
    fn reset_shared(&self) {
        self.clear();
    }
}

impl fmt::Debug for ValueMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueMap")
            .field("keys", &self.keys())
            .finish()
    }
}

/// Hands the map back to the shared pool unless a spawned task still holds it.
pub(crate) fn reclaim(map: Arc<ValueMap>) {
    if Arc::strong_count(&map) == 1 {
        VALUE_MAPS.release(map);
    }
}
