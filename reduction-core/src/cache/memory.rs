//! In-process cache backend: an unbounded map, cleared on process exit.
//! Entries live for the whole process since fingerprint keys never need
//! expiry.

use dashmap::DashMap;

use super::Cache;

pub struct InProcessCache {
    store: DashMap<String, Vec<u8>>,
}

impl InProcessCache {
    pub fn new() -> Self {
        Self {
            store: DashMap::new(),
        }
    }
}

impl Default for InProcessCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for InProcessCache {
    fn exists(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, bytes: Vec<u8>) {
        self.store.insert(key.to_string(), bytes);
    }
}
