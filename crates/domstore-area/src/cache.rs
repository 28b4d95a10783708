use std::collections::BTreeMap;
use std::mem::size_of;

use serde::{Deserialize, Serialize};

use domstore_types::{StorageKey, StorageValue};

/// What a map keeps in memory once loaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Keep only keys and value lengths when nothing is pending.
    KeysOnly,
    /// Keep keys and values.
    #[default]
    KeysAndValues,
}

/// Cache state machine: `Unloaded -> Loading -> KeysOnly | KeysAndValues`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CacheState {
    #[default]
    Unloaded,
    Loading,
    KeysOnly(BTreeMap<StorageKey, usize>),
    KeysAndValues(BTreeMap<StorageKey, StorageValue>),
}

/// Bytes a keys-only entry costs in memory.
pub fn keys_only_cost(key: &[u8]) -> usize {
    key.len() + size_of::<usize>()
}

/// A map's cache plus its byte accounting.
///
/// `storage_used` is what the area costs against its quota (keys plus
/// values). `memory_used` is what the cache itself holds, which is smaller
/// in keys-only mode.
#[derive(Clone, Debug, Default)]
pub struct MapCache {
    pub(crate) state: CacheState,
    pub(crate) storage_used: usize,
    pub(crate) memory_used: usize,
}

impl MapCache {
    pub fn unloaded() -> Self {
        Self::default()
    }

    /// A loaded, empty keys-and-values cache.
    pub fn empty() -> Self {
        Self::with_values(BTreeMap::new())
    }

    pub fn with_values(values: BTreeMap<StorageKey, StorageValue>) -> Self {
        let mut cache = Self {
            state: CacheState::KeysAndValues(values),
            storage_used: 0,
            memory_used: 0,
        };
        cache.recalculate();
        cache
    }

    pub fn state(&self) -> &CacheState {
        &self.state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, CacheState::KeysOnly(_) | CacheState::KeysAndValues(_))
    }

    pub fn has_values(&self) -> bool {
        matches!(self.state, CacheState::KeysAndValues(_))
    }

    pub fn is_empty(&self) -> bool {
        match &self.state {
            CacheState::KeysOnly(keys) => keys.is_empty(),
            CacheState::KeysAndValues(values) => values.is_empty(),
            CacheState::Unloaded | CacheState::Loading => true,
        }
    }

    pub fn len(&self) -> usize {
        match &self.state {
            CacheState::KeysOnly(keys) => keys.len(),
            CacheState::KeysAndValues(values) => values.len(),
            CacheState::Unloaded | CacheState::Loading => 0,
        }
    }

    pub fn storage_used(&self) -> usize {
        self.storage_used
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    pub fn values(&self) -> Option<&BTreeMap<StorageKey, StorageValue>> {
        match &self.state {
            CacheState::KeysAndValues(values) => Some(values),
            _ => None,
        }
    }

    /// Drop values, keeping keys and lengths. No-op unless values are loaded.
    pub fn demote_to_keys_only(&mut self) {
        if let CacheState::KeysAndValues(values) = std::mem::take(&mut self.state) {
            let keys = values.into_iter().map(|(k, v)| (k, v.len())).collect();
            self.state = CacheState::KeysOnly(keys);
            self.recalculate();
        }
    }

    /// Forget everything; the next access reloads from the database.
    pub fn unload(&mut self) {
        self.state = CacheState::Unloaded;
        self.storage_used = 0;
        self.memory_used = 0;
    }

    pub fn begin_loading(&mut self) {
        self.state = CacheState::Loading;
        self.storage_used = 0;
        self.memory_used = 0;
    }

    /// Recompute both counters from the cache contents.
    pub fn recalculate(&mut self) {
        let (storage, memory) = match &self.state {
            CacheState::KeysAndValues(values) => {
                let used = values.iter().map(|(k, v)| k.len() + v.len()).sum();
                (used, used)
            }
            CacheState::KeysOnly(keys) => keys.iter().fold((0, 0), |(s, m), (k, len)| {
                (s + k.len() + len, m + keys_only_cost(k))
            }),
            CacheState::Unloaded | CacheState::Loading => (0, 0),
        };
        self.storage_used = storage;
        self.memory_used = memory;
    }
}
