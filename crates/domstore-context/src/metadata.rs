use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::warn;

use domstore_db::BatchOperation;
use domstore_types::keys::{encode_number, namespace_key, parse_map_id, parse_namespace_key};
use domstore_types::{MapId, Origin, PersistentNamespaceId};

/// One recorded (namespace, origin) pair and the map holding its data.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct StorageUsageInfo {
    pub persistent_namespace_id: PersistentNamespaceId,
    pub origin: Origin,
    pub map_id: MapId,
}

/// In-memory mirror of the `namespace-<id>-<origin>` rows.
///
/// Mutators return the database operation that persists the change; the
/// caller is responsible for writing it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceRecords {
    records: BTreeMap<PersistentNamespaceId, BTreeMap<Origin, MapId>>,
}

impl NamespaceRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the rows read at startup. Malformed rows are skipped.
    pub fn from_rows(rows: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>) -> Self {
        let mut records = Self::new();
        for (key, value) in rows {
            let parsed = parse_namespace_key(&key).and_then(|(namespace, origin)| {
                parse_map_id(&value).map(|map| (namespace, origin, map))
            });
            match parsed {
                Ok((namespace, origin, map)) => {
                    records.records.entry(namespace).or_default().insert(origin, map);
                }
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %e,
                    "skipping malformed namespace record"
                ),
            }
        }
        records
    }

    pub fn map_for(&self, namespace: &PersistentNamespaceId, origin: &Origin) -> Option<MapId> {
        self.records.get(namespace)?.get(origin).copied()
    }

    /// Origins recorded under `namespace` with their maps.
    pub fn origins(&self, namespace: &PersistentNamespaceId) -> Vec<(Origin, MapId)> {
        self.records
            .get(namespace)
            .map(|origins| origins.iter().map(|(o, m)| (o.clone(), *m)).collect())
            .unwrap_or_default()
    }

    pub fn set(&mut self, namespace: &PersistentNamespaceId, origin: &Origin, map: MapId) -> BatchOperation {
        self.records
            .entry(namespace.clone())
            .or_default()
            .insert(origin.clone(), map);
        BatchOperation::put(namespace_key(namespace, origin), encode_number(map.get()))
    }

    pub fn remove(&mut self, namespace: &PersistentNamespaceId, origin: &Origin) -> Option<(MapId, BatchOperation)> {
        let origins = self.records.get_mut(namespace)?;
        let map = origins.remove(origin)?;
        if origins.is_empty() {
            self.records.remove(namespace);
        }
        Some((map, BatchOperation::delete(namespace_key(namespace, origin))))
    }

    /// Remove every record of `namespace`, returning the released maps and
    /// the row deletions.
    pub fn remove_namespace(&mut self, namespace: &PersistentNamespaceId) -> (Vec<MapId>, Vec<BatchOperation>) {
        let Some(origins) = self.records.remove(namespace) else {
            return (Vec::new(), Vec::new());
        };
        origins
            .into_iter()
            .map(|(origin, map)| (map, BatchOperation::delete(namespace_key(namespace, &origin))))
            .unzip()
    }

    pub fn contains_namespace(&self, namespace: &PersistentNamespaceId) -> bool {
        self.records.contains_key(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &PersistentNamespaceId> + '_ {
        self.records.keys()
    }

    /// Number of records referencing each map.
    pub fn refcounts(&self) -> HashMap<MapId, usize> {
        let mut counts = HashMap::new();
        for map in self.records.values().flat_map(BTreeMap::values) {
            *counts.entry(*map).or_insert(0) += 1;
        }
        counts
    }

    /// Every record, sorted by namespace then origin.
    pub fn usage(&self) -> Vec<StorageUsageInfo> {
        self.records
            .iter()
            .flat_map(|(namespace, origins)| {
                origins.iter().map(move |(origin, map)| StorageUsageInfo {
                    persistent_namespace_id: namespace.clone(),
                    origin: origin.clone(),
                    map_id: *map,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
