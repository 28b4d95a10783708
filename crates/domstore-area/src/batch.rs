use std::collections::BTreeMap;

use domstore_db::BatchOperation;
use domstore_types::keys::map_key;
use domstore_types::{StorageKey, StorageValue};

/// Mutations accrued for one map since its last flush.
///
/// `changed` holds the latest state of every touched key: `Some(value)` for
/// a put, `None` for a delete. When `clear_all_first` is set the flush wipes
/// the whole prefix before applying `changed`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitBatch {
    pub clear_all_first: bool,
    pub changed: BTreeMap<StorageKey, Option<StorageValue>>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A batch that rewrites a prefix to exactly `values`.
    pub fn snapshot(values: &BTreeMap<StorageKey, StorageValue>) -> Self {
        Self {
            clear_all_first: true,
            changed: values
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
        }
    }

    pub fn record_put(&mut self, key: StorageKey, value: StorageValue) {
        self.changed.insert(key, Some(value));
    }

    pub fn record_delete(&mut self, key: StorageKey) {
        self.changed.insert(key, None);
    }

    pub fn clear_all(&mut self) {
        self.clear_all_first = true;
        self.changed.clear();
    }

    /// This batch with `later` applied on top of it.
    pub fn followed_by(mut self, later: &CommitBatch) -> CommitBatch {
        if later.clear_all_first {
            return later.clone();
        }
        self.changed
            .extend(later.changed.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Apply this batch to a logical view of the map's rows.
    pub fn apply_to(&self, values: &mut BTreeMap<StorageKey, StorageValue>) {
        if self.clear_all_first {
            values.clear();
        }
        for (key, value) in &self.changed {
            match value {
                Some(value) => values.insert(key.clone(), value.clone()),
                None => values.remove(key),
            };
        }
    }

    /// Key and value bytes this batch writes.
    pub fn data_size(&self) -> usize {
        self.changed
            .iter()
            .map(|(k, v)| k.len() + v.as_ref().map_or(0, Vec::len))
            .sum()
    }

    /// Database operations applying this batch under `prefix`.
    pub fn to_operations(&self, prefix: &[u8]) -> Vec<BatchOperation> {
        let mut ops = Vec::with_capacity(self.changed.len() + 1);
        if self.clear_all_first {
            ops.push(BatchOperation::delete_prefixed(prefix));
        }
        for (key, value) in &self.changed {
            let key = map_key(prefix, key);
            ops.push(match value {
                Some(value) => BatchOperation::Put {
                    key,
                    value: value.clone(),
                },
                None => BatchOperation::Delete { key },
            });
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_mutations_override_earlier_ones() {
        let mut batch = CommitBatch::new();
        batch.record_put(b"k".to_vec(), b"1".to_vec());
        batch.record_put(b"k".to_vec(), b"2".to_vec());
        batch.record_delete(b"j".to_vec());
        assert_eq!(
            batch.to_operations(b"map-3-"),
            vec![
                BatchOperation::delete("map-3-j"),
                BatchOperation::put("map-3-k", "2"),
            ]
        );
        assert_eq!(batch.data_size(), 3);
    }

    #[test]
    fn clear_all_discards_earlier_changes_and_leads() {
        let mut batch = CommitBatch::new();
        batch.record_put(b"a".to_vec(), b"1".to_vec());
        batch.clear_all();
        batch.record_put(b"b".to_vec(), b"2".to_vec());
        assert_eq!(
            batch.to_operations(b"map-0-"),
            vec![
                BatchOperation::delete_prefixed("map-0-"),
                BatchOperation::put("map-0-b", "2"),
            ]
        );
    }

    #[test]
    fn snapshot_rewrites_whole_prefix() {
        let values = BTreeMap::from([(b"x".to_vec(), b"1".to_vec())]);
        let batch = CommitBatch::snapshot(&values);
        assert!(batch.clear_all_first);
        assert_eq!(
            batch.to_operations(b"map-9-"),
            vec![
                BatchOperation::delete_prefixed("map-9-"),
                BatchOperation::put("map-9-x", "1"),
            ]
        );
    }

    #[test]
    fn followed_by_keeps_order_of_application() {
        let mut older = CommitBatch::new();
        older.record_put(b"a".to_vec(), b"1".to_vec());
        older.record_put(b"b".to_vec(), b"1".to_vec());
        let mut newer = CommitBatch::new();
        newer.record_delete(b"a".to_vec());
        newer.record_put(b"c".to_vec(), b"2".to_vec());

        let merged = older.clone().followed_by(&newer);
        assert!(!merged.clear_all_first);
        assert_eq!(
            merged.to_operations(b"map-1-"),
            vec![
                BatchOperation::delete("map-1-a"),
                BatchOperation::put("map-1-b", "1"),
                BatchOperation::put("map-1-c", "2"),
            ]
        );

        let mut wipe = CommitBatch::new();
        wipe.clear_all();
        assert_eq!(older.followed_by(&wipe), wipe);
    }

    #[test]
    fn apply_to_matches_the_written_rows() {
        let mut values = BTreeMap::from([
            (b"a".to_vec(), b"0".to_vec()),
            (b"b".to_vec(), b"0".to_vec()),
        ]);
        let mut batch = CommitBatch::new();
        batch.record_delete(b"a".to_vec());
        batch.record_put(b"c".to_vec(), b"1".to_vec());
        batch.apply_to(&mut values);
        assert_eq!(
            values,
            BTreeMap::from([(b"b".to_vec(), b"0".to_vec()), (b"c".to_vec(), b"1".to_vec())])
        );

        batch.clear_all();
        batch.apply_to(&mut values);
        assert!(values.is_empty());
    }
}
