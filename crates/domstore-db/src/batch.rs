use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One operation inside an atomic write batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOperation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Delete every key starting with `prefix`.
    DeletePrefixed { prefix: Vec<u8> },
}

impl BatchOperation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn delete_prefixed(prefix: impl Into<Vec<u8>>) -> Self {
        Self::DeletePrefixed {
            prefix: prefix.into(),
        }
    }
}

/// Apply `ops` in order to an ordered map.
pub fn apply_batch(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: &[BatchOperation]) {
    for op in ops {
        match op {
            BatchOperation::Put { key, value } => {
                map.insert(key.clone(), value.clone());
            }
            BatchOperation::Delete { key } => {
                map.remove(key);
            }
            BatchOperation::DeletePrefixed { prefix } => {
                let doomed: Vec<Vec<u8>> = map
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in doomed {
                    map.remove(&key);
                }
            }
        }
    }
}

/// Ordered `(key, value)` pairs of `map` whose key starts with `prefix`.
pub(crate) fn collect_prefixed(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
