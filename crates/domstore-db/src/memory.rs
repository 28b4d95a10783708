use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::batch::{apply_batch, collect_prefixed, BatchOperation};
use crate::error::{DatabaseError, DbResult};
use crate::traits::Database;

/// In-memory, `BTreeMap`-based database.
///
/// Used by tests and as the fallback when the on-disk database cannot be
/// opened. Contents are lost when the last handle is dropped.
pub struct InMemoryDatabase {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryDatabase {
    /// Create a new empty database.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> DbResult<usize> {
        Ok(self.entries.read().map_err(|_| DatabaseError::LockPoisoned)?.len())
    }

    /// Returns `true` if the database holds no keys.
    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Copy of every entry, in key order.
    pub fn snapshot(&self) -> DbResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        Ok(self.entries.read().map_err(|_| DatabaseError::LockPoisoned)?.clone())
    }

    /// Remove every key.
    pub fn clear(&self) -> DbResult<()> {
        self.entries
            .write()
            .map_err(|_| DatabaseError::LockPoisoned)?
            .clear();
        Ok(())
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for InMemoryDatabase {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| DatabaseError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn get_prefixed(&self, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read().map_err(|_| DatabaseError::LockPoisoned)?;
        Ok(collect_prefixed(&entries, prefix))
    }

    fn write(&self, ops: &[BatchOperation]) -> DbResult<()> {
        let mut entries = self.entries.write().map_err(|_| DatabaseError::LockPoisoned)?;
        apply_batch(&mut entries, ops);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_missing_returns_none() {
        let db = InMemoryDatabase::new();
        assert_eq!(db.get(b"nope").unwrap(), None);
        assert!(db.is_empty().unwrap());
    }

    #[test]
    fn write_then_read() {
        let db = InMemoryDatabase::new();
        db.write(&[
            BatchOperation::put("map-1-a", "1"),
            BatchOperation::put("map-1-b", "2"),
            BatchOperation::put("map-2-a", "3"),
        ])
        .unwrap();
        assert_eq!(db.len().unwrap(), 3);
        assert_eq!(db.get(b"map-1-b").unwrap(), Some(b"2".to_vec()));
        let rows = db.get_prefixed(b"map-1-").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"map-1-a".to_vec());
    }

    #[test]
    fn clear_and_snapshot() {
        let db = InMemoryDatabase::new();
        db.write(&[BatchOperation::put("k", "v")]).unwrap();
        assert_eq!(db.snapshot().unwrap().len(), 1);
        db.clear().unwrap();
        assert!(db.is_empty().unwrap());
    }
}
