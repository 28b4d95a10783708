use std::path::Path;
use std::sync::Arc;

use crate::batch::BatchOperation;
use crate::error::DbResult;
use crate::log::{LogDatabase, LogOptions};
use crate::memory::InMemoryDatabase;

/// Ordered byte-keyed database.
///
/// All implementations must satisfy these invariants:
/// - `write` is atomic: either every operation in the batch is applied or
///   none is, and a successful return means the batch is durable to the
///   degree the backend promises.
/// - `get_prefixed` returns entries in ascending key order.
/// - Reads observe every previously successful write.
pub trait Database: Send + Sync {
    /// Read a single key. Returns `Ok(None)` if it does not exist.
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>>;

    /// Read every entry whose key starts with `prefix`, in key order.
    fn get_prefixed(&self, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a batch atomically.
    fn write(&self, ops: &[BatchOperation]) -> DbResult<()>;
}

/// Opens and destroys databases.
///
/// The connection layer only ever talks to databases through an opener, so
/// tests can substitute one that fails on demand.
pub trait DatabaseOpener: Send + Sync {
    /// Open (creating if needed) the on-disk database in `dir`.
    fn open_directory(&self, dir: &Path) -> DbResult<Arc<dyn Database>>;

    /// Open a fresh, empty in-memory database.
    fn open_in_memory(&self) -> DbResult<Arc<dyn Database>>;

    /// Remove the on-disk database in `dir` entirely.
    fn destroy_directory(&self, dir: &Path) -> DbResult<()>;
}

/// Opener backed by [`LogDatabase`] on disk and [`InMemoryDatabase`] in memory.
#[derive(Clone, Debug, Default)]
pub struct DefaultOpener {
    options: LogOptions,
}

impl DefaultOpener {
    pub fn new(options: LogOptions) -> Self {
        Self { options }
    }
}

impl DatabaseOpener for DefaultOpener {
    fn open_directory(&self, dir: &Path) -> DbResult<Arc<dyn Database>> {
        Ok(Arc::new(LogDatabase::open(dir, self.options.clone())?))
    }

    fn open_in_memory(&self) -> DbResult<Arc<dyn Database>> {
        Ok(Arc::new(InMemoryDatabase::new()))
    }

    fn destroy_directory(&self, dir: &Path) -> DbResult<()> {
        LogDatabase::destroy(dir)
    }
}
