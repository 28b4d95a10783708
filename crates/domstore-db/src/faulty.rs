use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::batch::BatchOperation;
use crate::error::{DatabaseError, DbResult};
use crate::memory::InMemoryDatabase;
use crate::traits::{Database, DatabaseOpener};

/// In-memory database whose reads and writes can be made to fail on demand.
///
/// Failed writes leave the contents untouched, matching the atomicity every
/// [`Database`] promises.
#[derive(Default)]
pub struct FaultyDatabase {
    inner: InMemoryDatabase,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
    writes_always_fail: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl FaultyDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` reads (`get` and `get_prefixed`).
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` writes.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Fail every write until turned off again.
    pub fn fail_all_writes(&self, on: bool) {
        self.writes_always_fail.store(on, Ordering::SeqCst);
    }

    /// Reads attempted so far, failed ones included.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Writes attempted so far, failed ones included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// The wrapped database, for inspecting contents.
    pub fn contents(&self) -> &InMemoryDatabase {
        &self.inner
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_read(&self) -> DbResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_reads) {
            return Err(DatabaseError::Injected("read"));
        }
        Ok(())
    }
}

impl Database for FaultyDatabase {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.check_read()?;
        self.inner.get(key)
    }

    fn get_prefixed(&self, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_read()?;
        self.inner.get_prefixed(prefix)
    }

    fn write(&self, ops: &[BatchOperation]) -> DbResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.writes_always_fail.load(Ordering::SeqCst) || Self::take_failure(&self.failing_writes) {
            return Err(DatabaseError::Injected("write"));
        }
        self.inner.write(ops)
    }
}

/// Opener that hands out one shared [`FaultyDatabase`] as its "directory"
/// database and can refuse to open on demand.
///
/// Destroying the directory clears the shared database, so a recreate sees
/// an empty store just as it would on disk.
#[derive(Default)]
pub struct FaultyOpener {
    database: Arc<FaultyDatabase>,
    failing_directory_opens: AtomicUsize,
    failing_memory_opens: AtomicUsize,
    directory_opens: AtomicUsize,
    memory_opens: AtomicUsize,
    destroys: AtomicUsize,
}

impl FaultyOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// The database returned by `open_directory`.
    pub fn database(&self) -> Arc<FaultyDatabase> {
        Arc::clone(&self.database)
    }

    /// Fail the next `n` calls to `open_directory`.
    pub fn fail_next_directory_opens(&self, n: usize) {
        self.failing_directory_opens.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `open_in_memory`.
    pub fn fail_next_memory_opens(&self, n: usize) {
        self.failing_memory_opens.store(n, Ordering::SeqCst);
    }

    pub fn directory_opens(&self) -> usize {
        self.directory_opens.load(Ordering::SeqCst)
    }

    pub fn memory_opens(&self) -> usize {
        self.memory_opens.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

impl DatabaseOpener for FaultyOpener {
    fn open_directory(&self, _dir: &Path) -> DbResult<Arc<dyn Database>> {
        self.directory_opens.fetch_add(1, Ordering::SeqCst);
        if FaultyDatabase::take_failure(&self.failing_directory_opens) {
            return Err(DatabaseError::Injected("open directory"));
        }
        Ok(self.database())
    }

    fn open_in_memory(&self) -> DbResult<Arc<dyn Database>> {
        self.memory_opens.fetch_add(1, Ordering::SeqCst);
        if FaultyDatabase::take_failure(&self.failing_memory_opens) {
            return Err(DatabaseError::Injected("open in memory"));
        }
        Ok(Arc::new(InMemoryDatabase::new()))
    }

    fn destroy_directory(&self, _dir: &Path) -> DbResult<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.database.contents().clear()
    }
}
