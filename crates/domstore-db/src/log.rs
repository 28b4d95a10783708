use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::{apply_batch, collect_prefixed, BatchOperation};
use crate::error::{DatabaseError, DbResult};
use crate::traits::Database;

/// Name of the log file inside the database directory.
pub const LOG_FILE_NAME: &str = "domstore.log";

const COMPACT_FILE_NAME: &str = "domstore.log.compact";

/// Held locked for as long as a [`LogDatabase`] is open on the directory.
const LOCK_FILE_NAME: &str = "LOCK";

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// Flush/sync strategy for the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every batch (safest, highest latency).
    EveryWrite,
    /// Rely on OS page-cache buffering (fastest, least durable).
    #[default]
    OsDefault,
}

/// Configuration for [`LogDatabase`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Create the directory if it does not exist.
    pub create_if_missing: bool,
    /// Sync strategy.
    pub sync_mode: SyncMode,
    /// Log size below which compaction never runs (default: 4 MiB).
    pub compaction_threshold: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_mode: SyncMode::default(),
            compaction_threshold: 4 * 1024 * 1024, // 4 MiB
        }
    }
}

/// One framed log record: a complete batch.
///
/// On-disk format:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized LogRecord)]
/// ```
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    ops: Vec<BatchOperation>,
}

struct LogState {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    file: File,
    /// End of the last complete record.
    offset: u64,
    /// Log size right after the last open or compaction.
    base_size: u64,
}

/// On-disk ordered database.
///
/// Every batch is appended to a single log file as one CRC32-framed record
/// and then applied to an in-memory ordered map that serves all reads. On
/// open the log is replayed front-to-back. A record cut short at the end of
/// the file is the remains of a crashed write and is truncated away; a bad
/// record followed by more data means the file is damaged and opening fails
/// with [`DatabaseError::Corruption`].
///
/// When the log has grown to twice its post-compaction size (and past the
/// configured threshold) it is rewritten as a single snapshot record.
///
/// A directory is opened by at most one `LogDatabase` at a time, across
/// processes; the lock is released when the database is dropped.
pub struct LogDatabase {
    dir: PathBuf,
    options: LogOptions,
    state: Mutex<LogState>,
    _lock: File,
}

impl LogDatabase {
    /// Open (or create) the database in `dir`.
    pub fn open(dir: &Path, options: LogOptions) -> DbResult<Self> {
        if !dir.exists() {
            if !options.create_if_missing {
                return Err(DatabaseError::NotFound(dir.to_path_buf()));
            }
            fs::create_dir_all(dir)?;
        }
        let lock = lock_directory(dir)?;

        let path = dir.join(LOG_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let bytes = fs::read(&path)?;
        let (entries, valid_len) = replay(&bytes)?;
        if valid_len < bytes.len() as u64 {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = bytes.len(),
                "dropping torn record at end of log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        info!(path = %path.display(), keys = entries.len(), bytes = valid_len, "opened log database");
        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            state: Mutex::new(LogState {
                entries,
                file,
                offset: valid_len,
                base_size: valid_len,
            }),
            _lock: lock,
        })
    }

    /// Remove the database directory and everything in it.
    pub fn destroy(dir: &Path) -> DbResult<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => {
                info!(dir = %dir.display(), "destroyed log database");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory holding the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current log size in bytes.
    pub fn log_size(&self) -> DbResult<u64> {
        Ok(self.lock()?.offset)
    }

    /// Number of live keys.
    pub fn len(&self) -> DbResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    /// Returns `true` if the database holds no keys.
    pub fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Rewrite the log as a single snapshot of the live entries.
    pub fn compact(&self) -> DbResult<()> {
        let mut state = self.lock()?;
        self.compact_locked(&mut state)
    }

    fn lock(&self) -> DbResult<std::sync::MutexGuard<'_, LogState>> {
        self.state.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    fn compact_locked(&self, state: &mut LogState) -> DbResult<()> {
        let ops: Vec<BatchOperation> = state
            .entries
            .iter()
            .map(|(k, v)| BatchOperation::put(k.clone(), v.clone()))
            .collect();
        let frame = if ops.is_empty() {
            Vec::new()
        } else {
            encode_frame(&LogRecord { ops })?
        };

        let tmp_path = self.dir.join(COMPACT_FILE_NAME);
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&frame)?;
            tmp.sync_all()?;
        }
        let path = self.dir.join(LOG_FILE_NAME);
        fs::rename(&tmp_path, &path)?;
        sync_directory(&self.dir)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;

        debug!(before = state.offset, after = frame.len(), "compacted log");
        state.file = file;
        state.offset = frame.len() as u64;
        state.base_size = state.offset;
        Ok(())
    }

    fn should_compact(&self, state: &LogState) -> bool {
        state.offset >= self.options.compaction_threshold
            && state.offset >= state.base_size.saturating_mul(2)
    }
}

impl Database for LogDatabase {
    fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.lock()?.entries.get(key).cloned())
    }

    fn get_prefixed(&self, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(collect_prefixed(&self.lock()?.entries, prefix))
    }

    fn write(&self, ops: &[BatchOperation]) -> DbResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(&LogRecord { ops: ops.to_vec() })?;

        let mut state = self.lock()?;
        let start = state.offset;
        let appended = state.file.write_all(&frame).and_then(|()| match self.options.sync_mode {
            SyncMode::EveryWrite => state.file.sync_data(),
            SyncMode::OsDefault => state.file.flush(),
        });
        if let Err(e) = appended {
            // Leave no partial record behind for the next append to follow.
            let _ = state.file.set_len(start);
            let _ = state.file.seek(SeekFrom::Start(start));
            return Err(e.into());
        }
        state.offset += frame.len() as u64;
        apply_batch(&mut state.entries, ops);
        debug!(offset = start, len = frame.len(), ops = ops.len(), "log append");

        if self.should_compact(&state) {
            if let Err(e) = self.compact_locked(&mut state) {
                warn!(error = %e, "log compaction failed");
            }
        }
        Ok(())
    }
}

fn lock_directory(dir: &Path) -> DbResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.join(LOCK_FILE_NAME))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(DatabaseError::Locked(dir.to_path_buf())),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

/// Make a rename inside `dir` durable.
#[cfg(unix)]
fn sync_directory(dir: &Path) -> DbResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> DbResult<()> {
    Ok(())
}

fn encode_frame(record: &LogRecord) -> DbResult<Vec<u8>> {
    let payload =
        bincode::serialize(record).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let length = u32::try_from(payload.len())
        .map_err(|_| DatabaseError::InvalidArgument(format!("batch of {} bytes", payload.len())))?;
    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Replay a log image. Returns the resulting entries and the length of the
/// valid prefix of `bytes`.
fn replay(bytes: &[u8]) -> DbResult<(BTreeMap<Vec<u8>, Vec<u8>>, u64)> {
    let mut entries = BTreeMap::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < HEADER_SIZE {
            break;
        }
        let length = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let expected_crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);

        if length == 0 {
            return Err(DatabaseError::Corruption {
                offset: offset as u64,
                reason: "zero-length record".into(),
            });
        }
        if rest.len() < HEADER_SIZE + length {
            break;
        }

        let payload = &rest[HEADER_SIZE..HEADER_SIZE + length];
        let is_last = rest.len() == HEADER_SIZE + length;
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            if is_last {
                break;
            }
            return Err(DatabaseError::Corruption {
                offset: offset as u64,
                reason: format!("CRC mismatch: expected {expected_crc:#010x}, got {actual_crc:#010x}"),
            });
        }

        let record: LogRecord = bincode::deserialize(payload).map_err(|e| DatabaseError::Corruption {
            offset: offset as u64,
            reason: format!("undecodable record: {e}"),
        })?;
        apply_batch(&mut entries, &record.ops);
        offset += HEADER_SIZE + length;
    }

    Ok((entries, offset as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDatabase;
    use proptest::prelude::*;
    use std::io::Read;

    fn open(dir: &Path) -> LogDatabase {
        LogDatabase::open(dir, LogOptions::default()).unwrap()
    }

    fn log_path(dir: &Path) -> PathBuf {
        dir.join(LOG_FILE_NAME)
    }

    #[test]
    fn write_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(&[BatchOperation::put("a", "1"), BatchOperation::put("b", "2")])
            .unwrap();
        db.write(&[BatchOperation::delete("a")]).unwrap();
        drop(db);

        let db = open(dir.path());
        assert_eq!(db.get(b"a").unwrap(), None);
        assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn missing_directory_without_create_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let options = LogOptions {
            create_if_missing: false,
            ..LogOptions::default()
        };
        let err = LogDatabase::open(&dir.path().join("absent"), options).err().unwrap();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(&[]).unwrap();
        assert_eq!(db.log_size().unwrap(), 0);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(&[BatchOperation::put("a", "1")]).unwrap();
        let good_len = db.log_size().unwrap();
        db.write(&[BatchOperation::put("b", "2")]).unwrap();
        drop(db);

        // Chop the second record in half.
        let full_len = fs::metadata(log_path(dir.path())).unwrap().len();
        let file = OpenOptions::new().write(true).open(log_path(dir.path())).unwrap();
        file.set_len(good_len + (full_len - good_len) / 2).unwrap();
        drop(file);

        let db = open(dir.path());
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), None);
        assert_eq!(db.log_size().unwrap(), good_len);
        assert_eq!(fs::metadata(log_path(dir.path())).unwrap().len(), good_len);

        // Appends continue cleanly after the truncation point.
        db.write(&[BatchOperation::put("c", "3")]).unwrap();
        drop(db);
        let db = open(dir.path());
        assert_eq!(db.get(b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn bad_crc_on_final_record_is_torn() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(&[BatchOperation::put("a", "1")]).unwrap();
        let good_len = db.log_size().unwrap();
        db.write(&[BatchOperation::put("b", "2")]).unwrap();
        drop(db);

        flip_byte(&log_path(dir.path()), good_len + HEADER_SIZE as u64);

        let db = open(dir.path());
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b").unwrap(), None);
    }

    #[test]
    fn bad_crc_mid_log_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(&[BatchOperation::put("a", "1")]).unwrap();
        db.write(&[BatchOperation::put("b", "2")]).unwrap();
        drop(db);

        flip_byte(&log_path(dir.path()), HEADER_SIZE as u64);

        let err = LogDatabase::open(dir.path(), LogOptions::default()).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn zero_length_record_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(log_path(dir.path()), [0u8; 16]).unwrap();
        let err = LogDatabase::open(dir.path(), LogOptions::default()).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn compaction_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let options = LogOptions {
            compaction_threshold: 512,
            ..LogOptions::default()
        };
        let db = LogDatabase::open(dir.path(), options.clone()).unwrap();
        for i in 0..200u32 {
            db.write(&[BatchOperation::put("hot", i.to_string())]).unwrap();
        }
        db.write(&[BatchOperation::put("cold", "x")]).unwrap();
        assert!(db.log_size().unwrap() < 200 * HEADER_SIZE as u64);
        drop(db);

        let db = LogDatabase::open(dir.path(), options).unwrap();
        assert_eq!(db.get(b"hot").unwrap(), Some(b"199".to_vec()));
        assert_eq!(db.get(b"cold").unwrap(), Some(b"x".to_vec()));
        assert!(!dir.path().join(COMPACT_FILE_NAME).exists());
    }

    #[test]
    fn explicit_compaction_of_empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(&[BatchOperation::put("a", "1")]).unwrap();
        db.write(&[BatchOperation::delete_prefixed("")]).unwrap();
        db.compact().unwrap();
        assert_eq!(db.log_size().unwrap(), 0);
        assert!(db.is_empty().unwrap());
    }

    #[test]
    fn second_open_of_a_directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.write(&[BatchOperation::put("a", "1")]).unwrap();

        let err = LogDatabase::open(dir.path(), LogOptions::default()).err().unwrap();
        assert!(matches!(err, DatabaseError::Locked(_)));

        drop(db);
        let db = open(dir.path());
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn destroy_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let db = open(&path);
        db.write(&[BatchOperation::put("a", "1")]).unwrap();
        drop(db);
        LogDatabase::destroy(&path).unwrap();
        assert!(!path.exists());
        // Destroying twice is fine.
        LogDatabase::destroy(&path).unwrap();
    }

    fn operation() -> impl Strategy<Value = BatchOperation> {
        let key = "[a-c]{0,3}";
        prop_oneof![
            (key, "[x-z]{0,4}").prop_map(|(k, v)| BatchOperation::put(k, v)),
            key.prop_map(BatchOperation::delete),
            "[a-c]{0,2}".prop_map(BatchOperation::delete_prefixed),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn reopened_log_matches_memory(
            batches in prop::collection::vec(prop::collection::vec(operation(), 0..6), 0..12),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let options = LogOptions {
                compaction_threshold: 256,
                ..LogOptions::default()
            };
            let memory = InMemoryDatabase::new();
            {
                let db = LogDatabase::open(dir.path(), options.clone()).unwrap();
                for batch in &batches {
                    db.write(batch).unwrap();
                    memory.write(batch).unwrap();
                }
            }
            let db = LogDatabase::open(dir.path(), options).unwrap();
            let expected: Vec<_> = memory.snapshot().unwrap().into_iter().collect();
            prop_assert_eq!(db.get_prefixed(b"").unwrap(), expected);
        }
    }

    fn flip_byte(path: &Path, at: u64) {
        let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(at)).unwrap();
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        file.seek(SeekFrom::Start(at)).unwrap();
        file.write_all(&buf).unwrap();
        file.sync_all().unwrap();
    }
}
