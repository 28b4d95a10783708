use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use domstore_db::BatchOperation;
use domstore_types::keys::{
    encode_number, parse_map_id, parse_number, CURRENT_SCHEMA_VERSION, MIN_SCHEMA_VERSION,
    NAMESPACE_PREFIX, NEXT_MAP_ID_KEY, VERSION_KEY,
};
use domstore_types::MapId;

use crate::worker::{DbJob, DbReply, DbRequest, JobTag};

/// Lifecycle of the database connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    VerifyingSchema,
    FetchingMetadata,
    Ready,
    Recreating,
    ShutDown,
}

/// Where committed data currently goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Directory,
    InMemory,
    /// No database at all; nothing is persisted.
    None,
}

/// A connection step awaiting its database reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    OpenDirectory,
    OpenInMemory,
    Destroy,
    ReadVersion,
    ReadNamespaces,
    ReadNextMapId,
}

/// What the connection read while coming up.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Every `namespace-` row.
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
    /// The persisted `next-map-id`, if present and well formed.
    pub next_map_id: Option<MapId>,
}

/// Result of feeding a reply to the connection.
#[derive(Debug)]
pub enum Progress {
    /// Submit these jobs and keep waiting.
    Continue(Vec<DbJob>),
    /// The connection is ready; load this metadata.
    Ready(Metadata),
}

/// Snapshot of the connection for status reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub backend: Backend,
    pub recreate_count: u32,
    pub commit_errors: u32,
    pub directory: Option<PathBuf>,
}

/// The connection state machine.
///
/// It never touches the database itself: every transition returns the jobs
/// to run, and replies come back through [`Connection::on_reply`]. Each
/// recreate bumps the epoch so replies to jobs issued before it are dropped.
///
/// Recovery ladder once anything fails:
///
/// 1. destroy the directory database and reopen it (only once it has opened)
/// 2. open an in-memory database
/// 3. run without a database
#[derive(Debug)]
pub struct Connection {
    directory: Option<PathBuf>,
    /// The directory database opened at least once; only then is it worth
    /// destroying.
    directory_opened: bool,
    state: ConnectionState,
    backend: Backend,
    epoch: u64,
    /// Position on the recovery ladder while recovering.
    rung: Option<u8>,
    recreate_count: u32,
    version_present: bool,
    namespace_rows: Vec<(Vec<u8>, Vec<u8>)>,
    commit_errors: u32,
    commit_error_threshold: u32,
    recreated_for_commit_errors: bool,
    excess_logged: bool,
}

impl Connection {
    pub fn new(directory: Option<PathBuf>, commit_error_threshold: u32) -> Self {
        Self {
            directory,
            directory_opened: false,
            state: ConnectionState::Unconnected,
            backend: Backend::None,
            epoch: 0,
            rung: None,
            recreate_count: 0,
            version_present: false,
            namespace_rows: Vec::new(),
            commit_errors: 0,
            commit_error_threshold,
            recreated_for_commit_errors: false,
            excess_logged: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn is_shut_down(&self) -> bool {
        self.state == ConnectionState::ShutDown
    }

    /// Whether writes reach a database.
    pub fn has_database(&self) -> bool {
        self.backend != Backend::None
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            backend: self.backend,
            recreate_count: self.recreate_count,
            commit_errors: self.commit_errors,
            directory: self.directory.clone(),
        }
    }

    /// Begin connecting.
    pub fn start(&mut self) -> Vec<DbJob> {
        self.state = ConnectionState::Connecting;
        match self.directory.clone() {
            Some(dir) => {
                info!(directory = %dir.display(), "opening database");
                vec![self.job(Step::OpenDirectory, DbRequest::OpenDirectory(dir))]
            }
            None => vec![self.job(Step::OpenInMemory, DbRequest::OpenInMemory)],
        }
    }

    /// Advance on the reply to a connection job.
    pub fn on_reply(&mut self, epoch: u64, step: Step, reply: DbReply) -> Progress {
        if epoch != self.epoch || self.is_shut_down() {
            debug!(?step, epoch, current = self.epoch, "dropping stale connection reply");
            return Progress::Continue(Vec::new());
        }
        match (step, reply) {
            (Step::OpenDirectory, DbReply::Opened(Ok(()))) => {
                self.backend = Backend::Directory;
                self.directory_opened = true;
                self.verify()
            }
            (Step::OpenDirectory, DbReply::Opened(Err(e))) if self.rung.is_none() => {
                warn!(error = %e, "failed to open database directory; falling back to memory");
                Progress::Continue(vec![self.job(Step::OpenInMemory, DbRequest::OpenInMemory)])
            }
            (Step::OpenInMemory, DbReply::Opened(Ok(()))) => {
                self.backend = Backend::InMemory;
                self.verify()
            }
            (Step::Destroy, DbReply::Destroyed(Ok(()))) => match self.directory.clone() {
                Some(dir) => Progress::Continue(vec![self.job(Step::OpenDirectory, DbRequest::OpenDirectory(dir))]),
                None => self.fail("no directory to reopen"),
            },
            (Step::ReadVersion, DbReply::Value(Ok(None))) => {
                self.version_present = false;
                self.fetch_metadata()
            }
            (Step::ReadVersion, DbReply::Value(Ok(Some(raw)))) => match parse_number(&raw) {
                Ok(version) if (MIN_SCHEMA_VERSION..=CURRENT_SCHEMA_VERSION).contains(&version) => {
                    self.version_present = true;
                    self.fetch_metadata()
                }
                Ok(version) => {
                    warn!(version, "unsupported schema version");
                    self.fail("unsupported schema version")
                }
                Err(e) => {
                    warn!(error = %e, "unreadable schema version");
                    self.fail("unreadable schema version")
                }
            },
            (Step::ReadNamespaces, DbReply::Rows(Ok(rows))) => {
                self.namespace_rows = rows;
                Progress::Continue(Vec::new())
            }
            (Step::ReadNextMapId, DbReply::Value(Ok(raw))) => {
                let next_map_id = raw.and_then(|raw| match parse_map_id(&raw) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed next-map-id");
                        None
                    }
                });
                self.mark_ready();
                info!(
                    backend = ?self.backend,
                    namespace_rows = self.namespace_rows.len(),
                    "database ready"
                );
                Progress::Ready(Metadata {
                    rows: std::mem::take(&mut self.namespace_rows),
                    next_map_id,
                })
            }
            (step, DbReply::Opened(Err(e)))
            | (step, DbReply::Destroyed(Err(e)))
            | (step, DbReply::Value(Err(e)))
            | (step, DbReply::Rows(Err(e))) => {
                warn!(?step, error = %e, corruption = e.is_corruption(), "database step failed");
                self.fail("database step failed")
            }
            (step, reply) => {
                debug!(?step, ?reply, "unexpected connection reply");
                Progress::Continue(Vec::new())
            }
        }
    }

    /// Abandon the current database and move one rung down the recovery
    /// ladder. Entering recovery counts as one recreate.
    pub fn fail(&mut self, reason: &str) -> Progress {
        self.epoch += 1;
        self.backend = Backend::None;
        self.namespace_rows.clear();
        self.version_present = false;
        self.state = ConnectionState::Recreating;
        let mut rung = match self.rung {
            Some(rung) => rung + 1,
            None => {
                self.recreate_count += 1;
                self.commit_errors = 0;
                warn!(reason, recreate_count = self.recreate_count, "recreating database");
                0
            }
        };

        if rung == 0 && (self.directory.is_none() || !self.directory_opened) {
            rung = 1;
        }
        self.rung = Some(rung);
        match (rung, self.directory.clone()) {
            (0, Some(dir)) => Progress::Continue(vec![self.job(Step::Destroy, DbRequest::DestroyDirectory(dir))]),
            (0 | 1, _) => Progress::Continue(vec![self.job(Step::OpenInMemory, DbRequest::OpenInMemory)]),
            _ => {
                warn!("no database available; continuing without persistence");
                self.mark_ready();
                Progress::Ready(Metadata::default())
            }
        }
    }

    /// Account for a finished write. Returns `true` when the database should
    /// be recreated.
    ///
    /// Only the first time the threshold is exceeded triggers a recreate.
    pub fn record_commit(&mut self, succeeded: bool) -> bool {
        if succeeded {
            self.commit_errors = 0;
            return false;
        }
        self.version_present = false;
        self.commit_errors += 1;
        debug!(commit_errors = self.commit_errors, "commit failed");
        if self.commit_errors <= self.commit_error_threshold {
            return false;
        }
        if self.recreated_for_commit_errors {
            if !self.excess_logged {
                warn!(
                    commit_errors = self.commit_errors,
                    "commit errors keep exceeding the threshold; already recreated once"
                );
                self.excess_logged = true;
            }
            return false;
        }
        self.recreated_for_commit_errors = true;
        true
    }

    /// Prefix a write with the schema version if the database lacks it.
    pub fn prepare_write(&mut self, mut ops: Vec<BatchOperation>) -> Vec<BatchOperation> {
        if !self.version_present && self.has_database() {
            ops.insert(0, BatchOperation::put(VERSION_KEY, encode_number(CURRENT_SCHEMA_VERSION)));
            self.version_present = true;
        }
        ops
    }

    pub fn shut_down(&mut self) {
        self.state = ConnectionState::ShutDown;
    }

    fn mark_ready(&mut self) {
        self.state = ConnectionState::Ready;
        self.rung = None;
    }

    fn verify(&mut self) -> Progress {
        self.state = ConnectionState::VerifyingSchema;
        Progress::Continue(vec![self.job(Step::ReadVersion, DbRequest::Get(VERSION_KEY.to_vec()))])
    }

    fn fetch_metadata(&mut self) -> Progress {
        self.state = ConnectionState::FetchingMetadata;
        Progress::Continue(vec![
            self.job(Step::ReadNamespaces, DbRequest::GetPrefixed(NAMESPACE_PREFIX.to_vec())),
            self.job(Step::ReadNextMapId, DbRequest::Get(NEXT_MAP_ID_KEY.to_vec())),
        ])
    }

    fn job(&self, step: Step, request: DbRequest) -> DbJob {
        DbJob {
            tag: JobTag::Connect(step),
            epoch: self.epoch,
            request,
        }
    }
}
