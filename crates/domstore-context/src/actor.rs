use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use domstore_area::{Access, CacheMode, CommitTimer, LoadStart, ObserverStream, PendingCommit};
use domstore_db::{BatchOperation, DatabaseOpener, DbResult};
use domstore_types::{MapId, NamespaceId, Origin, PersistentNamespaceId, StorageKey, StorageValue};

use crate::config::ContextConfig;
use crate::connection::{Connection, Progress};
use crate::context::ContextStatus;
use crate::error::{ContextError, ContextResult};
use crate::metadata::StorageUsageInfo;
use crate::registry::{MutationOutcome, Registry};
use crate::worker::{DbCompletion, DbJob, DbReply, DbRequest, DbWorker, JobTag};

type Reply<T> = oneshot::Sender<ContextResult<T>>;

/// Messages from [`StorageContext`](crate::StorageContext) handles to the
/// owner task.
#[derive(Debug)]
pub(crate) enum Command {
    CreateNamespace {
        id: NamespaceId,
        persistent_id: PersistentNamespaceId,
        reply: Reply<()>,
    },
    CloneNamespace {
        source: NamespaceId,
        id: NamespaceId,
        persistent_id: PersistentNamespaceId,
        reply: Reply<()>,
    },
    DeleteNamespace {
        id: NamespaceId,
        persist: bool,
        reply: Reply<()>,
    },
    Scavenge {
        reply: Reply<()>,
    },
    Usage {
        reply: Reply<Vec<StorageUsageInfo>>,
    },
    OpenArea {
        namespace: NamespaceId,
        origin: Origin,
        reply: Reply<()>,
    },
    Area(AreaRequest),
    Flush {
        reply: Reply<()>,
    },
    PurgeMemory {
        reply: Reply<usize>,
    },
    EnableAggressiveFlushing {
        reply: Reply<()>,
    },
    Status {
        reply: Reply<ContextStatus>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

impl Command {
    fn reject(self, err: ContextError) {
        match self {
            Self::CreateNamespace { reply, .. }
            | Self::CloneNamespace { reply, .. }
            | Self::DeleteNamespace { reply, .. }
            | Self::Scavenge { reply }
            | Self::OpenArea { reply, .. }
            | Self::Flush { reply }
            | Self::EnableAggressiveFlushing { reply }
            | Self::Shutdown { reply } => {
                let _ = reply.send(Err(err));
            }
            Self::Usage { reply } => {
                let _ = reply.send(Err(err));
            }
            Self::PurgeMemory { reply } => {
                let _ = reply.send(Err(err));
            }
            Self::Status { reply } => {
                let _ = reply.send(Err(err));
            }
            Self::Area(request) => request.op.fail(err),
        }
    }
}

/// An operation on one area.
#[derive(Debug)]
pub(crate) struct AreaRequest {
    pub namespace: NamespaceId,
    pub origin: Origin,
    pub op: AreaOp,
}

#[derive(Debug)]
pub(crate) enum AreaOp {
    Get {
        key: StorageKey,
        reply: Reply<Option<StorageValue>>,
    },
    GetAll {
        reply: Reply<Vec<(StorageKey, StorageValue)>>,
    },
    Put {
        key: StorageKey,
        value: StorageValue,
        old_value: Option<StorageValue>,
        source: String,
        reply: Reply<()>,
    },
    Delete {
        key: StorageKey,
        old_value: Option<StorageValue>,
        source: String,
        reply: Reply<()>,
    },
    DeleteAll {
        source: String,
        reply: Reply<()>,
    },
    AddObserver {
        reply: Reply<ObserverStream>,
    },
    SetCacheMode {
        mode: CacheMode,
        reply: Reply<()>,
    },
}

impl AreaOp {
    /// What the map must have loaded first. `None` works on any cache.
    fn access(&self) -> Option<Access> {
        match self {
            Self::Get { .. } | Self::GetAll { .. } => Some(Access::Read),
            Self::Put { .. } | Self::Delete { .. } | Self::DeleteAll { .. } => Some(Access::Write),
            Self::AddObserver { .. } | Self::SetCacheMode { .. } => None,
        }
    }

    fn fail(self, err: ContextError) {
        match self {
            Self::Put { reply, .. }
            | Self::Delete { reply, .. }
            | Self::DeleteAll { reply, .. }
            | Self::SetCacheMode { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Get { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::GetAll { reply } => {
                let _ = reply.send(Err(err));
            }
            Self::AddObserver { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Commit timer expiry for a map, tagged with the connection epoch it was
/// armed under.
#[derive(Clone, Copy, Debug)]
struct TimerFired {
    map_id: MapId,
    epoch: u64,
}

/// The owner task of a storage context.
///
/// All registry, map, and connection state lives here and is only touched
/// from [`ContextActor::run`]. Database I/O is delegated to the
/// [`DbWorker`] thread and comes back as completions.
pub(crate) struct ContextActor {
    connection: Connection,
    registry: Registry,
    worker: DbWorker,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    completions: mpsc::UnboundedReceiver<DbCompletion>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    /// Commands waiting for the connection to become ready.
    pending: VecDeque<Command>,
    /// Area requests waiting for a map load, per map, in arrival order.
    load_waiters: HashMap<MapId, VecDeque<AreaRequest>>,
    flush_waiters: HashMap<u64, Reply<()>>,
    next_flush: u64,
    /// Namespace record writes submitted and not yet acknowledged, oldest first.
    metadata_in_flight: VecDeque<Vec<BatchOperation>>,
    /// Namespace record writes that failed and go out with the next write.
    metadata_retry: Vec<BatchOperation>,
    aggressive_flushing: bool,
    shutting_down: bool,
    shutdown_reply: Option<Reply<()>>,
}

impl ContextActor {
    pub(crate) fn new(
        config: &ContextConfig,
        opener: Arc<dyn DatabaseOpener>,
        commands: mpsc::Receiver<Command>,
    ) -> ContextResult<Self> {
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let worker = DbWorker::spawn(opener, completion_tx)?;
        Ok(Self {
            connection: Connection::new(config.directory.clone(), config.commit_error_threshold),
            registry: Registry::new(config.effective_area_options(), config.directory.is_some()),
            worker,
            commands,
            commands_open: true,
            completions,
            timer_tx,
            timers,
            pending: VecDeque::new(),
            load_waiters: HashMap::new(),
            flush_waiters: HashMap::new(),
            next_flush: 0,
            metadata_in_flight: VecDeque::new(),
            metadata_retry: Vec::new(),
            aggressive_flushing: false,
            shutting_down: false,
            shutdown_reply: None,
        })
    }

    pub(crate) async fn run(mut self) {
        let jobs = self.connection.start();
        self.submit_jobs(jobs);

        loop {
            tokio::select! {
                biased;

                completion = self.completions.recv() => match completion {
                    Some(completion) => {
                        if self.on_completion(completion) {
                            break;
                        }
                    }
                    None => {
                        warn!("database thread exited; shutting down");
                        self.shutting_down = true;
                        self.finish_shutdown();
                        break;
                    }
                },
                Some(fired) = self.timers.recv() => self.on_timer(fired),
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("all handles dropped; shutting down");
                        self.commands_open = false;
                        if !self.shutting_down {
                            self.begin_shutdown(None);
                        }
                    }
                },
            }
        }
        debug!("storage context task exiting");
    }

    // ---- commands -------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        if self.shutting_down {
            command.reject(ContextError::ShutDown);
            return;
        }
        match command {
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            Command::EnableAggressiveFlushing { reply } => {
                self.aggressive_flushing = true;
                info!("aggressive flushing enabled");
                let _ = reply.send(Ok(()));
            }
            command if !self.connection.is_ready() => self.pending.push_back(command),
            command => self.execute(command),
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::CreateNamespace {
                id,
                persistent_id,
                reply,
            } => {
                let _ = reply.send(self.registry.create_namespace(id, persistent_id));
            }
            Command::CloneNamespace {
                source,
                id,
                persistent_id,
                reply,
            } => {
                let result = self
                    .registry
                    .clone_namespace(source, id, persistent_id)
                    .map(|(writes, flush)| {
                        for map_id in flush {
                            self.commit_now(map_id);
                        }
                        self.submit_metadata(writes);
                    });
                let _ = reply.send(result);
            }
            Command::DeleteNamespace { id, persist, reply } => {
                let result = self
                    .registry
                    .delete_namespace(id, persist)
                    .map(|writes| self.submit_metadata(writes));
                let _ = reply.send(result);
            }
            Command::Scavenge { reply } => {
                let writes = self.registry.scavenge();
                self.submit_metadata(writes);
                let _ = reply.send(Ok(()));
            }
            Command::Usage { reply } => {
                let _ = reply.send(Ok(self.registry.usage()));
            }
            Command::OpenArea {
                namespace,
                origin,
                reply,
            } => {
                let result = self
                    .registry
                    .open_area(namespace, &origin)
                    .map(|(_, writes)| self.submit_metadata(writes));
                let _ = reply.send(result);
            }
            Command::Area(request) => self.handle_area(request),
            Command::Flush { reply } => self.flush(reply),
            Command::PurgeMemory { reply } => {
                let purged = self
                    .registry
                    .arena_mut()
                    .maps_mut()
                    .map(|map| map.purge_memory())
                    .filter(|purged| *purged)
                    .count();
                debug!(purged, "purged map caches");
                let _ = reply.send(Ok(purged));
            }
            Command::Shutdown { reply } => self.begin_shutdown(Some(reply)),
            command @ (Command::Status { .. } | Command::EnableAggressiveFlushing { .. }) => self.on_command(command),
        }
    }

    fn drain_pending(&mut self) {
        while self.connection.is_ready() && !self.shutting_down {
            let Some(command) = self.pending.pop_front() else {
                break;
            };
            self.execute(command);
        }
    }

    fn status(&self) -> ContextStatus {
        ContextStatus {
            connection: self.connection.status(),
            namespaces: self.registry.namespace_count(),
            maps: self.registry.arena().len(),
            memory_used: self.registry.memory_used(),
            aggressive_flushing: self.aggressive_flushing,
        }
    }

    // ---- areas ----------------------------------------------------------

    fn handle_area(&mut self, request: AreaRequest) {
        let map_id = match self.registry.open_area(request.namespace, &request.origin) {
            Ok((map_id, writes)) => {
                self.submit_metadata(writes);
                map_id
            }
            Err(e) => return request.op.fail(e),
        };

        if let Some(waiters) = self.load_waiters.get_mut(&map_id) {
            waiters.push_back(request);
            return;
        }

        if let Some(access) = request.op.access() {
            let needs_load = self
                .registry
                .with_area(request.namespace, &request.origin, |area, arena| {
                    let access = area.required_access(arena, access);
                    Ok(arena.get(area.map_id())?.needs_load(access))
                });
            match needs_load {
                Ok(true) => return self.start_load(map_id, request),
                Ok(false) => {}
                Err(e) => return request.op.fail(e),
            }
        }
        self.apply(request);
    }

    fn start_load(&mut self, map_id: MapId, request: AreaRequest) {
        let start = match self.registry.arena_mut().get_mut(map_id) {
            Ok(map) => map.begin_load(),
            Err(e) => return request.op.fail(e.into()),
        };
        match start {
            LoadStart::Loaded => self.apply(request),
            LoadStart::InProgress => {
                self.load_waiters.entry(map_id).or_default().push_back(request);
            }
            LoadStart::Fetch { prefix, flush } => {
                if let Some(commit) = flush {
                    self.submit_commit(map_id, commit);
                }
                self.load_waiters.insert(map_id, VecDeque::from([request]));
                self.submit(JobTag::LoadMap(map_id), DbRequest::GetPrefixed(prefix));
            }
        }
    }

    fn on_loaded(&mut self, map_id: MapId, rows: DbResult<Vec<(Vec<u8>, Vec<u8>)>>) {
        if let Ok(map) = self.registry.arena_mut().get_mut(map_id) {
            map.finish_load(rows);
        }
        let Some(waiters) = self.load_waiters.remove(&map_id) else {
            return;
        };
        debug!(map_id = %map_id, waiters = waiters.len(), "resuming requests after load");
        for request in waiters {
            self.handle_area(request);
        }
    }

    fn apply(&mut self, request: AreaRequest) {
        let AreaRequest { namespace, origin, op } = request;
        let registry = &mut self.registry;
        match op {
            AreaOp::Get { key, reply } => {
                let _ = reply.send(registry.with_area(namespace, &origin, |area, arena| area.get(arena, &key)));
            }
            AreaOp::GetAll { reply } => {
                let _ = reply.send(registry.with_area(namespace, &origin, |area, arena| area.get_all(arena)));
            }
            AreaOp::Put {
                key,
                value,
                old_value,
                source,
                reply,
            } => {
                let outcome = registry.mutate(namespace, &origin, |area, arena| {
                    area.put(arena, key, value, old_value, &source)
                });
                let _ = reply.send(self.after_mutation(outcome));
            }
            AreaOp::Delete {
                key,
                old_value,
                source,
                reply,
            } => {
                let outcome = registry.mutate(namespace, &origin, |area, arena| {
                    area.delete(arena, key, old_value, &source)
                });
                let _ = reply.send(self.after_mutation(outcome));
            }
            AreaOp::DeleteAll { source, reply } => {
                let outcome = registry.mutate(namespace, &origin, |area, arena| area.delete_all(arena, &source));
                let _ = reply.send(self.after_mutation(outcome));
            }
            AreaOp::AddObserver { reply } => {
                let _ = reply.send(registry.with_area(namespace, &origin, |area, arena| area.add_observer(arena)));
            }
            AreaOp::SetCacheMode { mode, reply } => {
                let _ = reply.send(registry.with_area(namespace, &origin, |area, arena| {
                    area.set_cache_mode(arena, mode)
                }));
            }
        }
    }

    fn after_mutation(&mut self, outcome: ContextResult<MutationOutcome>) -> ContextResult<()> {
        let outcome = outcome?;
        self.submit_metadata(outcome.writes);
        if outcome.timer == CommitTimer::Arm {
            self.arm_timer(outcome.map_id);
        }
        Ok(())
    }

    // ---- commits --------------------------------------------------------

    fn arm_timer(&mut self, map_id: MapId) {
        let Ok(map) = self.registry.arena().get(map_id) else {
            return;
        };
        let delay = map.commit_delay(Instant::now(), self.aggressive_flushing);
        let fired = TimerFired {
            map_id,
            epoch: self.connection.epoch(),
        };
        let tx = self.timer_tx.clone();
        debug!(map_id = %map_id, delay_ms = delay.as_millis() as u64, "commit timer armed");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(fired);
        });
    }

    fn on_timer(&mut self, fired: TimerFired) {
        if fired.epoch != self.connection.epoch() {
            return;
        }
        let commit = match self.registry.arena_mut().get_mut(fired.map_id) {
            Ok(map) => map.on_commit_timer(),
            Err(_) => None,
        };
        if let Some(commit) = commit {
            self.submit_commit(fired.map_id, commit);
        }
    }

    /// Commit `map_id`'s pending batch without waiting for its timer.
    fn commit_now(&mut self, map_id: MapId) {
        let commit = match self.registry.arena_mut().get_mut(map_id) {
            Ok(map) => map.take_commit(),
            Err(_) => None,
        };
        if let Some(commit) = commit {
            self.submit_commit(map_id, commit);
        }
    }

    fn submit_commit(&mut self, map_id: MapId, commit: PendingCommit) {
        self.submit_write(JobTag::Commit(map_id), commit.operations);
    }

    fn submit_metadata(&mut self, writes: Vec<BatchOperation>) {
        let mut operations = std::mem::take(&mut self.metadata_retry);
        operations.extend(writes);
        if operations.is_empty() || !self.connection.has_database() {
            return;
        }
        self.metadata_in_flight.push_back(operations.clone());
        self.submit_write(JobTag::Metadata, operations);
    }

    fn submit_write(&mut self, tag: JobTag, operations: Vec<BatchOperation>) {
        if !self.connection.has_database() {
            let map_id = match tag {
                JobTag::Commit(map_id) => Some(map_id),
                _ => None,
            };
            return self.on_written(map_id, Ok(()));
        }
        let operations = self.connection.prepare_write(operations);
        self.submit(tag, DbRequest::Write(operations));
    }

    fn on_written(&mut self, map_id: Option<MapId>, result: DbResult<()>) {
        if let Err(e) = &result {
            warn!(map_id = ?map_id, error = %e, "commit failed");
        }
        if self.connection.record_commit(result.is_ok()) && !self.shutting_down {
            return self.recreate();
        }
        let Some(map_id) = map_id else {
            return self.metadata_complete(result.is_ok());
        };
        let timer = match self.registry.arena_mut().get_mut(map_id) {
            Ok(map) => map.commit_complete(result.is_ok()),
            Err(_) => CommitTimer::Idle,
        };
        if timer == CommitTimer::Arm {
            self.arm_timer(map_id);
        }
    }

    /// The oldest namespace record write has landed or failed. A failed
    /// write is replayed together with everything submitted after it.
    fn metadata_complete(&mut self, written: bool) {
        let Some(failed) = self.metadata_in_flight.pop_front() else {
            return;
        };
        if written {
            return;
        }
        let mut retry = failed;
        retry.extend(self.metadata_in_flight.iter().flatten().cloned());
        retry.append(&mut self.metadata_retry);
        warn!(ops = retry.len(), "namespace record write failed; kept for retry");
        self.metadata_retry = retry;
    }

    fn commit_everything(&mut self) {
        self.submit_metadata(Vec::new());
        let ids: Vec<MapId> = self.registry.arena().ids().collect();
        for map_id in ids {
            self.commit_now(map_id);
        }
    }

    fn flush(&mut self, reply: Reply<()>) {
        self.commit_everything();
        let waiter = self.next_flush;
        self.next_flush += 1;
        self.flush_waiters.insert(waiter, reply);
        self.submit(JobTag::Flush(waiter), DbRequest::Barrier);
    }

    // ---- connection -----------------------------------------------------

    fn on_completion(&mut self, completion: DbCompletion) -> bool {
        let DbCompletion { tag, epoch, reply } = completion;
        match (tag, reply) {
            (JobTag::Shutdown, _) => {
                self.finish_shutdown();
                return true;
            }
            (JobTag::Flush(waiter), _) => {
                if let Some(reply) = self.flush_waiters.remove(&waiter) {
                    let _ = reply.send(Ok(()));
                }
            }
            (tag, _) if epoch != self.connection.epoch() => {
                debug!(?tag, epoch, "dropping completion from before recreate");
            }
            (JobTag::Connect(step), reply) => {
                if !self.shutting_down {
                    let progress = self.connection.on_reply(epoch, step, reply);
                    self.on_progress(progress);
                }
            }
            (JobTag::LoadMap(map_id), DbReply::Rows(rows)) => self.on_loaded(map_id, rows),
            (JobTag::Commit(map_id), DbReply::Written(result)) => self.on_written(Some(map_id), result),
            (JobTag::Metadata, DbReply::Written(result)) => self.on_written(None, result),
            (tag, reply) => debug!(?tag, ?reply, "unexpected database completion"),
        }
        false
    }

    fn on_progress(&mut self, progress: Progress) {
        match progress {
            Progress::Continue(jobs) => self.submit_jobs(jobs),
            Progress::Ready(metadata) => {
                let backed = self.connection.has_database();
                self.registry.load_metadata(metadata, backed);
                self.drain_pending();
            }
        }
    }

    /// Throw away every map and reconnect. Requests waiting on loads are
    /// replayed once the new database is ready.
    fn recreate(&mut self) {
        let mut requeued = VecDeque::new();
        for (_, waiters) in self.load_waiters.drain() {
            requeued.extend(waiters.into_iter().map(Command::Area));
        }
        requeued.extend(self.pending.drain(..));
        self.pending = requeued;

        self.metadata_in_flight.clear();
        self.metadata_retry.clear();
        self.registry.reset(false);
        let progress = self.connection.fail("too many commit errors");
        self.on_progress(progress);
    }

    fn submit(&mut self, tag: JobTag, request: DbRequest) {
        let job = DbJob {
            tag,
            epoch: self.connection.epoch(),
            request,
        };
        if !self.worker.submit(job) {
            warn!(?tag, "database thread is gone; dropping job");
        }
    }

    fn submit_jobs(&mut self, jobs: Vec<DbJob>) {
        for job in jobs {
            if !self.worker.submit(job) {
                warn!("database thread is gone; dropping job");
            }
        }
    }

    // ---- shutdown -------------------------------------------------------

    fn begin_shutdown(&mut self, reply: Option<Reply<()>>) {
        info!("shutting down storage context");
        self.shutting_down = true;
        self.shutdown_reply = reply;
        if self.connection.is_ready() {
            self.commit_everything();
        }
        self.submit(JobTag::Shutdown, DbRequest::Close);
    }

    fn finish_shutdown(&mut self) {
        self.connection.shut_down();
        for command in self.pending.drain(..) {
            command.reject(ContextError::ShutDown);
        }
        for (_, waiters) in self.load_waiters.drain() {
            for request in waiters {
                request.op.fail(ContextError::ShutDown);
            }
        }
        for (_, reply) in self.flush_waiters.drain() {
            let _ = reply.send(Err(ContextError::ShutDown));
        }
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(Ok(()));
        }
        info!("storage context shut down");
    }
}
