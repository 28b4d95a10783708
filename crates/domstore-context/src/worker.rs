use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use domstore_db::{BatchOperation, Database, DatabaseError, DatabaseOpener, DbResult};
use domstore_types::MapId;

use crate::connection::Step;
use crate::error::ContextResult;

/// Work handed to the database thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DbRequest {
    OpenDirectory(PathBuf),
    OpenInMemory,
    DestroyDirectory(PathBuf),
    Get(Vec<u8>),
    GetPrefixed(Vec<u8>),
    Write(Vec<BatchOperation>),
    /// Completes once every earlier job has.
    Barrier,
    /// Drop the database and stop the thread.
    Close,
}

/// What a job's completion means to the owner task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobTag {
    Connect(Step),
    LoadMap(MapId),
    Commit(MapId),
    Metadata,
    Flush(u64),
    Shutdown,
}

/// A request plus the context needed to route its reply.
#[derive(Clone, Debug)]
pub struct DbJob {
    pub tag: JobTag,
    /// Connection epoch the job was issued under.
    pub epoch: u64,
    pub request: DbRequest,
}

#[derive(Debug)]
pub enum DbReply {
    Opened(DbResult<()>),
    Destroyed(DbResult<()>),
    Value(DbResult<Option<Vec<u8>>>),
    Rows(DbResult<Vec<(Vec<u8>, Vec<u8>)>>),
    Written(DbResult<()>),
    Barrier,
    Closed,
}

#[derive(Debug)]
pub struct DbCompletion {
    pub tag: JobTag,
    pub epoch: u64,
    pub reply: DbReply,
}

/// Handle to the database thread. Jobs run strictly in submission order.
#[derive(Debug)]
pub struct DbWorker {
    jobs: std_mpsc::Sender<DbJob>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DbWorker {
    /// Start the thread. Completions are posted to `completions`.
    pub fn spawn(
        opener: Arc<dyn DatabaseOpener>,
        completions: mpsc::UnboundedSender<DbCompletion>,
    ) -> ContextResult<Self> {
        let (jobs, rx) = std_mpsc::channel();
        let handle = thread::Builder::new()
            .name("domstore-db".into())
            .spawn(move || run(opener, rx, completions))?;
        Ok(Self {
            jobs,
            handle: Some(handle),
        })
    }

    /// Queue a job. Returns `false` once the thread has exited.
    pub fn submit(&self, job: DbJob) -> bool {
        self.jobs.send(job).is_ok()
    }
}

impl Drop for DbWorker {
    fn drop(&mut self) {
        let _ = self.jobs.send(DbJob {
            tag: JobTag::Shutdown,
            epoch: 0,
            request: DbRequest::Close,
        });
        // Never block the owner task: a thread still busy finishes its queue,
        // drops the database on Close and exits by itself.
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                debug!("detaching busy database thread");
            } else if handle.join().is_err() {
                warn!("database thread panicked");
            }
        }
    }
}

fn run(
    opener: Arc<dyn DatabaseOpener>,
    jobs: std_mpsc::Receiver<DbJob>,
    completions: mpsc::UnboundedSender<DbCompletion>,
) {
    let mut db: Option<Arc<dyn Database>> = None;
    while let Ok(job) = jobs.recv() {
        let closing = job.request == DbRequest::Close;
        let reply = execute(opener.as_ref(), &mut db, job.request);
        let completion = DbCompletion {
            tag: job.tag,
            epoch: job.epoch,
            reply,
        };
        if completions.send(completion).is_err() && !closing {
            debug!("owner gone; stopping database thread");
            break;
        }
        if closing {
            break;
        }
    }
    drop(jobs);
    debug!("database thread exiting");
}

fn execute(opener: &dyn DatabaseOpener, db: &mut Option<Arc<dyn Database>>, request: DbRequest) -> DbReply {
    match request {
        DbRequest::OpenDirectory(dir) => {
            *db = None;
            DbReply::Opened(opener.open_directory(&dir).map(|opened| {
                *db = Some(opened);
            }))
        }
        DbRequest::OpenInMemory => {
            *db = None;
            DbReply::Opened(opener.open_in_memory().map(|opened| {
                *db = Some(opened);
            }))
        }
        DbRequest::DestroyDirectory(dir) => {
            *db = None;
            DbReply::Destroyed(opener.destroy_directory(&dir))
        }
        DbRequest::Get(key) => DbReply::Value(open(db).and_then(|db| db.get(&key))),
        DbRequest::GetPrefixed(prefix) => DbReply::Rows(open(db).and_then(|db| db.get_prefixed(&prefix))),
        DbRequest::Write(ops) => DbReply::Written(open(db).and_then(|db| db.write(&ops))),
        DbRequest::Barrier => DbReply::Barrier,
        DbRequest::Close => {
            *db = None;
            DbReply::Closed
        }
    }
}

fn open(db: &Option<Arc<dyn Database>>) -> DbResult<&Arc<dyn Database>> {
    db.as_ref().ok_or(DatabaseError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domstore_db::FaultyOpener;

    fn job(tag: JobTag, request: DbRequest) -> DbJob {
        DbJob {
            tag,
            epoch: 1,
            request,
        }
    }

    #[tokio::test]
    async fn jobs_complete_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = DbWorker::spawn(Arc::new(FaultyOpener::default()), tx).unwrap();

        worker.submit(job(JobTag::Connect(Step::OpenInMemory), DbRequest::OpenInMemory));
        worker.submit(job(
            JobTag::Commit(MapId::new(0)),
            DbRequest::Write(vec![BatchOperation::put("map-0-k", "v")]),
        ));
        worker.submit(job(JobTag::Metadata, DbRequest::Get(b"map-0-k".to_vec())));
        worker.submit(job(JobTag::Flush(3), DbRequest::Barrier));

        let c = rx.recv().await.unwrap();
        assert_eq!(c.tag, JobTag::Connect(Step::OpenInMemory));
        assert!(matches!(c.reply, DbReply::Opened(Ok(()))));
        assert!(matches!(rx.recv().await.unwrap().reply, DbReply::Written(Ok(()))));
        match rx.recv().await.unwrap().reply {
            DbReply::Value(Ok(value)) => assert_eq!(value, Some(b"v".to_vec())),
            other => panic!("unexpected reply {other:?}"),
        }
        let c = rx.recv().await.unwrap();
        assert_eq!(c.tag, JobTag::Flush(3));
        assert!(matches!(c.reply, DbReply::Barrier));
    }

    #[tokio::test]
    async fn requests_without_a_database_fail_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = DbWorker::spawn(Arc::new(FaultyOpener::default()), tx).unwrap();
        worker.submit(job(JobTag::Metadata, DbRequest::Get(b"VERSION".to_vec())));
        assert!(matches!(
            rx.recv().await.unwrap().reply,
            DbReply::Value(Err(DatabaseError::Closed))
        ));
    }

    #[tokio::test]
    async fn close_stops_the_thread() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = DbWorker::spawn(Arc::new(FaultyOpener::default()), tx).unwrap();
        worker.submit(job(JobTag::Shutdown, DbRequest::Close));
        assert!(matches!(rx.recv().await.unwrap().reply, DbReply::Closed));
        assert!(rx.recv().await.is_none());
        assert!(!worker.submit(job(JobTag::Metadata, DbRequest::Barrier)));
    }

    #[tokio::test]
    async fn dropping_a_busy_worker_does_not_wait_for_it() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = DbWorker::spawn(Arc::new(FaultyOpener::default()), tx).unwrap();
        worker.submit(job(JobTag::Connect(Step::OpenInMemory), DbRequest::OpenInMemory));
        for i in 0..64 {
            worker.submit(job(
                JobTag::Commit(MapId::new(0)),
                DbRequest::Write(vec![BatchOperation::put(format!("map-0-{i}"), "v")]),
            ));
        }
        drop(worker);

        // The detached thread still drains its queue and then closes.
        let mut last = None;
        while let Some(completion) = rx.recv().await {
            last = Some(completion.reply);
        }
        assert!(matches!(last, Some(DbReply::Closed)));
    }
}
