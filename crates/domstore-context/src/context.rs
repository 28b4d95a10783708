use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use domstore_area::{CacheMode, ObserverStream};
use domstore_db::{DatabaseOpener, DefaultOpener};
use domstore_types::{NamespaceId, Origin, PersistentNamespaceId, StorageKey, StorageValue};

use crate::actor::{AreaOp, AreaRequest, Command, ContextActor};
use crate::config::ContextConfig;
use crate::connection::ConnectionStatus;
use crate::error::{ContextError, ContextResult};
use crate::metadata::StorageUsageInfo;

/// Depth of the command queue between handles and the owner task.
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Point-in-time view of a storage context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContextStatus {
    pub connection: ConnectionStatus,
    /// Live namespaces, the local one included.
    pub namespaces: usize,
    /// Maps known to the context.
    pub maps: usize,
    /// Bytes held by map caches.
    pub memory_used: usize,
    pub aggressive_flushing: bool,
}

/// Handle to a storage context.
///
/// The context runs as one task owning every namespace, area, and map; a
/// dedicated thread performs database I/O. Handles are cheap to clone and
/// every method is a round trip to the owner task. Calls made before the
/// database is ready wait for it.
#[derive(Clone, Debug)]
pub struct StorageContext {
    commands: mpsc::Sender<Command>,
}

impl StorageContext {
    /// Start a context with the default on-disk backend.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: ContextConfig) -> ContextResult<Self> {
        let opener = Arc::new(DefaultOpener::new(config.log.clone()));
        Self::open_with_opener(config, opener)
    }

    /// Start a context that opens databases through `opener`.
    pub fn open_with_opener(config: ContextConfig, opener: Arc<dyn DatabaseOpener>) -> ContextResult<Self> {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let actor = ContextActor::new(&config, opener, rx)?;
        tokio::spawn(actor.run());
        Ok(Self { commands })
    }

    pub async fn create_namespace(&self, id: NamespaceId, persistent_id: PersistentNamespaceId) -> ContextResult<()> {
        self.request(|reply| Command::CreateNamespace {
            id,
            persistent_id,
            reply,
        })
        .await
    }

    /// Create `id` as a copy of `source` sharing all of its maps.
    pub async fn clone_namespace(
        &self,
        source: NamespaceId,
        id: NamespaceId,
        persistent_id: PersistentNamespaceId,
    ) -> ContextResult<()> {
        self.request(|reply| Command::CloneNamespace {
            source,
            id,
            persistent_id,
            reply,
        })
        .await
    }

    /// Drop a namespace. With `persist` its data stays on disk and can be
    /// restored by creating a namespace with the same persistent id.
    pub async fn delete_namespace(&self, id: NamespaceId, persist: bool) -> ContextResult<()> {
        self.request(|reply| Command::DeleteNamespace { id, persist, reply })
            .await
    }

    /// Delete every recorded namespace that is not live.
    pub async fn scavenge_unused_namespaces(&self) -> ContextResult<()> {
        self.request(|reply| Command::Scavenge { reply }).await
    }

    pub async fn storage_usage(&self) -> ContextResult<Vec<StorageUsageInfo>> {
        self.request(|reply| Command::Usage { reply }).await
    }

    /// Open the area of `origin` inside namespace `namespace`.
    pub async fn open_area(&self, namespace: NamespaceId, origin: Origin) -> ContextResult<AreaHandle> {
        let request_origin = origin.clone();
        self.request(|reply| Command::OpenArea {
            namespace,
            origin: request_origin,
            reply,
        })
        .await?;
        Ok(AreaHandle {
            context: self.clone(),
            namespace,
            origin,
        })
    }

    /// Open `origin` in the local namespace.
    pub async fn local_area(&self, origin: Origin) -> ContextResult<AreaHandle> {
        self.open_area(NamespaceId::LOCAL, origin).await
    }

    /// Commit every pending batch now. Resolves once they are written.
    pub async fn flush(&self) -> ContextResult<()> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Drop the caches of every quiescent map. Returns how many were dropped.
    pub async fn purge_memory(&self) -> ContextResult<usize> {
        self.request(|reply| Command::PurgeMemory { reply }).await
    }

    /// Shorten commit delays from now on.
    pub async fn enable_aggressive_flushing(&self) -> ContextResult<()> {
        self.request(|reply| Command::EnableAggressiveFlushing { reply })
            .await
    }

    pub async fn status(&self) -> ContextResult<ContextStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Flush, close the database, and stop. Later calls fail with
    /// [`ContextError::ShutDown`].
    pub async fn shutdown(&self) -> ContextResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<ContextResult<T>>) -> Command,
    ) -> ContextResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ContextError::ShutDown)?;
        rx.await.map_err(|_| ContextError::ShutDown)?
    }

    async fn area_request<T>(
        &self,
        namespace: NamespaceId,
        origin: &Origin,
        op: impl FnOnce(oneshot::Sender<ContextResult<T>>) -> AreaOp,
    ) -> ContextResult<T> {
        self.request(|reply| {
            Command::Area(AreaRequest {
                namespace,
                origin: origin.clone(),
                op: op(reply),
            })
        })
        .await
    }
}

/// The key space one origin sees inside one namespace.
///
/// `old_value` on mutations is the value the caller believes the key holds;
/// it only has to be supplied for keys-only maps and is checked against the
/// cache otherwise. `source` is passed through to observers unchanged.
#[derive(Clone, Debug)]
pub struct AreaHandle {
    context: StorageContext,
    namespace: NamespaceId,
    origin: Origin,
}

impl AreaHandle {
    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub async fn get(&self, key: impl Into<StorageKey>) -> ContextResult<Option<StorageValue>> {
        let key = key.into();
        self.context
            .area_request(self.namespace, &self.origin, |reply| AreaOp::Get { key, reply })
            .await
    }

    pub async fn get_all(&self) -> ContextResult<Vec<(StorageKey, StorageValue)>> {
        self.context
            .area_request(self.namespace, &self.origin, |reply| AreaOp::GetAll { reply })
            .await
    }

    pub async fn put(
        &self,
        key: impl Into<StorageKey>,
        value: impl Into<StorageValue>,
        old_value: Option<StorageValue>,
        source: impl Into<String>,
    ) -> ContextResult<()> {
        let (key, value, source) = (key.into(), value.into(), source.into());
        self.context
            .area_request(self.namespace, &self.origin, |reply| AreaOp::Put {
                key,
                value,
                old_value,
                source,
                reply,
            })
            .await
    }

    pub async fn delete(
        &self,
        key: impl Into<StorageKey>,
        old_value: Option<StorageValue>,
        source: impl Into<String>,
    ) -> ContextResult<()> {
        let (key, source) = (key.into(), source.into());
        self.context
            .area_request(self.namespace, &self.origin, |reply| AreaOp::Delete {
                key,
                old_value,
                source,
                reply,
            })
            .await
    }

    pub async fn delete_all(&self, source: impl Into<String>) -> ContextResult<()> {
        let source = source.into();
        self.context
            .area_request(self.namespace, &self.origin, |reply| AreaOp::DeleteAll { source, reply })
            .await
    }

    /// Subscribe to mutations of this area. The stream closes when the area
    /// goes away.
    pub async fn add_observer(&self) -> ContextResult<ObserverStream> {
        self.context
            .area_request(self.namespace, &self.origin, |reply| AreaOp::AddObserver { reply })
            .await
    }

    pub async fn set_cache_mode(&self, mode: CacheMode) -> ContextResult<()> {
        self.context
            .area_request(self.namespace, &self.origin, |reply| AreaOp::SetCacheMode { mode, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::connection::{Backend, ConnectionState};
    use domstore_area::{AreaError, AreaEvent};
    use domstore_db::{BatchOperation, Database, DbResult, FaultyOpener, InMemoryDatabase};

    fn pid(s: &str) -> PersistentNamespaceId {
        PersistentNamespaceId::new(s).unwrap()
    }

    fn origin() -> Origin {
        Origin::new("https://x.test").unwrap()
    }

    fn directory_config() -> ContextConfig {
        ContextConfig {
            directory: Some("/virtual/domstore".into()),
            ..ContextConfig::for_testing()
        }
    }

    fn faulty_context(config: ContextConfig) -> (StorageContext, Arc<FaultyOpener>) {
        let opener = Arc::new(FaultyOpener::new());
        let context = StorageContext::open_with_opener(config, opener.clone()).unwrap();
        (context, opener)
    }

    fn row(db: &InMemoryDatabase, key: &str) -> Option<Vec<u8>> {
        db.get(key.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn local_area_round_trip() {
        let context = StorageContext::open(ContextConfig::for_testing()).unwrap();
        let area = context.local_area(origin()).await.unwrap();
        area.put("k", "v", None, "tab").await.unwrap();
        assert_eq!(area.get("k").await.unwrap(), Some(b"v".to_vec()));
        area.delete("k", None, "tab").await.unwrap();
        assert_eq!(area.get_all().await.unwrap(), Vec::new());

        let status = context.status().await.unwrap();
        assert_eq!(status.connection.state, ConnectionState::Ready);
        assert_eq!(status.connection.backend, Backend::InMemory);
        assert_eq!(status.namespaces, 1);
    }

    #[tokio::test]
    async fn ns_a_ns_b_scenario() {
        let (context, opener) = faulty_context(directory_config());
        let a = NamespaceId::new(1);
        let b = NamespaceId::new(2);
        context.create_namespace(a, pid("ns_a")).await.unwrap();
        let area_a = context.open_area(a, origin()).await.unwrap();
        area_a.put("k", "1", None, "a").await.unwrap();

        context.clone_namespace(a, b, pid("ns_b")).await.unwrap();
        let area_b = context.open_area(b, origin()).await.unwrap();
        assert_eq!(area_b.get("k").await.unwrap(), Some(b"1".to_vec()));

        area_b.put("k", "2", None, "b").await.unwrap();
        assert_eq!(area_a.get("k").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(area_b.get("k").await.unwrap(), Some(b"2".to_vec()));

        context.flush().await.unwrap();
        let db = opener.database();
        let db = db.contents();
        assert_eq!(row(db, "VERSION"), Some(b"1".to_vec()));
        assert_eq!(row(db, "namespace-ns_a-https://x.test"), Some(b"0".to_vec()));
        assert_eq!(row(db, "namespace-ns_b-https://x.test"), Some(b"1".to_vec()));
        assert_eq!(row(db, "next-map-id"), Some(b"2".to_vec()));
        assert_eq!(row(db, "map-0-k"), Some(b"1".to_vec()));
        assert_eq!(row(db, "map-1-k"), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn fork_isolation_from_the_source_side() {
        let context = StorageContext::open(ContextConfig::for_testing()).unwrap();
        let a = NamespaceId::new(1);
        let b = NamespaceId::new(2);
        context.create_namespace(a, pid("a")).await.unwrap();
        let area_a = context.open_area(a, origin()).await.unwrap();
        area_a.put("k", "1", None, "a").await.unwrap();
        context.clone_namespace(a, b, pid("b")).await.unwrap();
        let area_b = context.open_area(b, origin()).await.unwrap();

        area_a.delete_all("a").await.unwrap();
        assert!(area_a.get_all().await.unwrap().is_empty());
        assert_eq!(area_b.get("k").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn last_reference_deletes_map_rows() {
        let (context, opener) = faulty_context(directory_config());
        let a = NamespaceId::new(1);
        let b = NamespaceId::new(2);
        context.create_namespace(a, pid("a")).await.unwrap();
        context
            .open_area(a, origin())
            .await
            .unwrap()
            .put("k", "v", None, "s")
            .await
            .unwrap();
        context.clone_namespace(a, b, pid("b")).await.unwrap();
        context.flush().await.unwrap();
        let db = opener.database();

        context.delete_namespace(a, false).await.unwrap();
        context.flush().await.unwrap();
        assert_eq!(row(db.contents(), "namespace-a-https://x.test"), None);
        assert_eq!(row(db.contents(), "map-0-k"), Some(b"v".to_vec()));

        context.delete_namespace(b, false).await.unwrap();
        context.flush().await.unwrap();
        assert_eq!(row(db.contents(), "namespace-b-https://x.test"), None);
        assert_eq!(row(db.contents(), "map-0-k"), None);
        assert!(context.storage_usage().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_rejects_growth() {
        let mut config = ContextConfig::for_testing();
        config.area.max_size = 8;
        let context = StorageContext::open(config).unwrap();
        let area = context.local_area(origin()).await.unwrap();
        area.put("k", "1234567", None, "s").await.unwrap();
        let err = area.put("k2", "x", None, "s").await.unwrap_err();
        assert!(matches!(err, ContextError::Area(AreaError::QuotaExceeded { .. })));
        assert_eq!(area.get("k2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn same_value_put_is_silent() {
        let context = StorageContext::open(ContextConfig::for_testing()).unwrap();
        let area = context.local_area(origin()).await.unwrap();
        area.put("k", "v", None, "s").await.unwrap();
        let mut events = area.add_observer().await.unwrap();
        area.put("k", "v", None, "s").await.unwrap();
        area.put("k", "w", None, "s").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            AreaEvent::KeyChanged {
                key: b"k".to_vec(),
                new_value: b"w".to_vec(),
                old_value: b"v".to_vec(),
                source: "s".into(),
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_commit_failures_recreate_once_then_serve_from_memory() {
        let mut config = directory_config();
        config.commit_error_threshold = 2;
        let (context, opener) = faulty_context(config);
        let area = context.local_area(origin()).await.unwrap();
        context.flush().await.unwrap();

        opener.database().fail_all_writes(true);
        opener.fail_next_directory_opens(1);
        for i in 0..4 {
            area.put("k", format!("v{i}"), None, "s").await.unwrap();
            context.flush().await.unwrap();
        }

        let status = context.status().await.unwrap();
        assert_eq!(status.connection.recreate_count, 1);
        assert_eq!(status.connection.backend, Backend::InMemory);
        assert_eq!(status.connection.state, ConnectionState::Ready);
        assert_eq!(opener.destroys(), 1);

        let area = context.local_area(origin()).await.unwrap();
        area.put("k", "after", None, "s").await.unwrap();
        context.flush().await.unwrap();
        assert_eq!(area.get("k").await.unwrap(), Some(b"after".to_vec()));
        assert_eq!(context.status().await.unwrap().connection.recreate_count, 1);
    }

    #[tokio::test]
    async fn corrupt_version_recreates_an_empty_store() {
        let opener = Arc::new(FaultyOpener::new());
        opener
            .database()
            .write(&[
                BatchOperation::put("VERSION", "garbage"),
                BatchOperation::put("namespace-local-https://x.test", "0"),
                BatchOperation::put("map-0-k", "v"),
            ])
            .unwrap();
        let context = StorageContext::open_with_opener(directory_config(), opener.clone()).unwrap();

        let area = context.local_area(origin()).await.unwrap();
        assert_eq!(area.get("k").await.unwrap(), None);
        let status = context.status().await.unwrap();
        assert_eq!(status.connection.recreate_count, 1);
        assert_eq!(status.connection.backend, Backend::Directory);
        assert_eq!(opener.destroys(), 1);
    }

    #[tokio::test]
    async fn unopenable_directory_falls_back_to_memory() {
        let opener = Arc::new(FaultyOpener::new());
        opener.fail_next_directory_opens(1);
        let context = StorageContext::open_with_opener(directory_config(), opener.clone()).unwrap();
        let area = context.local_area(origin()).await.unwrap();
        area.put("k", "v", None, "s").await.unwrap();
        assert_eq!(area.get("k").await.unwrap(), Some(b"v".to_vec()));

        let status = context.status().await.unwrap();
        assert_eq!(status.connection.backend, Backend::InMemory);
        assert_eq!(status.connection.recreate_count, 0);
        assert_eq!(opener.memory_opens(), 1);
    }

    #[tokio::test]
    async fn session_restores_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContextConfig {
            directory: Some(dir.path().join("db")),
            ..ContextConfig::for_testing()
        };
        let ns = NamespaceId::new(3);

        let context = StorageContext::open(config.clone()).unwrap();
        context.create_namespace(ns, pid("session")).await.unwrap();
        let area = context.open_area(ns, origin()).await.unwrap();
        area.put("k", "v", None, "s").await.unwrap();
        context.delete_namespace(ns, true).await.unwrap();
        context.shutdown().await.unwrap();
        assert!(matches!(context.status().await, Err(ContextError::ShutDown)));

        let context = StorageContext::open(config).unwrap();
        context.create_namespace(NamespaceId::new(7), pid("session")).await.unwrap();
        let area = context.open_area(NamespaceId::new(7), origin()).await.unwrap();
        assert_eq!(area.get("k").await.unwrap(), Some(b"v".to_vec()));
        let usage = context.storage_usage().await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].persistent_namespace_id, pid("session"));
        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn scavenge_drops_unrestored_sessions() {
        let (context, opener) = faulty_context(directory_config());
        let ns = NamespaceId::new(1);
        context.create_namespace(ns, pid("old")).await.unwrap();
        context
            .open_area(ns, origin())
            .await
            .unwrap()
            .put("k", "v", None, "s")
            .await
            .unwrap();
        context.delete_namespace(ns, true).await.unwrap();
        context.scavenge_unused_namespaces().await.unwrap();
        context.flush().await.unwrap();
        assert!(context.storage_usage().await.unwrap().is_empty());
        assert_eq!(opener.database().contents().get_prefixed(b"map-").unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn commit_timer_flushes_without_explicit_flush() {
        let (context, opener) = faulty_context(directory_config());
        let area = context.local_area(origin()).await.unwrap();
        area.put("k", "v", None, "s").await.unwrap();

        let db = opener.database();
        for _ in 0..100 {
            if row(db.contents(), "map-0-k").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(row(db.contents(), "map-0-k"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn keys_only_maps_reload_for_reads() {
        let (context, _opener) = faulty_context(ContextConfig {
            low_memory: true,
            ..directory_config()
        });
        let area = context.local_area(origin()).await.unwrap();
        area.put("a", "1", None, "s").await.unwrap();
        context.flush().await.unwrap();
        area.put("b", "2", None, "s").await.unwrap();
        assert_eq!(area.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(area.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purge_memory_drops_quiescent_caches() {
        let (context, _opener) = faulty_context(directory_config());
        let area = context.local_area(origin()).await.unwrap();
        area.put("k", "v", None, "s").await.unwrap();
        assert_eq!(context.purge_memory().await.unwrap(), 0);
        context.flush().await.unwrap();
        assert_eq!(context.purge_memory().await.unwrap(), 1);
        assert_eq!(context.status().await.unwrap().memory_used, 0);
        assert_eq!(area.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn namespace_errors_are_typed() {
        let context = StorageContext::open(ContextConfig::for_testing()).unwrap();
        assert!(matches!(
            context.open_area(NamespaceId::new(9), origin()).await,
            Err(ContextError::UnknownNamespace(_))
        ));
        assert!(matches!(
            context.clone_namespace(NamespaceId::LOCAL, NamespaceId::new(1), pid("x")).await,
            Err(ContextError::LocalNamespace(_))
        ));
        context.enable_aggressive_flushing().await.unwrap();
        assert!(context.status().await.unwrap().aggressive_flushing);
    }

    #[tokio::test]
    async fn failed_commit_is_retried_by_the_next_flush() {
        let (context, opener) = faulty_context(directory_config());
        let area = context.local_area(origin()).await.unwrap();
        context.flush().await.unwrap();
        let db = opener.database();
        db.fail_next_writes(1);

        area.put("k1", "1", None, "s").await.unwrap();
        context.flush().await.unwrap();
        assert_eq!(row(db.contents(), "map-0-k1"), None);

        area.put("k2", "2", None, "s").await.unwrap();
        context.flush().await.unwrap();
        assert_eq!(row(db.contents(), "map-0-k1"), Some(b"1".to_vec()));
        assert_eq!(row(db.contents(), "map-0-k2"), Some(b"2".to_vec()));

        let status = context.status().await.unwrap();
        assert_eq!(status.connection.recreate_count, 0);
        assert_eq!(status.connection.backend, Backend::Directory);
    }

    #[tokio::test]
    async fn dashed_scheme_origin_restores_under_its_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContextConfig {
            directory: Some(dir.path().join("db")),
            ..ContextConfig::for_testing()
        };
        let extension = Origin::new("chrome-extension://abc").unwrap();

        let context = StorageContext::open(config.clone()).unwrap();
        context.create_namespace(NamespaceId::new(1), pid("ns")).await.unwrap();
        let area = context.open_area(NamespaceId::new(1), extension.clone()).await.unwrap();
        area.put("k", "v", None, "s").await.unwrap();
        context.delete_namespace(NamespaceId::new(1), true).await.unwrap();
        context.shutdown().await.unwrap();

        let context = StorageContext::open(config).unwrap();
        context.create_namespace(NamespaceId::new(2), pid("ns")).await.unwrap();
        let area = context.open_area(NamespaceId::new(2), extension.clone()).await.unwrap();
        assert_eq!(area.get("k").await.unwrap(), Some(b"v".to_vec()));
        let usage = context.storage_usage().await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].persistent_namespace_id, pid("ns"));
        assert_eq!(usage[0].origin, extension);
        context.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn keys_only_shared_map_forks_with_its_values() {
        let (context, opener) = faulty_context(directory_config());
        let a = NamespaceId::new(1);
        let b = NamespaceId::new(2);
        context.create_namespace(a, pid("a")).await.unwrap();
        let area_a = context.open_area(a, origin()).await.unwrap();
        area_a.put("k", "1", None, "a").await.unwrap();
        context.flush().await.unwrap();
        area_a.set_cache_mode(CacheMode::KeysOnly).await.unwrap();

        context.clone_namespace(a, b, pid("b")).await.unwrap();
        let area_b = context.open_area(b, origin()).await.unwrap();
        area_b.put("k2", "2", None, "b").await.unwrap();

        assert_eq!(area_a.get_all().await.unwrap(), vec![(b"k".to_vec(), b"1".to_vec())]);
        assert_eq!(
            area_b.get_all().await.unwrap(),
            vec![(b"k".to_vec(), b"1".to_vec()), (b"k2".to_vec(), b"2".to_vec())]
        );

        context.flush().await.unwrap();
        let db = opener.database();
        assert_eq!(row(db.contents(), "map-0-k2"), None);
        assert_eq!(row(db.contents(), "map-1-k"), Some(b"1".to_vec()));
        assert_eq!(row(db.contents(), "map-1-k2"), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn writes_that_change_nothing_keep_a_clone_shared() {
        let mut config = ContextConfig::for_testing();
        config.area.max_size = 8;
        let context = StorageContext::open(config).unwrap();
        let a = NamespaceId::new(1);
        let b = NamespaceId::new(2);
        context.create_namespace(a, pid("a")).await.unwrap();
        let area_a = context.open_area(a, origin()).await.unwrap();
        area_a.put("k", "1234567", None, "a").await.unwrap();
        context.clone_namespace(a, b, pid("b")).await.unwrap();
        let area_b = context.open_area(b, origin()).await.unwrap();
        assert_eq!(context.status().await.unwrap().maps, 1);

        area_b.put("k", "1234567", None, "b").await.unwrap();
        let err = area_b.put("k2", "x", None, "b").await.unwrap_err();
        assert!(matches!(err, ContextError::Area(AreaError::QuotaExceeded { .. })));
        area_b.delete("missing", None, "b").await.unwrap();
        assert_eq!(context.status().await.unwrap().maps, 1);

        area_b.put("k", "x", None, "b").await.unwrap();
        assert_eq!(context.status().await.unwrap().maps, 2);
        assert_eq!(area_a.get("k").await.unwrap(), Some(b"1234567".to_vec()));
    }

    struct CrashingOpener;

    impl DatabaseOpener for CrashingOpener {
        fn open_directory(&self, _dir: &Path) -> DbResult<Arc<dyn Database>> {
            panic!("database thread crashed");
        }

        fn open_in_memory(&self) -> DbResult<Arc<dyn Database>> {
            panic!("database thread crashed");
        }

        fn destroy_directory(&self, _dir: &Path) -> DbResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn lost_database_thread_shuts_the_context_down() {
        let context = StorageContext::open_with_opener(ContextConfig::for_testing(), Arc::new(CrashingOpener)).unwrap();
        let opened = tokio::time::timeout(Duration::from_secs(5), context.local_area(origin()))
            .await
            .expect("context stopped answering");
        assert!(matches!(opened, Err(ContextError::ShutDown)));
        assert!(matches!(context.status().await, Err(ContextError::ShutDown)));
    }
}
