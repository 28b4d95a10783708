use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use domstore_area::{AreaOptions, AreaResult, AreaWrapper, CommitTimer, MapArena, Mutation, ObserverOwner, Release};
use domstore_db::BatchOperation;
use domstore_types::keys::{encode_number, NEXT_MAP_ID_KEY};
use domstore_types::{MapId, NamespaceId, Origin, PersistentNamespaceId};

use crate::connection::Metadata;
use crate::error::{ContextError, ContextResult};
use crate::metadata::{NamespaceRecords, StorageUsageInfo};

/// A namespace that exists in this process.
#[derive(Debug)]
struct LiveNamespace {
    persistent_id: PersistentNamespaceId,
    areas: HashMap<Origin, AreaWrapper>,
}

impl LiveNamespace {
    fn new(persistent_id: PersistentNamespaceId) -> Self {
        Self {
            persistent_id,
            areas: HashMap::new(),
        }
    }
}

/// Outcome of a mutation routed through the registry.
#[derive(Debug, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Map now holding the area's data.
    pub map_id: MapId,
    pub timer: CommitTimer,
    /// Metadata rows to persist.
    pub writes: Vec<BatchOperation>,
}

/// Namespaces, their areas, the on-disk namespace records, and the maps.
///
/// Every method that changes persistent metadata returns the operations to
/// write; nothing here performs I/O.
#[derive(Debug)]
pub struct Registry {
    namespaces: HashMap<NamespaceId, LiveNamespace>,
    records: NamespaceRecords,
    arena: MapArena,
    next_owner: u64,
}

impl Registry {
    /// A registry holding only the local namespace.
    pub fn new(options: AreaOptions, backed: bool) -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(NamespaceId::LOCAL, LiveNamespace::new(PersistentNamespaceId::local()));
        Self {
            namespaces,
            records: NamespaceRecords::new(),
            arena: MapArena::new(options, backed),
            next_owner: 0,
        }
    }

    pub fn arena(&self) -> &MapArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut MapArena {
        &mut self.arena
    }

    pub fn records(&self) -> &NamespaceRecords {
        &self.records
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    pub fn memory_used(&self) -> usize {
        self.arena.maps().map(|map| map.memory_used()).sum()
    }

    /// Install the metadata read by the connection.
    ///
    /// The id counter resumes at the larger of one past the highest recorded
    /// map and the persisted `next-map-id`.
    pub fn load_metadata(&mut self, metadata: Metadata, backed: bool) {
        self.reset(backed);
        self.records = NamespaceRecords::from_rows(metadata.rows);
        for (map, refcount) in self.records.refcounts() {
            self.arena.insert_existing(map, refcount);
        }
        if let Some(next) = metadata.next_map_id {
            self.arena.reserve_ids_below(next);
        }
        info!(
            records = self.records.len(),
            maps = self.arena.len(),
            next_map_id = %self.arena.next_map_id(),
            "namespace metadata loaded"
        );
    }

    /// Forget every map and record. Live namespaces stay; their areas are
    /// reopened on next use and their observers are disconnected.
    pub fn reset(&mut self, backed: bool) {
        for namespace in self.namespaces.values_mut() {
            namespace.areas.clear();
        }
        self.records.clear();
        self.arena.reset(backed);
    }

    pub fn create_namespace(&mut self, id: NamespaceId, persistent_id: PersistentNamespaceId) -> ContextResult<()> {
        if self.namespaces.contains_key(&id) {
            return Err(ContextError::NamespaceExists(id));
        }
        if persistent_id.is_local() {
            return Err(ContextError::ReservedPersistentId(persistent_id));
        }
        self.check_persistent_id_free(&persistent_id)?;
        let restored = self.records.contains_namespace(&persistent_id);
        info!(namespace = %id, persistent_id = %persistent_id, restored, "created namespace");
        self.namespaces.insert(id, LiveNamespace::new(persistent_id));
        Ok(())
    }

    /// Make `new_id` share every map of `source`.
    ///
    /// Returns the metadata writes and the maps whose pending batches should
    /// be flushed now.
    pub fn clone_namespace(
        &mut self,
        source: NamespaceId,
        new_id: NamespaceId,
        new_persistent_id: PersistentNamespaceId,
    ) -> ContextResult<(Vec<BatchOperation>, Vec<MapId>)> {
        if source.is_local() {
            return Err(ContextError::LocalNamespace("cloned"));
        }
        let source_pid = self
            .namespaces
            .get(&source)
            .map(|ns| ns.persistent_id.clone())
            .ok_or(ContextError::UnknownNamespace(source))?;
        if self.namespaces.contains_key(&new_id) {
            return Err(ContextError::NamespaceExists(new_id));
        }
        if new_persistent_id.is_local() {
            return Err(ContextError::ReservedPersistentId(new_persistent_id));
        }
        self.check_persistent_id_free(&new_persistent_id)?;

        let mut writes = self.release_records(&new_persistent_id);
        let mut flush = Vec::new();
        for (origin, map) in self.records.origins(&source_pid) {
            self.arena.add_reference(map)?;
            writes.push(self.records.set(&new_persistent_id, &origin, map));
            flush.push(map);
        }
        info!(
            source = %source,
            namespace = %new_id,
            persistent_id = %new_persistent_id,
            shared_maps = flush.len(),
            "cloned namespace"
        );
        self.namespaces.insert(new_id, LiveNamespace::new(new_persistent_id));
        Ok((writes, flush))
    }

    /// Drop a live namespace. Unless `persist`, its records are deleted and
    /// its map references released.
    pub fn delete_namespace(&mut self, id: NamespaceId, persist: bool) -> ContextResult<Vec<BatchOperation>> {
        if id.is_local() {
            return Err(ContextError::LocalNamespace("deleted"));
        }
        let namespace = self.namespaces.remove(&id).ok_or(ContextError::UnknownNamespace(id))?;
        for area in namespace.areas.values() {
            area.drop_observers(&mut self.arena);
        }
        info!(namespace = %id, persistent_id = %namespace.persistent_id, persist, "deleted namespace");
        if persist {
            return Ok(Vec::new());
        }
        Ok(self.release_records(&namespace.persistent_id))
    }

    /// Delete every recorded namespace that is not live.
    pub fn scavenge(&mut self) -> Vec<BatchOperation> {
        let live: HashSet<&PersistentNamespaceId> = self.namespaces.values().map(|ns| &ns.persistent_id).collect();
        let unused: Vec<PersistentNamespaceId> = self
            .records
            .namespaces()
            .filter(|pid| !live.contains(pid))
            .cloned()
            .collect();
        let mut writes = Vec::new();
        for pid in &unused {
            writes.extend(self.release_records(pid));
        }
        if !unused.is_empty() {
            info!(namespaces = unused.len(), "scavenged unused namespaces");
        }
        writes
    }

    pub fn usage(&self) -> Vec<StorageUsageInfo> {
        self.records.usage()
    }

    /// Bind `origin` in namespace `id` to a map, creating one when nothing
    /// is recorded. Returns the map and any metadata writes.
    pub fn open_area(&mut self, id: NamespaceId, origin: &Origin) -> ContextResult<(MapId, Vec<BatchOperation>)> {
        let namespace = self.namespaces.get_mut(&id).ok_or(ContextError::UnknownNamespace(id))?;
        if let Some(area) = namespace.areas.get(origin) {
            return Ok((area.map_id(), Vec::new()));
        }

        let mut writes = Vec::new();
        let recorded = self
            .records
            .map_for(&namespace.persistent_id, origin)
            .filter(|map| self.arena.contains(*map));
        let map = match recorded {
            Some(map) => map,
            None => {
                let map = self.arena.create();
                writes.push(self.records.set(&namespace.persistent_id, origin, map));
                writes.push(next_map_id_op(self.arena.next_map_id()));
                map
            }
        };

        let owner = ObserverOwner::new(self.next_owner);
        self.next_owner += 1;
        namespace
            .areas
            .insert(origin.clone(), AreaWrapper::new(id, origin.clone(), map, owner));
        debug!(namespace = %id, origin = %origin, map_id = %map, "opened area");
        Ok((map, writes))
    }

    /// Run `f` against an open area.
    pub fn with_area<T>(
        &mut self,
        id: NamespaceId,
        origin: &Origin,
        f: impl FnOnce(&mut AreaWrapper, &mut MapArena) -> AreaResult<T>,
    ) -> ContextResult<T> {
        let namespace = self.namespaces.get_mut(&id).ok_or(ContextError::UnknownNamespace(id))?;
        let area = namespace.areas.get_mut(origin).ok_or_else(|| ContextError::AreaNotOpen {
            namespace: id,
            origin: origin.clone(),
        })?;
        Ok(f(area, &mut self.arena)?)
    }

    /// Run a mutation and persist the new binding if the area forked.
    pub fn mutate(
        &mut self,
        id: NamespaceId,
        origin: &Origin,
        f: impl FnOnce(&mut AreaWrapper, &mut MapArena) -> AreaResult<Mutation>,
    ) -> ContextResult<MutationOutcome> {
        let mut map_id = MapId::new(0);
        let mutation = self.with_area(id, origin, |area, arena| {
            let mutation = f(area, arena)?;
            map_id = area.map_id();
            Ok(mutation)
        })?;

        let mut writes = Vec::new();
        if let Some((old, new)) = mutation.forked {
            let pid = self.persistent_id(id)?;
            writes.push(self.records.set(&pid, origin, new));
            writes.push(next_map_id_op(self.arena.next_map_id()));
            debug!(namespace = %id, origin = %origin, from = %old, to = %new, "area forked");
        }
        Ok(MutationOutcome {
            map_id,
            timer: mutation.timer,
            writes,
        })
    }

    fn persistent_id(&self, id: NamespaceId) -> ContextResult<PersistentNamespaceId> {
        self.namespaces
            .get(&id)
            .map(|ns| ns.persistent_id.clone())
            .ok_or(ContextError::UnknownNamespace(id))
    }

    fn check_persistent_id_free(&self, persistent_id: &PersistentNamespaceId) -> ContextResult<()> {
        if self.namespaces.values().any(|ns| &ns.persistent_id == persistent_id) {
            return Err(ContextError::PersistentIdInUse(persistent_id.clone()));
        }
        Ok(())
    }

    /// Delete the records of `persistent_id` and release their maps. Maps
    /// losing their last reference have their rows deleted too.
    fn release_records(&mut self, persistent_id: &PersistentNamespaceId) -> Vec<BatchOperation> {
        let (maps, mut writes) = self.records.remove_namespace(persistent_id);
        for map in maps {
            match self.arena.release(map) {
                Ok(Release::Deleted { prefix, backed: true }) => writes.push(BatchOperation::delete_prefixed(prefix)),
                Ok(_) => {}
                Err(e) => warn!(map_id = %map, error = %e, "namespace record pointed at a missing map"),
            }
        }
        writes
    }
}

fn next_map_id_op(next: MapId) -> BatchOperation {
    BatchOperation::put(NEXT_MAP_ID_KEY, encode_number(next.get()))
}
