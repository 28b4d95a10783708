use std::collections::HashMap;

use tracing::debug;

use domstore_types::MapId;

use crate::config::AreaOptions;
use crate::error::{AreaError, AreaResult};
use crate::observer::ObserverOwner;
use crate::storage_map::{CommitTimer, StorageMap};

/// A map together with the number of namespace records pointing at it.
#[derive(Debug)]
struct SharedMap {
    refcount: usize,
    map: StorageMap,
}

/// Result of dropping one reference to a map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Release {
    /// Other references remain.
    Retained(usize),
    /// That was the last reference; the map is gone from the arena and its
    /// rows under `prefix` should be deleted when `backed`.
    Deleted { prefix: Vec<u8>, backed: bool },
}

/// All shared maps of a storage context, indexed by [`MapId`].
///
/// A map may be referenced by areas of several namespaces after a clone. It
/// is only mutated while its refcount is 1; otherwise the mutating area forks
/// it first. Map ids come from one monotonically increasing counter and are
/// never reused.
#[derive(Debug)]
pub struct MapArena {
    maps: HashMap<MapId, SharedMap>,
    next_map_id: MapId,
    options: AreaOptions,
    backed: bool,
}

impl MapArena {
    /// An empty arena. New maps are backed by a database when `backed`.
    pub fn new(options: AreaOptions, backed: bool) -> Self {
        Self {
            maps: HashMap::new(),
            next_map_id: MapId::new(0),
            options,
            backed,
        }
    }

    pub fn options(&self) -> &AreaOptions {
        &self.options
    }

    pub fn is_backed(&self) -> bool {
        self.backed
    }

    /// Drop every map and start over with a new backing.
    pub fn reset(&mut self, backed: bool) {
        self.maps.clear();
        self.next_map_id = MapId::new(0);
        self.backed = backed;
    }

    pub fn next_map_id(&self) -> MapId {
        self.next_map_id
    }

    /// Raise the id counter to at least `id`.
    pub fn reserve_ids_below(&mut self, id: MapId) {
        self.next_map_id = self.next_map_id.max(id);
    }

    /// Hand out the next map id.
    pub fn allocate_id(&mut self) -> MapId {
        let id = self.next_map_id;
        self.next_map_id = id.next();
        id
    }

    /// Create a new empty map with one reference.
    pub fn create(&mut self) -> MapId {
        let id = self.allocate_id();
        let map = StorageMap::empty(id, &self.options, self.backed);
        self.maps.insert(id, SharedMap { refcount: 1, map });
        debug!(map_id = %id, "created map");
        id
    }

    /// Register a map whose rows already exist on disk.
    pub fn insert_existing(&mut self, id: MapId, refcount: usize) {
        self.reserve_ids_below(id.next());
        let map = StorageMap::unloaded(id, &self.options, self.backed);
        self.maps.insert(id, SharedMap { refcount, map });
    }

    pub fn contains(&self, id: MapId) -> bool {
        self.maps.contains_key(&id)
    }

    pub fn get(&self, id: MapId) -> AreaResult<&StorageMap> {
        self.maps
            .get(&id)
            .map(|shared| &shared.map)
            .ok_or(AreaError::UnknownMap(id))
    }

    pub fn get_mut(&mut self, id: MapId) -> AreaResult<&mut StorageMap> {
        self.maps
            .get_mut(&id)
            .map(|shared| &mut shared.map)
            .ok_or(AreaError::UnknownMap(id))
    }

    pub fn refcount(&self, id: MapId) -> usize {
        self.maps.get(&id).map_or(0, |shared| shared.refcount)
    }

    pub fn is_shared(&self, id: MapId) -> bool {
        self.refcount(id) > 1
    }

    pub fn add_reference(&mut self, id: MapId) -> AreaResult<usize> {
        let shared = self.maps.get_mut(&id).ok_or(AreaError::UnknownMap(id))?;
        shared.refcount += 1;
        Ok(shared.refcount)
    }

    pub fn release(&mut self, id: MapId) -> AreaResult<Release> {
        let shared = self.maps.get_mut(&id).ok_or(AreaError::UnknownMap(id))?;
        shared.refcount = shared.refcount.saturating_sub(1);
        if shared.refcount > 0 {
            return Ok(Release::Retained(shared.refcount));
        }
        let shared = self.maps.remove(&id).ok_or(AreaError::UnknownMap(id))?;
        debug!(map_id = %id, "last reference released; deleting map");
        Ok(Release::Deleted {
            prefix: shared.map.prefix().to_vec(),
            backed: shared.map.is_backed(),
        })
    }

    /// Give the area identified by `owner` its own copy of map `id`.
    ///
    /// The copy gets a fresh id and one reference, `owner`'s observers move
    /// to it, and `id` loses one reference. The source must have its values
    /// loaded.
    pub fn fork(&mut self, id: MapId, owner: ObserverOwner) -> AreaResult<(MapId, CommitTimer)> {
        let source = self.maps.get(&id).ok_or(AreaError::UnknownMap(id))?;
        let new_id = self.next_map_id;
        let (mut forked, timer) = source.map.fork(new_id)?;
        self.allocate_id();

        let observers = self.get_mut(id)?.take_observers(owner);
        forked.adopt_observers(observers);
        self.maps.insert(new_id, SharedMap { refcount: 1, map: forked });
        self.release(id)?;
        Ok((new_id, timer))
    }

    pub fn ids(&self) -> impl Iterator<Item = MapId> + '_ {
        self.maps.keys().copied()
    }

    pub fn maps(&self) -> impl Iterator<Item = &StorageMap> + '_ {
        self.maps.values().map(|shared| &shared.map)
    }

    pub fn maps_mut(&mut self) -> impl Iterator<Item = &mut StorageMap> + '_ {
        self.maps.values_mut().map(|shared| &mut shared.map)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
