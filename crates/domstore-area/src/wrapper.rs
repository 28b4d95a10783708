use domstore_types::{MapId, NamespaceId, Origin, StorageKey, StorageValue};

use crate::cache::CacheMode;
use crate::error::AreaResult;
use crate::observer::{ObserverOwner, ObserverStream};
use crate::shared_map::MapArena;
use crate::storage_map::{Access, CommitTimer};

/// Outcome of a mutation through an [`AreaWrapper`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mutation {
    /// Arm the commit timer of the area's (possibly new) map.
    pub timer: CommitTimer,
    /// The area forked away from a shared map: `(old, new)`.
    pub forked: Option<(MapId, MapId)>,
}

impl Mutation {
    /// Nothing changed; a shared map stays shared.
    pub const UNCHANGED: Mutation = Mutation {
        timer: CommitTimer::Idle,
        forked: None,
    };
}

/// One area: an origin inside a namespace, bound to the map holding its data.
///
/// Mutations on a map shared with other namespaces fork it first, so clones
/// never observe each other's writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AreaWrapper {
    namespace: NamespaceId,
    origin: Origin,
    map_id: MapId,
    owner: ObserverOwner,
}

impl AreaWrapper {
    pub fn new(namespace: NamespaceId, origin: Origin, map_id: MapId, owner: ObserverOwner) -> Self {
        Self {
            namespace,
            origin,
            map_id,
            owner,
        }
    }

    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn map_id(&self) -> MapId {
        self.map_id
    }

    pub fn owner(&self) -> ObserverOwner {
        self.owner
    }

    /// What the map must have loaded before `access` can run. Forking needs
    /// values, so a mutation on a shared map counts as a read.
    pub fn required_access(&self, arena: &MapArena, access: Access) -> Access {
        if access == Access::Write && arena.is_shared(self.map_id) {
            Access::Read
        } else {
            access
        }
    }

    pub fn get(&self, arena: &MapArena, key: &[u8]) -> AreaResult<Option<StorageValue>> {
        arena.get(self.map_id)?.get(key)
    }

    pub fn get_all(&self, arena: &MapArena) -> AreaResult<Vec<(StorageKey, StorageValue)>> {
        arena.get(self.map_id)?.get_all()
    }

    pub fn put(
        &mut self,
        arena: &mut MapArena,
        key: StorageKey,
        value: StorageValue,
        client_old_value: Option<StorageValue>,
        source: &str,
    ) -> AreaResult<Mutation> {
        if arena.is_shared(self.map_id)
            && !arena
                .get(self.map_id)?
                .put_would_change(&key, &value, client_old_value.clone())?
        {
            return Ok(Mutation::UNCHANGED);
        }
        let (forked, fork_timer) = self.fork_if_shared(arena)?;
        let timer = arena
            .get_mut(self.map_id)?
            .put(key, value, client_old_value, source)?;
        Ok(Mutation {
            timer: combine(fork_timer, timer),
            forked,
        })
    }

    pub fn delete(
        &mut self,
        arena: &mut MapArena,
        key: StorageKey,
        client_old_value: Option<StorageValue>,
        source: &str,
    ) -> AreaResult<Mutation> {
        if arena.is_shared(self.map_id)
            && !arena
                .get(self.map_id)?
                .delete_would_change(&key, client_old_value.clone())?
        {
            return Ok(Mutation::UNCHANGED);
        }
        let (forked, fork_timer) = self.fork_if_shared(arena)?;
        let timer = arena
            .get_mut(self.map_id)?
            .delete(key, client_old_value, source)?;
        Ok(Mutation {
            timer: combine(fork_timer, timer),
            forked,
        })
    }

    pub fn delete_all(&mut self, arena: &mut MapArena, source: &str) -> AreaResult<Mutation> {
        if arena.is_shared(self.map_id) && !arena.get(self.map_id)?.delete_all_would_change()? {
            return Ok(Mutation::UNCHANGED);
        }
        let (forked, fork_timer) = self.fork_if_shared(arena)?;
        let timer = arena.get_mut(self.map_id)?.delete_all(source)?;
        Ok(Mutation {
            timer: combine(fork_timer, timer),
            forked,
        })
    }

    pub fn set_cache_mode(&self, arena: &mut MapArena, mode: CacheMode) -> AreaResult<()> {
        arena.get_mut(self.map_id)?.set_cache_mode(mode);
        Ok(())
    }

    pub fn add_observer(&self, arena: &mut MapArena) -> AreaResult<ObserverStream> {
        Ok(arena.get_mut(self.map_id)?.add_observer(self.owner))
    }

    /// Disconnect every observer registered through this area.
    pub fn drop_observers(&self, arena: &mut MapArena) {
        if let Ok(map) = arena.get_mut(self.map_id) {
            drop(map.take_observers(self.owner));
        }
    }

    fn fork_if_shared(&mut self, arena: &mut MapArena) -> AreaResult<(Option<(MapId, MapId)>, CommitTimer)> {
        if !arena.is_shared(self.map_id) {
            return Ok((None, CommitTimer::Idle));
        }
        let old = self.map_id;
        let (new, timer) = arena.fork(old, self.owner)?;
        self.map_id = new;
        Ok((Some((old, new)), timer))
    }
}

fn combine(a: CommitTimer, b: CommitTimer) -> CommitTimer {
    if a == CommitTimer::Arm || b == CommitTimer::Arm {
        CommitTimer::Arm
    } else {
        CommitTimer::Idle
    }
}
