use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use domstore_db::{BatchOperation, DbResult};
use domstore_types::keys::map_prefix;
use domstore_types::{MapId, StorageKey, StorageValue};

use crate::batch::CommitBatch;
use crate::cache::{keys_only_cost, CacheMode, CacheState, MapCache};
use crate::config::AreaOptions;
use crate::error::{AreaError, AreaResult};
use crate::observer::{AreaEvent, ObserverOwner, ObserverSet, ObserverStream};
use crate::rate_limiter::CommitScheduler;

/// What an operation needs from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Values must be in memory.
    Read,
    /// Any loaded cache will do.
    Write,
}

/// Whether the caller should arm the map's commit timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitTimer {
    Idle,
    Arm,
}

/// Outcome of [`StorageMap::begin_load`].
#[derive(Debug)]
pub enum LoadStart {
    /// A load is already outstanding; wait for it.
    InProgress,
    /// Commit `flush` (if any), then read every row under `prefix` and hand
    /// the result to [`StorageMap::finish_load`].
    Fetch {
        prefix: Vec<u8>,
        flush: Option<PendingCommit>,
    },
    /// The map became loaded without touching the database.
    Loaded,
}

/// A batch taken out of a map and ready to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCommit {
    pub operations: Vec<BatchOperation>,
    pub data_size: usize,
}

/// One shared map: a write-back cache over the rows under `map-<id>-`.
///
/// Mutations update the cache immediately and accrue in a [`CommitBatch`];
/// the owner flushes batches when the commit timer fires. A taken batch is
/// kept until its write is acknowledged; a failed write is folded back into
/// the pending batch and retried by the next flush. A map whose initial load
/// failed becomes unbacked: it keeps working in memory and never produces
/// batches again.
#[derive(Debug)]
pub struct StorageMap {
    id: MapId,
    prefix: Vec<u8>,
    options: AreaOptions,
    backed: bool,
    desired_mode: CacheMode,
    cache: MapCache,
    batch: Option<CommitBatch>,
    /// Batches handed out for writing, oldest first.
    in_flight: VecDeque<CommitBatch>,
    scheduler: CommitScheduler,
    observers: ObserverSet,
}

impl StorageMap {
    /// A map whose rows already exist in the database.
    pub fn unloaded(id: MapId, options: &AreaOptions, backed: bool) -> Self {
        Self::build(id, options, backed, MapCache::unloaded())
    }

    /// A brand new map with no rows anywhere.
    pub fn empty(id: MapId, options: &AreaOptions, backed: bool) -> Self {
        Self::build(id, options, backed, MapCache::empty())
    }

    fn build(id: MapId, options: &AreaOptions, backed: bool, cache: MapCache) -> Self {
        Self {
            id,
            prefix: map_prefix(id),
            options: options.clone(),
            backed,
            desired_mode: if backed {
                options.cache_mode
            } else {
                CacheMode::KeysAndValues
            },
            cache,
            batch: None,
            in_flight: VecDeque::new(),
            scheduler: CommitScheduler::new(options),
            observers: ObserverSet::new(),
        }
    }

    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn is_backed(&self) -> bool {
        self.backed
    }

    pub fn desired_mode(&self) -> CacheMode {
        self.desired_mode
    }

    pub fn cache_state(&self) -> &CacheState {
        self.cache.state()
    }

    pub fn is_loaded(&self) -> bool {
        self.cache.is_loaded()
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.cache.state(), CacheState::Loading)
    }

    pub fn has_pending_batch(&self) -> bool {
        self.batch.is_some()
    }

    pub fn commits_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn storage_used(&self) -> usize {
        self.cache.storage_used()
    }

    pub fn memory_used(&self) -> usize {
        self.cache.memory_used()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Whether `access` has to wait for a (re)load.
    pub fn needs_load(&self, access: Access) -> bool {
        match self.cache.state() {
            CacheState::Unloaded | CacheState::Loading => true,
            CacheState::KeysOnly(_) => access == Access::Read,
            CacheState::KeysAndValues(_) => false,
        }
    }

    /// Start loading keys and values.
    ///
    /// A keys-only cache is discarded; its pending batch is returned for
    /// committing ahead of the read so the read observes it.
    pub fn begin_load(&mut self) -> LoadStart {
        match self.cache.state() {
            CacheState::Loading => return LoadStart::InProgress,
            CacheState::KeysAndValues(_) => return LoadStart::Loaded,
            CacheState::Unloaded | CacheState::KeysOnly(_) => {}
        }

        let flush = self.take_commit();
        if !self.backed {
            self.cache = MapCache::empty();
            return LoadStart::Loaded;
        }
        self.cache.begin_loading();
        debug!(map_id = %self.id, "loading map");
        LoadStart::Fetch {
            prefix: self.prefix.clone(),
            flush,
        }
    }

    /// Install the rows read for this map's prefix.
    ///
    /// On error the map continues empty and unbacked.
    pub fn finish_load(&mut self, rows: DbResult<Vec<(Vec<u8>, Vec<u8>)>>) {
        if !self.is_loading() {
            debug!(map_id = %self.id, "ignoring load result for map that is not loading");
            return;
        }
        let mut values: BTreeMap<StorageKey, StorageValue> = match rows {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|(key, value)| {
                    key.strip_prefix(self.prefix.as_slice())
                        .map(|logical| (logical.to_vec(), value))
                })
                .collect(),
            Err(e) => {
                warn!(
                    map_id = %self.id,
                    error = %e,
                    "failed to load map; continuing in memory without persistence"
                );
                self.backed = false;
                self.desired_mode = CacheMode::KeysAndValues;
                self.batch = None;
                BTreeMap::new()
            }
        };
        if let Some(batch) = &self.batch {
            // Writes that failed before the read are not on disk yet.
            batch.apply_to(&mut values);
        }
        self.cache = MapCache::with_values(values);
        debug!(
            map_id = %self.id,
            keys = self.cache.len(),
            bytes = self.cache.storage_used(),
            "map loaded"
        );
    }

    pub fn get(&self, key: &[u8]) -> AreaResult<Option<StorageValue>> {
        let values = self.cache.values().ok_or(AreaError::NotLoaded(self.id))?;
        Ok(values.get(key).cloned())
    }

    pub fn get_all(&self) -> AreaResult<Vec<(StorageKey, StorageValue)>> {
        let values = self.cache.values().ok_or(AreaError::NotLoaded(self.id))?;
        Ok(values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Store `value` under `key`.
    ///
    /// Writing the value a key already holds succeeds without side effects.
    /// Growth past the quota is rejected; shrinking writes are accepted even
    /// when the area is over quota.
    pub fn put(
        &mut self,
        key: StorageKey,
        value: StorageValue,
        client_old_value: Option<StorageValue>,
        source: &str,
    ) -> AreaResult<CommitTimer> {
        let Some(plan) = self.plan_put(&key, &value, client_old_value)? else {
            return Ok(CommitTimer::Idle);
        };
        let PutPlan {
            old_value,
            old_item_memory,
            new_item_memory,
            new_storage_used,
        } = plan;

        let timer = if self.backed {
            let timer = self.ensure_batch();
            if let Some(batch) = self.batch.as_mut() {
                batch.record_put(key.clone(), value.clone());
            }
            timer
        } else {
            CommitTimer::Idle
        };

        match &mut self.cache.state {
            CacheState::KeysOnly(keys) => {
                keys.insert(key.clone(), value.len());
            }
            CacheState::KeysAndValues(values) => {
                values.insert(key.clone(), value.clone());
            }
            CacheState::Unloaded | CacheState::Loading => {}
        }
        self.cache.storage_used = new_storage_used;
        self.cache.memory_used = self.cache.memory_used + new_item_memory - old_item_memory;

        let source = source.to_string();
        let event = match old_value {
            None => AreaEvent::KeyAdded { key, value, source },
            Some(old_value) => AreaEvent::KeyChanged {
                key,
                new_value: value,
                old_value,
                source,
            },
        };
        self.observers.dispatch(&event);
        Ok(timer)
    }

    /// Whether [`put`](Self::put) would change anything. Rejections surface
    /// here exactly as `put` would report them.
    pub fn put_would_change(
        &self,
        key: &[u8],
        value: &[u8],
        client_old_value: Option<StorageValue>,
    ) -> AreaResult<bool> {
        Ok(self.plan_put(key, value, client_old_value)?.is_some())
    }

    /// Whether [`delete`](Self::delete) would change anything.
    pub fn delete_would_change(&self, key: &[u8], client_old_value: Option<StorageValue>) -> AreaResult<bool> {
        match self.cache.state() {
            CacheState::KeysOnly(keys) => match keys.get(key) {
                Some(&cached) => check_client_old_value(cached, client_old_value).map(|_| true),
                None => Ok(false),
            },
            CacheState::KeysAndValues(values) => Ok(values.contains_key(key)),
            CacheState::Unloaded | CacheState::Loading => Err(AreaError::NotLoaded(self.id)),
        }
    }

    /// Whether [`delete_all`](Self::delete_all) would change anything.
    pub fn delete_all_would_change(&self) -> AreaResult<bool> {
        if !self.cache.is_loaded() {
            return Err(AreaError::NotLoaded(self.id));
        }
        Ok(!self.cache.is_empty())
    }

    /// Work out the accounting of a put. `None` means the key already holds
    /// `value`.
    fn plan_put(
        &self,
        key: &[u8],
        value: &[u8],
        client_old_value: Option<StorageValue>,
    ) -> AreaResult<Option<PutPlan>> {
        let (old_value, old_item_size, old_item_memory, new_item_memory) = match self.cache.state() {
            CacheState::KeysOnly(keys) => match keys.get(key) {
                Some(&cached) => {
                    let old = check_client_old_value(cached, client_old_value)?;
                    if old == value {
                        return Ok(None);
                    }
                    let memory = keys_only_cost(key);
                    (Some(old), key.len() + cached, memory, memory)
                }
                None => (None, 0, 0, keys_only_cost(key)),
            },
            CacheState::KeysAndValues(values) => match values.get(key) {
                Some(existing) => {
                    if existing.as_slice() == value {
                        return Ok(None);
                    }
                    let size = key.len() + existing.len();
                    (Some(existing.clone()), size, size, key.len() + value.len())
                }
                None => (None, 0, 0, key.len() + value.len()),
            },
            CacheState::Unloaded | CacheState::Loading => return Err(AreaError::NotLoaded(self.id)),
        };

        let new_item_size = key.len() + value.len();
        let new_storage_used = self.cache.storage_used - old_item_size + new_item_size;
        if new_item_size > old_item_size && new_storage_used > self.options.max_size {
            debug!(map_id = %self.id, requested = new_storage_used, "put rejected over quota");
            return Err(AreaError::QuotaExceeded {
                requested: new_storage_used,
                limit: self.options.max_size,
            });
        }
        Ok(Some(PutPlan {
            old_value,
            old_item_memory,
            new_item_memory,
            new_storage_used,
        }))
    }

    /// Remove `key`. Removing an absent key succeeds without side effects.
    pub fn delete(
        &mut self,
        key: StorageKey,
        client_old_value: Option<StorageValue>,
        source: &str,
    ) -> AreaResult<CommitTimer> {
        let old_value = match &mut self.cache.state {
            CacheState::KeysOnly(keys) => {
                let Some(&cached) = keys.get(&key) else {
                    return Ok(CommitTimer::Idle);
                };
                let old = check_client_old_value(cached, client_old_value)?;
                keys.remove(&key);
                self.cache.storage_used -= key.len() + cached;
                self.cache.memory_used -= keys_only_cost(&key);
                old
            }
            CacheState::KeysAndValues(values) => {
                let Some(old) = values.remove(&key) else {
                    return Ok(CommitTimer::Idle);
                };
                self.cache.storage_used -= key.len() + old.len();
                self.cache.memory_used -= key.len() + old.len();
                old
            }
            CacheState::Unloaded | CacheState::Loading => return Err(AreaError::NotLoaded(self.id)),
        };

        let timer = if self.backed {
            let timer = self.ensure_batch();
            if let Some(batch) = self.batch.as_mut() {
                batch.record_delete(key.clone());
            }
            timer
        } else {
            CommitTimer::Idle
        };

        self.observers.dispatch(&AreaEvent::KeyDeleted {
            key,
            old_value,
            source: source.to_string(),
        });
        Ok(timer)
    }

    /// Remove every key. An empty area is left untouched.
    pub fn delete_all(&mut self, source: &str) -> AreaResult<CommitTimer> {
        if !self.cache.is_loaded() {
            return Err(AreaError::NotLoaded(self.id));
        }
        if self.cache.is_empty() {
            return Ok(CommitTimer::Idle);
        }

        let timer = if self.backed {
            let timer = self.ensure_batch();
            if let Some(batch) = self.batch.as_mut() {
                batch.clear_all();
            }
            timer
        } else {
            CommitTimer::Idle
        };

        match &mut self.cache.state {
            CacheState::KeysOnly(keys) => keys.clear(),
            CacheState::KeysAndValues(values) => values.clear(),
            CacheState::Unloaded | CacheState::Loading => {}
        }
        self.cache.storage_used = 0;
        self.cache.memory_used = 0;

        self.observers.dispatch(&AreaEvent::AllDeleted {
            source: source.to_string(),
        });
        Ok(timer)
    }

    /// Change the desired cache mode. Unbacked maps always keep values.
    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        if !self.backed || self.desired_mode == mode {
            return;
        }
        self.desired_mode = mode;
        self.unload_if_possible();
    }

    /// Drop values when keys-only is desired and nothing is pending.
    pub fn unload_if_possible(&mut self) -> bool {
        if !self.cache.has_values()
            || !self.backed
            || self.batch.is_some()
            || !self.in_flight.is_empty()
            || self.desired_mode != CacheMode::KeysOnly
        {
            return false;
        }
        self.cache.demote_to_keys_only();
        debug!(map_id = %self.id, memory = self.cache.memory_used(), "map unloaded to keys only");
        true
    }

    /// Drop the whole cache of a quiescent backed map.
    pub fn purge_memory(&mut self) -> bool {
        if !self.cache.is_loaded()
            || self.batch.is_some()
            || !self.in_flight.is_empty()
            || !self.backed
        {
            return false;
        }
        self.cache.unload();
        true
    }

    /// Take the pending batch for writing, regardless of commits in flight.
    pub fn take_commit(&mut self) -> Option<PendingCommit> {
        let batch = self.batch.take()?;
        let operations = batch.to_operations(&self.prefix);
        let data_size = batch.data_size();
        self.scheduler.record_commit(data_size);
        debug!(
            map_id = %self.id,
            ops = operations.len(),
            bytes = data_size,
            clear_all = batch.clear_all_first,
            "committing batch"
        );
        self.in_flight.push_back(batch);
        Some(PendingCommit {
            operations,
            data_size,
        })
    }

    /// Take the pending batch when the commit timer fires. Nothing is taken
    /// while another commit is in flight; the timer is re-armed when it lands.
    pub fn on_commit_timer(&mut self) -> Option<PendingCommit> {
        if !self.in_flight.is_empty() {
            return None;
        }
        self.take_commit()
    }

    /// The oldest commit taken earlier has been written, or failed to be.
    ///
    /// A failed batch goes back in front of the pending one together with
    /// every batch still in flight behind it, so the retry reapplies them in
    /// their original order.
    pub fn commit_complete(&mut self, written: bool) -> CommitTimer {
        let Some(failed) = self.in_flight.pop_front() else {
            return CommitTimer::Idle;
        };
        if !written && self.backed {
            let retry = self
                .in_flight
                .iter()
                .chain(self.batch.as_ref())
                .fold(failed, |merged, later| merged.followed_by(later));
            warn!(map_id = %self.id, ops = retry.changed.len(), "commit failed; batch kept for retry");
            self.batch = Some(retry);
        }
        self.unload_if_possible();
        if self.batch.is_some() && self.in_flight.is_empty() {
            CommitTimer::Arm
        } else {
            CommitTimer::Idle
        }
    }

    /// How long to wait before flushing the pending batch.
    pub fn commit_delay(&self, now: Instant, aggressive: bool) -> Duration {
        self.scheduler.commit_delay(now, aggressive)
    }

    /// Copy this map's contents into a new map `new_id`.
    ///
    /// The new map starts with a batch that rewrites its whole prefix, so its
    /// first flush makes it independent of this map's rows.
    pub fn fork(&self, new_id: MapId) -> AreaResult<(StorageMap, CommitTimer)> {
        let values = self.cache.values().ok_or(AreaError::NotLoaded(self.id))?;
        let mut forked = Self::build(new_id, &self.options, self.backed, MapCache::with_values(values.clone()));
        forked.desired_mode = self.desired_mode;
        let timer = if forked.backed && !values.is_empty() {
            forked.batch = Some(CommitBatch::snapshot(values));
            CommitTimer::Arm
        } else {
            CommitTimer::Idle
        };
        debug!(from = %self.id, to = %new_id, keys = values.len(), "forked map");
        Ok((forked, timer))
    }

    pub fn add_observer(&mut self, owner: ObserverOwner) -> ObserverStream {
        self.observers.add(owner)
    }

    pub fn take_observers(&mut self, owner: ObserverOwner) -> ObserverSet {
        self.observers.take_owned_by(owner)
    }

    pub fn adopt_observers(&mut self, observers: ObserverSet) {
        self.observers.extend(observers);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn ensure_batch(&mut self) -> CommitTimer {
        if self.batch.is_some() {
            return CommitTimer::Idle;
        }
        self.batch = Some(CommitBatch::new());
        if self.in_flight.is_empty() {
            CommitTimer::Arm
        } else {
            CommitTimer::Idle
        }
    }
}

/// In keys-only mode the caller vouches for the current value; its length
/// must match what the cache recorded.
struct PutPlan {
    old_value: Option<StorageValue>,
    old_item_memory: usize,
    new_item_memory: usize,
    new_storage_used: usize,
}

fn check_client_old_value(cached: usize, supplied: Option<StorageValue>) -> AreaResult<StorageValue> {
    match supplied {
        Some(old) if old.len() == cached => Ok(old),
        other => Err(AreaError::InconsistentOldValue {
            cached,
            supplied: other.as_ref().map(Vec::len),
        }),
    }
}
