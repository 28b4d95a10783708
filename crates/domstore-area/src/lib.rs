//! Storage areas for domstore.
//!
//! An area is the key space one origin sees inside one namespace. Its data
//! lives in a [`StorageMap`]: a write-back cache over a prefix of the shared
//! database that batches mutations into a [`CommitBatch`] and paces flushes
//! with a [`CommitScheduler`]. Maps are shared between namespaces through the
//! [`MapArena`] and forked on the first write after a clone.
//!
//! Nothing in this crate performs I/O. Loads and commits are handed to the
//! caller as data ([`LoadStart`], [`PendingCommit`]) and their results fed
//! back in, so the owner of the arena decides when and where the database is
//! touched.
//!
//! # Key Types
//!
//! - [`StorageMap`] -- cache, quota, pending batch, and observers of one map
//! - [`MapArena`] -- refcounted maps indexed by [`MapId`](domstore_types::MapId)
//! - [`AreaWrapper`] -- binds an area to its map and forks shared maps
//! - [`AreaEvent`] -- mutation notifications delivered to observers

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod observer;
pub mod rate_limiter;
pub mod shared_map;
pub mod storage_map;
pub mod wrapper;

pub use batch::CommitBatch;
pub use cache::{CacheMode, CacheState};
pub use config::AreaOptions;
pub use error::{AreaError, AreaResult};
pub use observer::{AreaEvent, ObserverOwner, ObserverSet, ObserverStream};
pub use rate_limiter::{CommitScheduler, RateLimiter};
pub use shared_map::{MapArena, Release};
pub use storage_map::{Access, CommitTimer, LoadStart, PendingCommit, StorageMap};
pub use wrapper::{AreaWrapper, Mutation};
