//! Foundation types for domstore.
//!
//! This crate provides the identifiers shared by every other domstore crate
//! and the bit-exact physical key layout used to multiplex many storage areas
//! inside one ordered key-value database.
//!
//! # Key Types
//!
//! - [`NamespaceId`] -- Transient numeric namespace identifier (process lifetime)
//! - [`PersistentNamespaceId`] -- String namespace identifier that survives restarts
//! - [`Origin`] -- Serialized web origin owning an area inside a namespace
//! - [`MapId`] -- Numeric identifier of a shared map; source of its physical prefix
//!
//! # Physical Layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `VERSION` | decimal schema version |
//! | `next-map-id` | decimal next map id |
//! | `namespace-<persistent id>-<origin>` | decimal map id |
//! | `map-<map id>-<logical key>` | value |

pub mod error;
pub mod ids;
pub mod keys;

pub use error::TypeError;
pub use ids::{MapId, NamespaceId, Origin, PersistentNamespaceId, StorageKey, StorageValue};
