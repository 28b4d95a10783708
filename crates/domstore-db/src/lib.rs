//! Ordered key-value database backends for domstore.
//!
//! The storage engine keeps every area of every namespace inside one ordered
//! byte-keyed database. This crate defines that database boundary and the
//! backends behind it.
//!
//! # Backends
//!
//! All backends implement the [`Database`] trait:
//!
//! - [`LogDatabase`] -- on-disk database: CRC32-framed batch log replayed into
//!   an ordered map on open, compacted when it outgrows its live data
//! - [`InMemoryDatabase`] -- `BTreeMap`-based database for tests and for the
//!   in-memory fallback after disk recovery fails
//! - [`FaultyDatabase`] -- in-memory database with injectable read and write
//!   failures, used to exercise recovery paths
//!
//! Databases are opened through a [`DatabaseOpener`], which also knows how to
//! destroy an on-disk directory so it can be recreated from scratch.
//!
//! # Design Rules
//!
//! 1. A batch is applied atomically: all of its operations or none.
//! 2. Prefix reads return entries in ascending key order.
//! 3. On-disk writes are durable in the log before they become visible.
//! 4. A torn final record is a crash artifact and is dropped; damage anywhere
//!    else is reported as corruption.

pub mod batch;
pub mod error;
pub mod faulty;
pub mod log;
pub mod memory;
pub mod traits;

pub use batch::{apply_batch, BatchOperation};
pub use error::{DatabaseError, DbResult};
pub use faulty::{FaultyDatabase, FaultyOpener};
pub use log::{LogDatabase, LogOptions, SyncMode};
pub use memory::InMemoryDatabase;
pub use traits::{Database, DatabaseOpener, DefaultOpener};
