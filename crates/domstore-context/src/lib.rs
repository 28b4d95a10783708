//! Storage context for domstore.
//!
//! A [`StorageContext`] owns every namespace, area, and map of one storage
//! partition. It runs as a single Tokio task that serializes all operations,
//! with database I/O on a dedicated thread processing requests in FIFO order.
//!
//! On startup the context connects to the database, verifies the schema
//! version, and reads the namespace records. Any failure along the way, or a
//! run of failed commits, recreates the database: first on disk, then in
//! memory, and finally without persistence. Callers never see these errors;
//! the worst case is data loss.
//!
//! # Key Types
//!
//! - [`StorageContext`] -- cloneable handle to the owner task
//! - [`AreaHandle`] -- get, put, delete, and observe one area
//! - [`ContextConfig`] -- directory, area options, and recovery tuning
//! - [`ContextStatus`] -- connection state, backend, and cache usage

mod actor;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod metadata;
pub mod registry;
pub mod worker;

pub use config::{ContextConfig, DEFAULT_COMMIT_ERROR_THRESHOLD};
pub use connection::{Backend, ConnectionState, ConnectionStatus};
pub use context::{AreaHandle, ContextStatus, StorageContext};
pub use error::{ContextError, ContextResult};
pub use metadata::{NamespaceRecords, StorageUsageInfo};
pub use registry::Registry;
