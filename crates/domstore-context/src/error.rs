use domstore_area::AreaError;
use domstore_types::{NamespaceId, Origin, PersistentNamespaceId, TypeError};

/// Errors surfaced by the storage context API.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The context has shut down (or its owner task is gone).
    #[error("storage context is shut down")]
    ShutDown,

    #[error("unknown namespace {0}")]
    UnknownNamespace(NamespaceId),

    #[error("namespace {0} already exists")]
    NamespaceExists(NamespaceId),

    /// Another live namespace already uses this persistent id.
    #[error("persistent namespace id {0} is in use")]
    PersistentIdInUse(PersistentNamespaceId),

    /// The persistent id `local` belongs to the local namespace only.
    #[error("persistent namespace id {0} is reserved")]
    ReservedPersistentId(PersistentNamespaceId),

    /// The local namespace does not support this operation.
    #[error("the local namespace cannot be {0}")]
    LocalNamespace(&'static str),

    /// The namespace has no open area for this origin.
    #[error("no open area for {origin} in namespace {namespace}")]
    AreaNotOpen { namespace: NamespaceId, origin: Origin },

    #[error(transparent)]
    Area(#[from] AreaError),

    #[error(transparent)]
    Type(#[from] TypeError),

    /// The database thread could not be started.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for context operations.
pub type ContextResult<T> = Result<T, ContextError>;
