use domstore_types::MapId;

/// Errors from area operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AreaError {
    /// The write would push the area past its quota.
    #[error("quota exceeded: {requested} bytes requested, {limit} allowed")]
    QuotaExceeded { requested: usize, limit: usize },

    /// In keys-only mode the caller must supply the current value of a key it
    /// overwrites or deletes, and its length must match the cached length.
    #[error("inconsistent old value: cached length {cached}, supplied {supplied:?}")]
    InconsistentOldValue {
        cached: usize,
        supplied: Option<usize>,
    },

    /// The operation needs a loaded cache.
    #[error("map {0} is not loaded")]
    NotLoaded(MapId),

    /// No map with this id exists in the arena.
    #[error("unknown map {0}")]
    UnknownMap(MapId),
}

/// Result alias for area operations.
pub type AreaResult<T> = Result<T, AreaError>;
