use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

/// Logical key inside a storage area.
pub type StorageKey = Vec<u8>;

/// Value stored under a [`StorageKey`].
pub type StorageValue = Vec<u8>;

/// Transient namespace identifier, valid for the lifetime of one storage context.
///
/// [`NamespaceId::LOCAL`] is reserved for the single non-cloneable local
/// namespace; every other id names a cloneable session namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceId(u64);

impl NamespaceId {
    /// The local (non-cloneable) namespace.
    pub const LOCAL: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_local(self) -> bool {
        self.0 == Self::LOCAL.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "ns:local")
        } else {
            write!(f, "ns:{}", self.0)
        }
    }
}

/// Namespace identifier that survives process restarts.
///
/// It is embedded verbatim in `namespace-<id>-<origin>` records, so it must
/// be non-empty, printable ASCII without whitespace, and must not contain
/// `-`: the first `-` after the prefix ends the id when a record is parsed
/// back, and the origin may contain any number of them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistentNamespaceId(String);

impl PersistentNamespaceId {
    /// Persistent id of the local namespace. Reserved for it.
    pub const LOCAL: &'static str = "local";

    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        let reason = if id.is_empty() {
            Some("must not be empty")
        } else if !id.bytes().all(|b| b.is_ascii_graphic()) {
            Some("must be printable ASCII without whitespace")
        } else if id.contains('-') {
            Some("must not contain '-'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(TypeError::InvalidNamespaceId { id, reason }),
            None => Ok(Self(id)),
        }
    }

    /// The persistent id of the local namespace.
    pub fn local() -> Self {
        Self(Self::LOCAL.to_string())
    }

    /// A fresh random id (UUID v7 in simple hex form, no dashes).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn is_local(&self) -> bool {
        self.0 == Self::LOCAL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersistentNamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialized origin (`scheme://host[:port]`) owning one area per namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin(String);

impl Origin {
    pub fn new(origin: impl Into<String>) -> Result<Self, TypeError> {
        let origin = origin.into();
        if origin.is_empty() {
            return Err(TypeError::InvalidOrigin {
                origin,
                reason: "must not be empty",
            });
        }
        if origin.chars().any(char::is_control) {
            return Err(TypeError::InvalidOrigin {
                origin,
                reason: "must not contain control characters",
            });
        }
        Ok(Self(origin))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a shared map. Map ids are allocated from one monotonically
/// increasing counter and never reused while a map with that id may be alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapId(u64);

impl MapId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The id following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map:{}", self.0)
    }
}
