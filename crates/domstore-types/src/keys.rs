//! Physical key layout.
//!
//! Every storage area of every namespace lives inside one ordered key-value
//! database. Area data is stored under a per-map prefix, and the namespace
//! registry persists one record per `(persistent namespace id, origin)` pair
//! pointing at the map that holds the area's data. Numbers are encoded as
//! ASCII decimal.

use crate::error::TypeError;
use crate::ids::{MapId, Origin, PersistentNamespaceId};

/// Key holding the schema version.
pub const VERSION_KEY: &[u8] = b"VERSION";

/// Key holding the next map id to allocate.
pub const NEXT_MAP_ID_KEY: &[u8] = b"next-map-id";

/// Prefix shared by all namespace records.
pub const NAMESPACE_PREFIX: &[u8] = b"namespace-";

/// Prefix shared by all map data.
pub const MAP_PREFIX: &[u8] = b"map-";

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u64 = 1;

/// Oldest schema version this build can read.
pub const MIN_SCHEMA_VERSION: u64 = 1;

/// Prefix under which all keys of `map` are stored: `map-<id>-`.
///
/// The trailing separator keeps `map-1-` from being a prefix of `map-12-`.
pub fn map_prefix(map: MapId) -> Vec<u8> {
    let mut prefix = MAP_PREFIX.to_vec();
    prefix.extend_from_slice(map.get().to_string().as_bytes());
    prefix.push(b'-');
    prefix
}

/// Physical key for `logical` inside the map with the given prefix.
pub fn map_key(prefix: &[u8], logical: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + logical.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(logical);
    key
}

/// Record key for an area: `namespace-<persistent id>-<origin>`.
pub fn namespace_key(namespace: &PersistentNamespaceId, origin: &Origin) -> Vec<u8> {
    let mut key = NAMESPACE_PREFIX.to_vec();
    key.extend_from_slice(namespace.as_str().as_bytes());
    key.push(b'-');
    key.extend_from_slice(origin.as_str().as_bytes());
    key
}

/// Split a namespace record key back into its persistent id and origin.
///
/// Persistent ids never contain `-`, so the id ends at the first `-` after
/// the prefix and everything after it is the origin.
pub fn parse_namespace_key(key: &[u8]) -> Result<(PersistentNamespaceId, Origin), TypeError> {
    let malformed = || TypeError::MalformedKey(String::from_utf8_lossy(key).into_owned());

    let rest = key.strip_prefix(NAMESPACE_PREFIX).ok_or_else(malformed)?;
    let rest = std::str::from_utf8(rest).map_err(|_| malformed())?;
    let (namespace, origin) = rest.split_once('-').ok_or_else(malformed)?;

    let namespace = PersistentNamespaceId::new(namespace).map_err(|_| malformed())?;
    let origin = Origin::new(origin).map_err(|_| malformed())?;
    Ok((namespace, origin))
}

/// ASCII decimal encoding used for the version, map ids and `next-map-id`.
pub fn encode_number(n: u64) -> Vec<u8> {
    n.to_string().into_bytes()
}

/// Parse an ASCII decimal value written by [`encode_number`].
pub fn parse_number(bytes: &[u8]) -> Result<u64, TypeError> {
    let invalid = || TypeError::InvalidNumber(String::from_utf8_lossy(bytes).into_owned());
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    std::str::from_utf8(bytes)
        .map_err(|_| invalid())?
        .parse()
        .map_err(|_| invalid())
}

/// Parse a map id stored as a namespace record value.
pub fn parse_map_id(bytes: &[u8]) -> Result<MapId, TypeError> {
    parse_number(bytes).map(MapId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ns(s: &str) -> PersistentNamespaceId {
        PersistentNamespaceId::new(s).unwrap()
    }

    fn origin(s: &str) -> Origin {
        Origin::new(s).unwrap()
    }

    #[test]
    fn map_prefix_layout() {
        assert_eq!(map_prefix(MapId::new(0)), b"map-0-".to_vec());
        assert_eq!(map_prefix(MapId::new(12)), b"map-12-".to_vec());
        assert!(!map_prefix(MapId::new(12)).starts_with(&map_prefix(MapId::new(1))));
        assert_eq!(map_key(b"map-3-", b"k"), b"map-3-k".to_vec());
    }

    #[test]
    fn namespace_key_layout() {
        let key = namespace_key(&ns("ns_a"), &origin("https://x.test"));
        assert_eq!(key, b"namespace-ns_a-https://x.test".to_vec());
    }

    #[test]
    fn parse_key_with_dashes_in_origin() {
        let key = namespace_key(&ns("ns_a"), &origin("https://my-site.test:8080"));
        let (id, o) = parse_namespace_key(&key).unwrap();
        assert_eq!(id, ns("ns_a"));
        assert_eq!(o, origin("https://my-site.test:8080"));
    }

    #[test]
    fn parse_key_with_dashed_scheme() {
        let key = namespace_key(&ns("ns"), &origin("chrome-extension://abc"));
        assert_eq!(key, b"namespace-ns-chrome-extension://abc".to_vec());
        let (id, o) = parse_namespace_key(&key).unwrap();
        assert_eq!(id, ns("ns"));
        assert_eq!(o, origin("chrome-extension://abc"));
    }

    #[test]
    fn parse_key_without_scheme() {
        let (id, o) = parse_namespace_key(b"namespace-ns_a-null").unwrap();
        assert_eq!(id, ns("ns_a"));
        assert_eq!(o, origin("null"));
        let (id, o) = parse_namespace_key(b"namespace-a-b-c").unwrap();
        assert_eq!(id, ns("a"));
        assert_eq!(o, origin("b-c"));
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!(parse_namespace_key(b"map-1-x").is_err());
        assert!(parse_namespace_key(b"namespace-nodash").is_err());
        assert!(parse_namespace_key(b"namespace--https://x.test").is_err());
        assert!(parse_namespace_key(b"namespace-a-").is_err());
        assert!(parse_namespace_key(b"namespace-a-\xff").is_err());
    }

    #[test]
    fn numbers() {
        assert_eq!(encode_number(42), b"42".to_vec());
        assert_eq!(parse_number(b"42").unwrap(), 42);
        assert_eq!(parse_map_id(b"7").unwrap(), MapId::new(7));
        assert!(parse_number(b"").is_err());
        assert!(parse_number(b"-1").is_err());
        assert!(parse_number(b"+1").is_err());
        assert!(parse_number(b"1x").is_err());
        assert!(parse_number(b"99999999999999999999999").is_err());
    }

    proptest! {
        #[test]
        fn namespace_keys_parse_back(
            id in "[a-z0-9_.]{1,12}",
            host in "[a-z0-9]{1,8}(-[a-z0-9]{1,8}){0,2}",
            scheme in "[a-z]{1,6}(-[a-z]{1,6}){0,2}(\\+[a-z]{1,3})?",
            with_scheme in any::<bool>(),
        ) {
            let namespace = ns(&id);
            let o = if with_scheme {
                origin(&format!("{scheme}://{host}.test"))
            } else {
                origin(&host)
            };
            let parsed = parse_namespace_key(&namespace_key(&namespace, &o)).unwrap();
            prop_assert_eq!(parsed, (namespace, o));
        }

        #[test]
        fn numbers_parse_back(n in any::<u64>()) {
            prop_assert_eq!(parse_number(&encode_number(n)).unwrap(), n);
        }
    }
}
