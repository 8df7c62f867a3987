//! Key ranges
//!
//! A shard owns the contiguous half-open range `[start, end)` of keyspace ids.
//! An empty `start` is unbounded below and an empty `end` is unbounded above,
//! so the default range covers the whole keyspace.
//!
//! Shard names encode their range as `<hex start>-<hex end>`:
//!
//! ```text
//! "-80"   -> [..,   0x80)
//! "80-"   -> [0x80, ..)
//! "40-80" -> [0x40, 0x80)
//! "-"     -> full range
//! "0"     -> full range (unsharded keyspace)
//! ```

use crate::error::{TopoError, TopoResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Half-open range of keyspace ids owned by a shard
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound (empty = unbounded)
    #[serde(with = "hex_bytes", default)]
    pub start: Vec<u8>,
    /// Exclusive upper bound (empty = unbounded)
    #[serde(with = "hex_bytes", default)]
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Range covering every keyspace id
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self { start, end }
    }

    /// Parse the key range encoded in a shard name
    pub fn from_shard_name(name: &str) -> TopoResult<Self> {
        let Some((start, end)) = name.split_once('-') else {
            // Unsharded keyspaces name their single shard without a range.
            return Ok(Self::full());
        };

        let decode = |part: &str| {
            hex::decode(part).map_err(|e| TopoError::InvalidKeyRange {
                input: name.to_string(),
                reason: e.to_string(),
            })
        };

        let range = Self {
            start: decode(start)?,
            end: decode(end)?,
        };

        if !range.end.is_empty() && range.start.cmp(&range.end) != Ordering::Less {
            return Err(TopoError::InvalidKeyRange {
                input: name.to_string(),
                reason: "start must be below end".to_string(),
            });
        }

        Ok(range)
    }

    /// Whether this range covers every keyspace id
    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Whether a keyspace id falls inside this range
    pub fn contains(&self, keyspace_id: &[u8]) -> bool {
        self.start.as_slice() <= keyspace_id
            && (self.end.is_empty() || keyspace_id < self.end.as_slice())
    }

    /// Whether the two ranges share at least one keyspace id
    pub fn intersects(&self, other: &KeyRange) -> bool {
        (self.end.is_empty() || other.start < self.end)
            && (other.end.is_empty() || self.start < other.end)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", hex::encode(&self.start), hex::encode(&self.end))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_shard_names() {
        assert_eq!(KeyRange::from_shard_name("-80").unwrap(), KeyRange::new(vec![], vec![0x80]));
        assert_eq!(KeyRange::from_shard_name("80-").unwrap(), KeyRange::new(vec![0x80], vec![]));
        assert_eq!(
            KeyRange::from_shard_name("40-80").unwrap(),
            KeyRange::new(vec![0x40], vec![0x80])
        );
        assert!(KeyRange::from_shard_name("-").unwrap().is_full());
        assert!(KeyRange::from_shard_name("0").unwrap().is_full());
    }

    #[test]
    fn test_parse_rejects_bad_ranges() {
        assert!(KeyRange::from_shard_name("zz-80").is_err());
        assert!(KeyRange::from_shard_name("80-40").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(KeyRange::from_shard_name("-80").unwrap().to_string(), "-80");
        assert_eq!(KeyRange::from_shard_name("80-").unwrap().to_string(), "80-");
        assert_eq!(KeyRange::full().to_string(), "-");
    }

    #[test]
    fn test_intersects() {
        let low = KeyRange::from_shard_name("-80").unwrap();
        let high = KeyRange::from_shard_name("80-").unwrap();
        let mid = KeyRange::from_shard_name("40-c0").unwrap();

        assert!(!low.intersects(&high));
        assert!(!high.intersects(&low));
        assert!(low.intersects(&mid));
        assert!(high.intersects(&mid));
        assert!(KeyRange::full().intersects(&low));
        assert!(KeyRange::full().intersects(&high));
    }

    #[test]
    fn test_contains() {
        let low = KeyRange::from_shard_name("-80").unwrap();
        assert!(low.contains(&[0x10]));
        assert!(!low.contains(&[0x80]));
        assert!(KeyRange::full().contains(&[0xff, 0xff]));
    }

    #[test]
    fn test_serde_uses_hex() {
        let range = KeyRange::from_shard_name("40-80").unwrap();
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, r#"{"start":"40","end":"80"}"#);
        let back: KeyRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, range);
    }

    proptest! {
        #[test]
        fn test_intersection_is_symmetric(
            a in proptest::collection::vec(any::<u8>(), 0..3),
            b in proptest::collection::vec(any::<u8>(), 0..3),
            c in proptest::collection::vec(any::<u8>(), 0..3),
            d in proptest::collection::vec(any::<u8>(), 0..3),
        ) {
            let left = KeyRange::new(a, b);
            let right = KeyRange::new(c, d);
            prop_assert_eq!(left.intersects(&right), right.intersects(&left));
        }
    }
}
