//! Shard and tablet identities

use crate::error::{TopoError, TopoResult};
use crate::key_range::KeyRange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identity of a tablet: the cell it lives in plus a numeric id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

impl FromStr for TabletAlias {
    type Err = TopoError;

    fn from_str(s: &str) -> TopoResult<Self> {
        let (cell, uid) = s
            .rsplit_once('-')
            .ok_or_else(|| TopoError::InvalidTabletAlias(s.to_string()))?;
        let uid = uid
            .parse::<u32>()
            .map_err(|_| TopoError::InvalidTabletAlias(s.to_string()))?;
        if cell.is_empty() {
            return Err(TopoError::InvalidTabletAlias(s.to_string()));
        }
        Ok(Self::new(cell, uid))
    }
}

/// Serving role of a tablet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TabletType {
    #[default]
    Primary,
    Replica,
    Rdonly,
}

/// A single storage node serving one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub alias: TabletAlias,
    pub hostname: String,
    pub keyspace: String,
    pub shard: String,
    #[serde(default)]
    pub tablet_type: TabletType,
    /// Explicit database name, overriding the `vt_<keyspace>` convention
    #[serde(default)]
    pub db_name_override: Option<String>,
}

impl Tablet {
    pub fn new(alias: TabletAlias, keyspace: impl Into<String>, shard: impl Into<String>) -> Self {
        let hostname = format!("tablet-{}", alias.uid);
        Self {
            alias,
            hostname,
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type: TabletType::Primary,
            db_name_override: None,
        }
    }

    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name_override = Some(db_name.into());
        self
    }

    pub fn with_type(mut self, tablet_type: TabletType) -> Self {
        self.tablet_type = tablet_type;
        self
    }

    /// Name of the database this tablet serves
    pub fn db_name(&self) -> String {
        match &self.db_name_override {
            Some(name) => name.clone(),
            None => format!("vt_{}", self.keyspace),
        }
    }
}

/// Point-in-time view of a shard record
///
/// The primary may change after this snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub keyspace: String,
    pub name: String,
    pub key_range: KeyRange,
    pub primary_alias: Option<TabletAlias>,
    #[serde(default = "default_true")]
    pub is_primary_serving: bool,
}

fn default_true() -> bool {
    true
}

impl ShardInfo {
    /// Build a shard record, deriving the key range from the shard name
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> TopoResult<Self> {
        let name = name.into();
        let key_range = KeyRange::from_shard_name(&name)?;
        Ok(Self {
            keyspace: keyspace.into(),
            name,
            key_range,
            primary_alias: None,
            is_primary_serving: true,
        })
    }

    pub fn with_primary(mut self, alias: TabletAlias) -> Self {
        self.primary_alias = Some(alias);
        self
    }

    pub fn with_serving(mut self, serving: bool) -> Self {
        self.is_primary_serving = serving;
        self
    }

    /// `keyspace/shard`, as used in operator-facing messages
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.keyspace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_display_and_parse() {
        let alias = TabletAlias::new("zone1", 100);
        assert_eq!(alias.to_string(), "zone1-0000000100");
        assert_eq!("zone1-0000000100".parse::<TabletAlias>().unwrap(), alias);
        assert!("zone1".parse::<TabletAlias>().is_err());
        assert!("-12".parse::<TabletAlias>().is_err());
    }

    #[test]
    fn test_db_name() {
        let tablet = Tablet::new(TabletAlias::new("zone1", 1), "sales", "-80");
        assert_eq!(tablet.db_name(), "vt_sales");
        assert_eq!(tablet.with_db_name("salesdb").db_name(), "salesdb");
    }

    #[test]
    fn test_shard_info_key_range() {
        let shard = ShardInfo::new("sales", "80-").unwrap();
        assert_eq!(shard.key_range.to_string(), "80-");
        assert_eq!(shard.qualified_name(), "sales/80-");
        assert!(shard.primary_alias.is_none());
    }
}
