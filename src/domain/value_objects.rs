//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};

/// Per-region monotonic counter identifying the durability order of edits.
///
/// `0` means "nothing written yet"; the first durable edit of a region is `1`.
pub type SequenceId = u64;

/// Name of the catalog table that maps row-key ranges to serving locations.
pub const CATALOG_TABLE: &str = "catalog:meta";

/// Delimiter between the table name and the rest of a catalog row key.
pub const ROW_DELIMITER: u8 = b',';

/// Name of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The catalog table.
    pub fn catalog() -> Self {
        Self(CATALOG_TABLE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_catalog(&self) -> bool {
        self.0 == CATALOG_TABLE
    }

    /// Prefix shared by every catalog row describing a region of this table.
    ///
    /// Catalog rows are keyed `table,start_key,region_id`, so the prefix is
    /// the table name followed by the delimiter.
    pub fn row_prefix(&self) -> Vec<u8> {
        let mut prefix = self.0.as_bytes().to_vec();
        prefix.push(ROW_DELIMITER);
        prefix
    }

    /// Exclusive upper bound for a scan over [`row_prefix`](Self::row_prefix).
    pub fn row_prefix_end(&self) -> Vec<u8> {
        let mut end = self.0.as_bytes().to_vec();
        end.push(ROW_DELIMITER + 1);
        end
    }

    /// Whether a catalog row key belongs to this table.
    pub fn owns_row(&self, row: &[u8]) -> bool {
        row.starts_with(&self.row_prefix())
    }
}

impl From<&str> for TableName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TableName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serving location of a region replica (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerName {
    pub host: String,
    pub port: u16,
}

impl ServerName {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string.
    ///
    /// Returns None if the port is missing or not a number.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self::new(host, port))
    }
}

impl std::fmt::Display for ServerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordinal of a replica within a region's replica set.
///
/// Ordinal 0 is the primary; ordinals 1..N-1 are read-only secondaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub u16);

impl ReplicaId {
    pub const PRIMARY: ReplicaId = ReplicaId(0);

    pub fn is_primary(&self) -> bool {
        self.0 == 0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the read router picks a catalog replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReadMode {
    /// Always read the primary (ordinal 0).
    #[default]
    PrimaryOnly,
    /// Spread reads across every replica, primary included.
    LoadBalance,
}

impl ReadMode {
    /// Parse a read mode from a string.
    ///
    /// # Examples
    /// ```
    /// use meta_replica::domain::value_objects::ReadMode;
    ///
    /// assert_eq!(ReadMode::from_str("LoadBalance"), ReadMode::LoadBalance);
    /// assert_eq!(ReadMode::from_str("whatever"), ReadMode::PrimaryOnly); // fallback
    /// ```
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "loadbalance" => Self::LoadBalance,
            _ => Self::PrimaryOnly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryOnly => "PrimaryOnly",
            Self::LoadBalance => "LoadBalance",
        }
    }
}

impl std::fmt::Display for ReadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_row_prefix() {
        let table = TableName::new("users");
        assert_eq!(table.row_prefix(), b"users,".to_vec());
        assert!(table.owns_row(b"users,row1,1"));
        assert!(!table.owns_row(b"users2,row1,1"));
        assert!(!table.owns_row(b"user"));
    }

    #[test]
    fn test_table_prefix_end_bounds_prefix() {
        let table = TableName::new("t1");
        let start = table.row_prefix();
        let end = table.row_prefix_end();
        assert!(start < end);
        assert!(b"t1,zzzz".to_vec() < end);
        assert!(b"t1-".to_vec() >= end);
    }

    #[test]
    fn test_catalog_table() {
        assert!(TableName::catalog().is_catalog());
        assert!(!TableName::new("users").is_catalog());
    }

    #[test]
    fn test_server_name_parse() {
        let s = ServerName::parse("rs1.local:16020").unwrap();
        assert_eq!(s.host, "rs1.local");
        assert_eq!(s.port, 16020);
        assert_eq!(s.to_string(), "rs1.local:16020");
    }

    #[test]
    fn test_server_name_parse_invalid() {
        assert!(ServerName::parse("no-port").is_none());
        assert!(ServerName::parse(":16020").is_none());
        assert!(ServerName::parse("host:notaport").is_none());
    }

    #[test]
    fn test_replica_id_primary() {
        assert!(ReplicaId::PRIMARY.is_primary());
        assert!(!ReplicaId(2).is_primary());
        assert_eq!(ReplicaId(2).as_usize(), 2);
    }

    #[test]
    fn test_read_mode_from_str() {
        assert_eq!(ReadMode::from_str("LoadBalance"), ReadMode::LoadBalance);
        assert_eq!(ReadMode::from_str("load_balance"), ReadMode::LoadBalance);
        assert_eq!(ReadMode::from_str("primaryonly"), ReadMode::PrimaryOnly);
        assert_eq!(ReadMode::from_str(""), ReadMode::PrimaryOnly);
    }

    #[test]
    fn test_read_mode_display_roundtrip() {
        for mode in [ReadMode::PrimaryOnly, ReadMode::LoadBalance] {
            assert_eq!(ReadMode::from_str(&mode.to_string()), mode);
        }
    }
}
