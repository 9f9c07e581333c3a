//! Cluster configuration

use crate::types::NodeIndex;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Beacon id used when none is configured
pub const DEFAULT_BEACON_ID: &str = "default";

/// Scheme id handed to nodes when none is configured
pub const DEFAULT_SCHEME: &str = "pedersen-bls-chained";

/// Seconds between the end of a round and the first beacon of the new group
pub const DEFAULT_BEACON_OFFSET: u64 = 2;

/// Storage backend a node persists its chain to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    /// Embedded key-value store
    Bolt,
    /// External PostgreSQL database
    Postgres,
    /// In-memory buffer
    Memdb,
}

impl StorageEngine {
    /// Name passed to the node binary
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageEngine::Bolt => "bolt",
            StorageEngine::Postgres => "postgres",
            StorageEngine::Memdb => "memdb",
        }
    }
}

impl FromStr for StorageEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bolt" | "boltdb" => Ok(StorageEngine::Bolt),
            "postgres" | "postgresql" => Ok(StorageEngine::Postgres),
            "memdb" | "memory" => Ok(StorageEngine::Memdb),
            other => Err(Error::InvalidConfig(format!("unknown storage engine: {other}"))),
        }
    }
}

/// Storage configuration handed to nodes on first start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage engine
    pub engine: StorageEngine,
    /// Connection string template for PostgreSQL; `{index}` is replaced by
    /// the node index so every node gets its own database
    pub pg_dsn: Option<String>,
    /// Buffer size for the in-memory engine
    pub memdb_size: usize,
}

impl StorageConfig {
    /// Connection string for a given node
    pub fn dsn_for(&self, index: NodeIndex) -> Option<String> {
        self.pg_dsn
            .as_ref()
            .map(|dsn| dsn.replace("{index}", &index.to_string()))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: StorageEngine::Bolt,
            pg_dsn: None,
            memdb_size: 2000,
        }
    }
}

/// Configuration of a demo cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Number of nodes in the initial group
    pub nodes: usize,
    /// Threshold of the initial group
    pub threshold: usize,
    /// Beacon period
    pub period: Duration,
    /// Working directory for node folders, certificates and group files
    pub base_path: PathBuf,
    /// Serve the public API over TLS
    pub tls: bool,
    /// Cross-check beacons through the public HTTP API
    pub with_http: bool,
    /// Node binary; `None` runs the in-process simulated network
    pub binary: Option<PathBuf>,
    /// Beacon identifier
    pub beacon_id: String,
    /// Cryptographic scheme identifier handed to the node binary
    pub scheme: String,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Seconds after a round completes before the beacon starts
    pub beacon_offset: u64,
    /// File receiving one `nodes,duration,key_check_duration` line per DKG
    pub dkg_log: PathBuf,
}

impl DemoConfig {
    /// Create a configuration with defaults for everything but the group shape
    pub fn new(nodes: usize, threshold: usize, period: Duration, base_path: PathBuf) -> Result<Self> {
        let config = Self {
            nodes,
            threshold,
            period,
            base_path,
            tls: false,
            with_http: true,
            binary: None,
            beacon_id: DEFAULT_BEACON_ID.to_string(),
            scheme: DEFAULT_SCHEME.to_string(),
            storage: StorageConfig::default(),
            beacon_offset: DEFAULT_BEACON_OFFSET,
            dkg_log: PathBuf::from("./test.log"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the group shape and timing
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            return Err(Error::InvalidConfig("cluster needs at least one node".into()));
        }
        if self.threshold == 0 || self.threshold > self.nodes {
            return Err(Error::InvalidConfig(format!(
                "threshold {} must be between 1 and {}",
                self.threshold, self.nodes
            )));
        }
        if self.period < Duration::from_secs(1) || self.period.subsec_nanos() != 0 {
            return Err(Error::InvalidConfig(format!(
                "period {:?} must be a whole number of seconds",
                self.period
            )));
        }
        if self.storage.engine == StorageEngine::Postgres && self.storage.pg_dsn.is_none() {
            return Err(Error::InvalidConfig("postgres storage requires a DSN".into()));
        }
        Ok(())
    }

    /// Beacon id with the empty id mapped to the default one
    pub fn canonical_beacon_id(&self) -> &str {
        if self.beacon_id.is_empty() {
            DEFAULT_BEACON_ID
        } else {
            &self.beacon_id
        }
    }

    /// Directory collecting every node's TLS certificate
    pub fn cert_dir(&self) -> PathBuf {
        self.base_path.join("certs")
    }

    /// Group descriptor of the initial DKG
    pub fn group_path(&self) -> PathBuf {
        self.base_path.join("group.json")
    }

    /// Group descriptor produced by resharing
    pub fn new_group_path(&self) -> PathBuf {
        self.base_path.join("group2.json")
    }

    /// Public key artifact of a node
    pub fn public_path(&self, index: NodeIndex) -> PathBuf {
        self.base_path.join(format!("public-{index}.json"))
    }

    /// Certificate artifact of a node
    pub fn cert_path(&self, index: NodeIndex) -> PathBuf {
        self.cert_dir().join(format!("cert-{index}"))
    }

    /// Working folder of a node
    pub fn node_folder(&self, index: NodeIndex) -> PathBuf {
        self.base_path.join(format!("node-{index}"))
    }
}

/// Parse durations such as `500ms`, `2s`, `1m` or `1h`. A bare number is
/// read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid duration: {s:?}")))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(Error::InvalidConfig(format!("invalid duration unit in {s:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10 days").is_err());
    }

    #[test]
    fn test_config_validation() {
        let base = PathBuf::from("/tmp/demo");
        assert!(DemoConfig::new(3, 2, Duration::from_secs(2), base.clone()).is_ok());
        assert!(DemoConfig::new(3, 4, Duration::from_secs(2), base.clone()).is_err());
        assert!(DemoConfig::new(3, 0, Duration::from_secs(2), base.clone()).is_err());
        assert!(DemoConfig::new(0, 0, Duration::from_secs(2), base.clone()).is_err());
        assert!(DemoConfig::new(3, 2, Duration::from_millis(1500), base).is_err());
    }

    #[test]
    fn test_derived_paths() {
        let mut config =
            DemoConfig::new(3, 2, Duration::from_secs(2), PathBuf::from("/tmp/demo")).unwrap();
        assert_eq!(config.group_path(), PathBuf::from("/tmp/demo/group.json"));
        assert_eq!(config.public_path(4), PathBuf::from("/tmp/demo/public-4.json"));
        assert_eq!(config.cert_path(2), PathBuf::from("/tmp/demo/certs/cert-2"));

        config.beacon_id.clear();
        assert_eq!(config.canonical_beacon_id(), DEFAULT_BEACON_ID);
    }

    #[test]
    fn test_storage_engine() {
        assert_eq!("postgres".parse::<StorageEngine>().unwrap(), StorageEngine::Postgres);
        assert!("sqlite".parse::<StorageEngine>().is_err());

        let storage = StorageConfig {
            engine: StorageEngine::Postgres,
            pg_dsn: Some("postgres://demo@localhost/node{index}".into()),
            memdb_size: 0,
        };
        assert_eq!(
            storage.dsn_for(3).as_deref(),
            Some("postgres://demo@localhost/node3")
        );
    }
}
