//! Node agent contract
//!
//! The orchestrator never talks to a node directly; it goes through the
//! capabilities defined here. Implementations drive a node process
//! (see the `beacon-node-client` crate) or the in-process simulated network.

use crate::config::StorageConfig;
use crate::types::{BeaconValue, Group, NodeIdentity, NodeIndex};
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use ::async_trait::async_trait;

/// In-memory simulated network for testing
pub mod memory;

pub use memory::{MemoryNetwork, MemoryNode};

/// Shared handle to a node agent
pub type NodeHandle = Arc<dyn NodeAgent>;

/// Ordered set of node agents; the first element leads protocol rounds
pub type Roster = Vec<NodeHandle>;

/// Part a node plays in a protocol round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Coordinates the round
    Leader,
    /// Joins the round run by the leader at this private address
    Follower { leader: String },
}

impl Role {
    /// Whether this is the leader role
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

/// Options for starting a node process
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Directory holding the certificates of every peer
    pub cert_dir: PathBuf,
    /// Storage to provision; `None` reconnects to the existing on-disk state
    pub storage: Option<StorageConfig>,
}

/// Parameters of an initial DKG round
#[derive(Debug, Clone)]
pub struct DkgParams {
    /// Number of participants
    pub nodes: usize,
    /// Group threshold
    pub threshold: usize,
    /// Beacon period
    pub period: Duration,
    /// Timeout handed to each node's protocol call
    pub timeout: Duration,
    /// Seconds between the end of the round and genesis
    pub beacon_offset: u64,
}

/// Parameters of a resharing round
#[derive(Debug, Clone)]
pub struct ReshareParams {
    /// Number of participants in the new group
    pub nodes: usize,
    /// New group threshold
    pub threshold: usize,
    /// Previous group descriptor, only given to nodes joining the group
    pub old_group: Option<PathBuf>,
    /// Timeout handed to each node's protocol call
    pub timeout: Duration,
    /// Seconds between the end of the round and the transition
    pub beacon_offset: u64,
}

/// Capabilities the orchestrator requires from a node under test
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Identity assigned at creation
    fn identity(&self) -> &NodeIdentity;

    /// Node index
    fn index(&self) -> NodeIndex {
        self.identity().index
    }

    /// Private address, used as the leader address for followers
    fn private_addr(&self) -> &str {
        &self.identity().private_addr
    }

    /// Public HTTP address
    fn public_addr(&self) -> &str {
        &self.identity().public_addr
    }

    /// Control port address
    fn ctrl_addr(&self) -> &str {
        &self.identity().ctrl_addr
    }

    /// Write the node's TLS certificate
    async fn write_certificate(&self, path: &Path) -> Result<()>;

    /// Write the node's public identity key
    async fn write_public(&self, path: &Path) -> Result<()>;

    /// Launch the node
    async fn start(&self, options: &StartOptions) -> Result<()>;

    /// Ask the node to shut down, without waiting for confirmation
    async fn stop(&self) -> Result<()>;

    /// Liveness probe; failing is expected while the node boots
    async fn ping(&self) -> bool;

    /// Take part in the initial DKG. The leader returns once the round it
    /// coordinates completes.
    async fn run_dkg(&self, params: &DkgParams, role: &Role) -> Result<()>;

    /// Take part in a resharing round and return the new group
    async fn run_reshare(&self, params: &ReshareParams, role: &Role) -> Result<Group>;

    /// Whether the node has materialized chain and group metadata
    async fn chain_info(&self) -> bool;

    /// Group the node currently belongs to
    async fn get_group(&self) -> Result<Group>;

    /// Beacon for a round, through the node's control interface, together
    /// with an example command reproducing the query
    async fn get_beacon(&self, group_path: &Path, round: u64) -> Result<(BeaconValue, String)>;

    /// Captured log output of the node
    async fn log_output(&self) -> Result<String>;

    /// Switch the binary used on the next start. Returns `false` when the
    /// agent does not run a binary.
    fn update_binary(&self, _binary: &Path) -> bool {
        false
    }
}

/// Creates node agents with a given index
#[async_trait]
pub trait NodeFactory: Send + Sync {
    /// Provision a new node agent
    async fn create(&self, index: NodeIndex) -> Result<NodeHandle>;

    /// Switch the binary used for agents created afterwards. Returns
    /// `false` when the factory does not run binaries.
    fn update_binary(&self, _binary: &Path) -> bool {
        false
    }
}

/// Query path through a node's public API
#[async_trait]
pub trait PublicApi: Send + Sync {
    /// Example request reproducing the query, for logs
    fn describe(&self, node: &dyn NodeAgent, round: u64) -> String;

    /// Raw response body for a round; an empty body means "try again"
    async fn fetch_round(&self, node: &dyn NodeAgent, round: u64) -> Result<Vec<u8>>;
}

/// Find a node by index
pub fn find_node(roster: &[NodeHandle], index: NodeIndex) -> Option<&NodeHandle> {
    roster.iter().find(|n| n.index() == index)
}
