//! # Beacon Demo Core
//!
//! Orchestration layer for driving a cluster of threshold randomness beacon
//! nodes from the outside.
//!
//! This crate provides the building blocks for:
//! - Creating, starting, pinging and stopping a roster of node agents
//! - Running a distributed key generation (DKG) round or a resharing round
//!   across the roster with a leader/follower fan-out
//! - Waiting for the cluster to converge and for the beacon schedule to reach
//!   a given round
//! - Verifying that every node serves the same beacon through both its
//!   control interface and its public HTTP API
//! - Stopping and restarting subsets of nodes to validate liveness
//!
//! ## Example
//!
//! ```rust,ignore
//! use beacon_demo_core::{DemoConfig, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(config, factory, public_api, clock)?;
//! let cluster = orchestrator.setup_cluster().await?;
//! orchestrator.start_nodes(&cluster.nodes, &[]).await?;
//! let epoch = orchestrator.run_dkg(&cluster, timeout).await?;
//! orchestrator.wait_genesis(&epoch).await;
//! orchestrator.check_beacon(&epoch, &[]).await?;
//! ```

pub mod cluster;
pub mod config;
pub mod consistency;
pub mod convergence;
pub mod coordinator;
pub mod error;
pub mod failure;
pub mod node;
pub mod orchestrator;
pub mod schedule;
pub mod types;

pub use config::{DemoConfig, StorageConfig, StorageEngine};
pub use error::{Error, Result};
pub use node::{NodeAgent, NodeFactory, NodeHandle, PublicApi, Role, Roster, StartOptions};
pub use orchestrator::{Cluster, Epoch, Orchestrator, ResharePlan};
pub use schedule::{Clock, MonotonicClock, ScheduleClock, SystemClock};
pub use types::{BeaconValue, Group, GroupMember, NodeIdentity, NodeIndex, ReshareSpec};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of nodes in a fresh cluster
pub const DEFAULT_NODES: usize = 3;

/// Default threshold for a fresh cluster
pub const DEFAULT_THRESHOLD: usize = 2;
