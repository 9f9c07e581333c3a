//! Cluster lifecycle: creating, starting, pinging and stopping node agents

use crate::config::DemoConfig;
use crate::convergence::wait_until_all_within;
use crate::node::{NodeFactory, NodeHandle, Roster, StartOptions};
use crate::types::NodeIndex;
use crate::{Error, Result};
use futures_util::future::join_all;
use rand::seq::SliceRandom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Deadline for every started node to answer a ping
pub const STARTUP_DEADLINE: Duration = Duration::from_secs(30);

/// Interval between startup ping rounds
pub const STARTUP_POLL: Duration = Duration::from_secs(2);

/// Creates, starts and stops the nodes of a cluster
#[derive(Clone)]
pub struct ClusterLifecycle {
    factory: Arc<dyn NodeFactory>,
    config: Arc<DemoConfig>,
}

impl ClusterLifecycle {
    /// Create a lifecycle manager over a node factory
    pub fn new(factory: Arc<dyn NodeFactory>, config: Arc<DemoConfig>) -> Self {
        Self { factory, config }
    }

    /// Node factory
    pub fn factory(&self) -> &Arc<dyn NodeFactory> {
        &self.factory
    }

    /// Materialize `n` nodes with indices starting at `offset`, writing each
    /// node's certificate and public key artifacts
    pub async fn create_nodes(&self, n: usize, offset: NodeIndex) -> Result<(Roster, Vec<PathBuf>)> {
        let mut nodes: Roster = Vec::with_capacity(n);
        for index in offset..offset + n {
            let node = self.factory.create(index).await?;
            node.write_certificate(&self.config.cert_path(index)).await?;
            info!(
                index,
                addr = node.private_addr(),
                ctrl = node.ctrl_addr(),
                base = %self.config.base_path.display(),
                "Created node"
            );
            nodes.push(node);
        }

        let mut paths = Vec::with_capacity(n);
        for node in &nodes {
            let path = self.config.public_path(node.index());
            node.write_public(&path).await?;
            paths.push(path);
        }

        Ok((nodes, paths))
    }

    /// Options for a first start, provisioning storage
    pub fn fresh_start(&self) -> StartOptions {
        StartOptions {
            cert_dir: self.config.cert_dir(),
            storage: Some(self.config.storage.clone()),
        }
    }

    /// Options for a restart, reconnecting to existing state
    pub fn restart(&self) -> StartOptions {
        StartOptions {
            cert_dir: self.config.cert_dir(),
            storage: None,
        }
    }

    /// Launch every node, then block until all of them answer a ping.
    /// Missing the deadline is fatal.
    pub async fn start(&self, nodes: &[NodeHandle], options: &StartOptions) -> Result<()> {
        info!(count = nodes.len(), "Starting nodes");
        for node in nodes {
            info!(index = node.index(), addr = node.private_addr(), "Starting node");
            node.start(options).await.map_err(|e| match e {
                Error::NodeStart { .. } => e,
                other => Error::NodeStart {
                    index: node.index(),
                    reason: other.to_string(),
                },
            })?;
        }

        let pinged = wait_until_all_within(
            nodes,
            |node| node.ping(),
            STARTUP_POLL,
            STARTUP_DEADLINE,
            "startup ping",
        )
        .await;

        if pinged.is_err() {
            let mut unreachable = Vec::new();
            for node in nodes {
                if !node.ping().await {
                    unreachable.push(node.index());
                }
            }
            warn!(?unreachable, "Cannot ping all nodes, shutting down");
            return Err(Error::StartupTimeout {
                waited: STARTUP_DEADLINE,
                unreachable,
            });
        }

        info!(count = nodes.len(), "All nodes answer ping");
        Ok(())
    }

    /// Send a stop signal to each node, one after the other, without waiting
    /// for confirmation
    pub async fn stop(&self, nodes: &[NodeHandle]) {
        for node in nodes {
            info!(index = node.index(), addr = node.private_addr(), "Stopping node");
            if let Err(e) = node.stop().await {
                warn!(index = node.index(), error = %e, "Stop signal failed");
            }
        }
    }

    /// Send a stop signal to every node concurrently
    pub async fn stop_concurrently(&self, nodes: &[NodeHandle]) {
        let results = join_all(nodes.iter().map(|node| async move {
            (node.index(), node.stop().await)
        }))
        .await;

        for (index, result) in results {
            match result {
                Ok(()) => info!(index, "Sent stop signal"),
                Err(e) => warn!(index, error = %e, "Stop signal failed"),
            }
        }
    }

    /// Liveness probe
    pub async fn ping(&self, node: &NodeHandle) -> bool {
        node.ping().await
    }
}

/// Nodes of `list` whose index is not excluded, in random order
pub fn filter_nodes(list: &[NodeHandle], exclude: &[NodeIndex]) -> Roster {
    let mut filtered: Roster = list
        .iter()
        .filter(|n| !exclude.contains(&n.index()))
        .cloned()
        .collect();
    filtered.shuffle(&mut rand::thread_rng());
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MemoryNetwork;
    use crate::schedule::MonotonicClock;

    fn setup(dir: &std::path::Path) -> (MemoryNetwork, ClusterLifecycle) {
        let network = MemoryNetwork::new(Arc::new(MonotonicClock::new()));
        let config = DemoConfig::new(3, 2, Duration::from_secs(2), dir.to_path_buf()).unwrap();
        std::fs::create_dir_all(config.cert_dir()).unwrap();
        let lifecycle = ClusterLifecycle::new(Arc::new(network.clone()), Arc::new(config));
        (network, lifecycle)
    }

    #[tokio::test]
    async fn test_create_nodes_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (_network, lifecycle) = setup(dir.path());

        let (nodes, paths) = lifecycle.create_nodes(3, 4).await.unwrap();

        let indices: Vec<_> = nodes.iter().map(|n| n.index()).collect();
        assert_eq!(indices, vec![4, 5, 6]);
        assert_eq!(paths.len(), 3);
        for (node, path) in nodes.iter().zip(&paths) {
            assert!(path.exists());
            assert!(path.ends_with(format!("public-{}.json", node.index())));
            assert!(dir.path().join(format!("certs/cert-{}", node.index())).exists());
        }
    }

    #[tokio::test]
    async fn test_create_nodes_fails_without_cert_dir() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new(Arc::new(MonotonicClock::new()));
        let config = DemoConfig::new(1, 1, Duration::from_secs(2), dir.path().join("missing"))
            .unwrap();
        let lifecycle = ClusterLifecycle::new(Arc::new(network), Arc::new(config));

        let err = lifecycle.create_nodes(1, 1).await.err().unwrap();
        assert!(matches!(err, Error::Artifact { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_for_slow_node() {
        let dir = tempfile::tempdir().unwrap();
        let (network, lifecycle) = setup(dir.path());
        let (nodes, _) = lifecycle.create_nodes(3, 1).await.unwrap();
        network.delay_ping(2, 3);
        let start = tokio::time::Instant::now();

        lifecycle.start(&nodes, &lifecycle.fresh_start()).await.unwrap();

        // pings every 2s from 2s on; node 2 answers on the fourth tick
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(8) && elapsed < Duration::from_secs(9));
        for node in &nodes {
            assert!(lifecycle.ping(node).await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_deadline_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (network, lifecycle) = setup(dir.path());
        let (nodes, _) = lifecycle.create_nodes(3, 1).await.unwrap();
        network.delay_ping(3, u32::MAX);

        let err = lifecycle
            .start(&nodes, &lifecycle.fresh_start())
            .await
            .unwrap_err();
        match err {
            Error::StartupTimeout { unreachable, .. } => assert_eq!(unreachable, vec![3]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stop_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let (network, lifecycle) = setup(dir.path());
        let (nodes, _) = lifecycle.create_nodes(3, 1).await.unwrap();
        for node in &nodes {
            node.start(&lifecycle.fresh_start()).await.unwrap();
        }

        let filtered = filter_nodes(&nodes, &[2]);
        let mut indices: Vec<_> = filtered.iter().map(|n| n.index()).collect();
        indices.sort();
        assert_eq!(indices, vec![1, 3]);

        lifecycle.stop(&filtered).await;
        assert!(!network.is_running(1));
        assert!(network.is_running(2));
        assert!(!network.is_running(3));

        lifecycle.stop_concurrently(&nodes).await;
        assert!(!network.is_running(2));
    }
}
