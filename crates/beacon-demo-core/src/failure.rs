//! Crash and recovery injection

use crate::cluster::ClusterLifecycle;
use crate::node::{find_node, NodeHandle};
use crate::types::NodeIndex;
use crate::{Error, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Pings of a restarted node before giving up
pub const RESTART_ATTEMPTS: u32 = 9;

/// Stops and restarts subsets of a roster
#[derive(Clone)]
pub struct FailureInjector {
    lifecycle: ClusterLifecycle,
}

impl FailureInjector {
    /// Create an injector acting through a lifecycle manager
    pub fn new(lifecycle: ClusterLifecycle) -> Self {
        Self { lifecycle }
    }

    /// Stop the nodes of `roster` with the given indices; each node is
    /// stopped at most once. Returns the indices actually stopped.
    pub async fn stop_subset(&self, roster: &[NodeHandle], ids: &[NodeIndex]) -> Vec<NodeIndex> {
        let mut stopped = Vec::new();
        for &index in ids {
            if stopped.contains(&index) {
                continue;
            }
            match find_node(roster, index) {
                Some(node) => {
                    info!(index, addr = node.private_addr(), "Stopping node to simulate a failure");
                    self.lifecycle.stop(std::slice::from_ref(node)).await;
                    stopped.push(index);
                }
                None => warn!(index, "No such node to stop"),
            }
        }
        stopped
    }

    /// Restart previously stopped nodes on their existing state and wait for
    /// each of them to answer a ping, backing off `trial^2` seconds
    pub async fn start_subset(&self, roster: &[NodeHandle], ids: &[NodeIndex]) -> Result<()> {
        for &index in ids {
            let node = find_node(roster, index).ok_or(Error::UnknownNode(index))?;
            info!(index, addr = node.private_addr(), "Attempting to start node again");
            node.start(&self.lifecycle.restart()).await?;
            self.await_restart(node).await?;
        }
        Ok(())
    }

    async fn await_restart(&self, node: &NodeHandle) -> Result<()> {
        for trial in 1..=RESTART_ATTEMPTS {
            if self.lifecycle.ping(node).await {
                info!(index = node.index(), trial, "Node started correctly");
                return Ok(());
            }
            let backoff = Duration::from_secs(u64::from(trial * trial));
            warn!(index = node.index(), trial, ?backoff, "Node not answering yet");
            tokio::time::sleep(backoff).await;
        }
        Err(Error::RestartFailed {
            index: node.index(),
            attempts: RESTART_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DemoConfig;
    use crate::node::MemoryNetwork;
    use crate::schedule::MonotonicClock;
    use std::sync::Arc;

    async fn setup(dir: &std::path::Path) -> (MemoryNetwork, FailureInjector, Vec<NodeHandle>) {
        let network = MemoryNetwork::new(Arc::new(MonotonicClock::new()));
        let config = DemoConfig::new(3, 2, Duration::from_secs(2), dir.to_path_buf()).unwrap();
        std::fs::create_dir_all(config.cert_dir()).unwrap();
        let lifecycle = ClusterLifecycle::new(Arc::new(network.clone()), Arc::new(config));
        let (nodes, _) = lifecycle.create_nodes(3, 1).await.unwrap();
        lifecycle.start(&nodes, &lifecycle.fresh_start()).await.unwrap();
        (network, FailureInjector::new(lifecycle), nodes)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_restores_ping() {
        let dir = tempfile::tempdir().unwrap();
        let (network, injector, nodes) = setup(dir.path()).await;

        let stopped = injector.stop_subset(&nodes, &[2, 3, 2, 9]).await;
        assert_eq!(stopped, vec![2, 3]);
        assert!(!network.is_running(2));
        assert!(!network.is_running(3));
        assert!(network.is_running(1));

        network.delay_ping(2, 2);
        injector.start_subset(&nodes, &[2, 3]).await.unwrap();
        for node in &nodes {
            assert!(node.ping().await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let (network, injector, nodes) = setup(dir.path()).await;
        injector.stop_subset(&nodes, &[1]).await;
        network.delay_ping(1, u32::MAX);

        let start = tokio::time::Instant::now();
        let err = injector.start_subset(&nodes, &[1]).await.unwrap_err();

        assert!(matches!(err, Error::RestartFailed { index: 1, attempts: RESTART_ATTEMPTS }));
        // 1 + 4 + ... + 81 seconds of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(285));
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let dir = tempfile::tempdir().unwrap();
        let (_network, injector, nodes) = setup(dir.path()).await;
        let err = injector.start_subset(&nodes, &[7]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownNode(7)));
    }
}
