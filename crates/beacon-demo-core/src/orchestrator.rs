//! Scenario composition root
//!
//! The [`Orchestrator`] sequences the cluster, protocol, schedule and
//! consistency components into named operations. It holds no cluster state
//! itself: every phase takes the snapshots it works on by reference and
//! returns a new one.

use crate::cluster::{filter_nodes, ClusterLifecycle};
use crate::config::DemoConfig;
use crate::consistency::ConsistencyChecker;
use crate::coordinator;
use crate::failure::FailureInjector;
use crate::node::{find_node, DkgParams, NodeFactory, NodeHandle, PublicApi, ReshareParams, Roster};
use crate::schedule::{Clock, ScheduleClock};
use crate::types::{BeaconValue, Group, NodeIndex, ReshareSpec};
use crate::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// A set of created nodes and their public key artifacts
#[derive(Clone)]
pub struct Cluster {
    /// Nodes in creation order
    pub nodes: Roster,
    /// Public key artifact of each node, in the same order
    pub public_paths: Vec<PathBuf>,
}

impl Cluster {
    /// Indices of the nodes
    pub fn indices(&self) -> Vec<NodeIndex> {
        self.nodes.iter().map(|n| n.index()).collect()
    }

    /// Node with the given index
    pub fn find(&self, index: NodeIndex) -> Option<&NodeHandle> {
        find_node(&self.nodes, index)
    }
}

/// A group agreed by a protocol round and the nodes producing it
#[derive(Clone)]
pub struct Epoch {
    /// Agreed group
    pub group: Group,
    /// Where the group descriptor was saved
    pub group_path: PathBuf,
    /// Participants of the round, leader first
    pub members: Roster,
}

/// Roster and threshold of an upcoming resharing
#[derive(Clone)]
pub struct ResharePlan {
    /// Retained nodes in epoch member order, then the added nodes; the
    /// first one leads the round
    pub members: Roster,
    /// Indices of the retained nodes
    pub retained: Vec<NodeIndex>,
    /// Indices of the added nodes
    pub added: Vec<NodeIndex>,
    /// Public key artifacts of the members, in member order
    pub public_paths: Vec<PathBuf>,
    /// Threshold of the new group
    pub threshold: usize,
}

/// Drives a beacon cluster through DKG, checks, failures and resharing
pub struct Orchestrator {
    config: Arc<DemoConfig>,
    lifecycle: ClusterLifecycle,
    injector: FailureInjector,
    checker: ConsistencyChecker,
    schedule: ScheduleClock,
}

impl Orchestrator {
    /// Create an orchestrator, wiping and recreating the base directory
    pub fn new(
        config: DemoConfig,
        factory: Arc<dyn NodeFactory>,
        public: Arc<dyn PublicApi>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        match std::fs::remove_dir_all(&config.base_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(config.cert_dir())?;
        info!(base = %config.base_path.display(), "Simulation global folder");

        let config = Arc::new(config);
        let schedule = ScheduleClock::new(clock);
        let lifecycle = ClusterLifecycle::new(factory, config.clone());
        Ok(Self {
            injector: FailureInjector::new(lifecycle.clone()),
            checker: ConsistencyChecker::new(public, schedule.clone(), config.with_http),
            lifecycle,
            schedule,
            config,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &DemoConfig {
        &self.config
    }

    /// Schedule the waits are computed on
    pub fn schedule(&self) -> &ScheduleClock {
        &self.schedule
    }

    /// Create the initial nodes, indexed from 1
    pub async fn setup_cluster(&self) -> Result<Cluster> {
        info!(nodes = self.config.nodes, "Setting up cluster");
        let (nodes, public_paths) = self.lifecycle.create_nodes(self.config.nodes, 1).await?;
        Ok(Cluster {
            nodes,
            public_paths,
        })
    }

    /// Create `n` nodes to join the group, indexed after `cluster`
    pub async fn setup_new_nodes(&self, cluster: &Cluster, n: usize) -> Result<Cluster> {
        info!(n, "Setting up new nodes for resharing");
        let offset = cluster.nodes.len() + 1;
        let (nodes, public_paths) = self.lifecycle.create_nodes(n, offset).await?;
        Ok(Cluster {
            nodes,
            public_paths,
        })
    }

    /// Start the nodes not excluded, provisioning fresh storage, and wait
    /// until all of them answer a ping
    pub async fn start_nodes(&self, nodes: &[NodeHandle], exclude: &[NodeIndex]) -> Result<()> {
        let filtered = filter_nodes(nodes, exclude);
        self.lifecycle.start(&filtered, &self.lifecycle.fresh_start()).await
    }

    /// Run the initial DKG over the whole cluster and save the agreed group
    #[instrument(skip(self, cluster), fields(nodes = cluster.nodes.len()))]
    pub async fn run_dkg(&self, cluster: &Cluster, timeout: Duration) -> Result<Epoch> {
        let params = DkgParams {
            nodes: cluster.nodes.len(),
            threshold: self.config.threshold,
            period: self.config.period,
            timeout,
            beacon_offset: self.config.beacon_offset,
        };
        let outcome = coordinator::run_dkg(&cluster.nodes, &params).await?;
        self.record_dkg_timing(cluster.nodes.len(), outcome.total, outcome.key_check);

        let group_path = self.config.group_path();
        outcome.group.save(&group_path)?;
        info!(
            path = %group_path.display(),
            genesis = outcome.group.genesis_time,
            "Saved group with collective key"
        );

        Ok(Epoch {
            group: outcome.group,
            group_path,
            members: cluster.nodes.clone(),
        })
    }

    fn record_dkg_timing(&self, nodes: usize, total: Duration, key_check: Duration) {
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.dkg_log)
            .and_then(|mut file| writeln!(file, "{nodes},{total:?},{key_check:?}"));
        if let Err(e) = written {
            warn!(path = %self.config.dkg_log.display(), error = %e, "Cannot record DKG timing");
        }
    }

    /// Sleep until the epoch's genesis plus a margin
    pub async fn wait_genesis(&self, epoch: &Epoch) {
        self.schedule.wait_for_genesis(epoch.group.genesis_time).await;
    }

    /// Sleep until a reshared epoch takes over plus a margin
    pub async fn wait_transition(&self, epoch: &Epoch) {
        match epoch.group.transition_time {
            Some(transition) => {
                self.schedule
                    .wait_for_transition(transition, epoch.group.genesis_time, self.period(epoch))
                    .await
            }
            None => warn!("Epoch has no transition time, not waiting"),
        }
    }

    /// Sleep until the next round of the epoch plus a margin
    pub async fn wait_period(&self, epoch: &Epoch) {
        self.schedule
            .wait_for_next_period(epoch.group.genesis_time, self.period(epoch))
            .await;
    }

    /// Plain pacing sleep
    pub async fn wait(&self, duration: Duration) {
        self.schedule.wait(duration).await;
    }

    fn period(&self, epoch: &Epoch) -> Duration {
        Duration::from_secs(epoch.group.period_secs)
    }

    /// Check that the members of `epoch` not excluded serve the same
    /// beacon, in random order
    pub async fn check_beacon(&self, epoch: &Epoch, exclude: &[NodeIndex]) -> Result<BeaconValue> {
        let nodes = filter_nodes(&epoch.members, exclude);
        self.checker.check(&nodes, &epoch.group_path, &epoch.group).await
    }

    /// Plan a resharing that keeps `reshare.retain` from the members of the
    /// current epoch and adds every node of `new_nodes`. Members not retained
    /// are stopped.
    pub async fn create_resharing_group(
        &self,
        current: &Epoch,
        new_nodes: &Cluster,
        reshare: &ReshareSpec,
    ) -> Result<ResharePlan> {
        info!(retain = ?reshare.retain, threshold = reshare.threshold, "Setting up the resharing group");
        for &index in &reshare.retain {
            if find_node(&current.members, index).is_none() {
                return Err(Error::UnknownNode(index));
            }
        }

        let mut members = Roster::new();
        let mut public_paths = Vec::new();
        let mut retained = Vec::new();
        for node in &current.members {
            if reshare.retain.contains(&node.index()) {
                info!(index = node.index(), addr = node.private_addr(), "Adding current node");
                retained.push(node.index());
                members.push(node.clone());
                public_paths.push(self.config.public_path(node.index()));
            }
        }
        if retained.len() < current.group.threshold {
            return Err(Error::ThresholdNotMet {
                required: current.group.threshold,
                actual: retained.len(),
            });
        }

        let mut added = Vec::new();
        for (node, path) in new_nodes.nodes.iter().zip(&new_nodes.public_paths) {
            if find_node(&members, node.index()).is_some() {
                continue;
            }
            info!(index = node.index(), addr = node.private_addr(), "Adding new node");
            added.push(node.index());
            members.push(node.clone());
            public_paths.push(path.clone());
        }

        if reshare.threshold == 0 || reshare.threshold > members.len() {
            return Err(Error::InvalidConfig(format!(
                "new threshold {} must be between 1 and {}",
                reshare.threshold,
                members.len()
            )));
        }

        let dropped: Roster = current
            .members
            .iter()
            .filter(|n| !retained.contains(&n.index()))
            .cloned()
            .collect();
        info!(count = dropped.len(), "Stopping old nodes");
        self.lifecycle.stop(&dropped).await;

        Ok(ResharePlan {
            members,
            retained,
            added,
            public_paths,
            threshold: reshare.threshold,
        })
    }

    /// Reshare the key of `prior` to the planned roster and save the new
    /// group
    #[instrument(skip(self, plan, prior), fields(members = plan.members.len(), threshold = plan.threshold))]
    pub async fn run_resharing(
        &self,
        plan: &ResharePlan,
        prior: &Epoch,
        timeout: Duration,
    ) -> Result<Epoch> {
        let params = ReshareParams {
            nodes: plan.members.len(),
            threshold: plan.threshold,
            old_group: None,
            timeout,
            beacon_offset: self.config.beacon_offset,
        };
        let group =
            coordinator::run_reshare(&plan.members, &prior.group, &prior.group_path, &params)
                .await?;

        let group_path = self.config.new_group_path();
        group.save(&group_path)?;
        info!(path = %group_path.display(), "Saved reshared group");

        Ok(Epoch {
            group,
            group_path,
            members: plan.members.clone(),
        })
    }

    /// Stop the nodes of `roster` with the given indices
    pub async fn stop_nodes(&self, roster: &[NodeHandle], ids: &[NodeIndex]) -> Vec<NodeIndex> {
        self.injector.stop_subset(roster, ids).await
    }

    /// Stop every node of `roster` but the excluded ones
    pub async fn stop_all_nodes(&self, roster: &[NodeHandle], exclude: &[NodeIndex]) -> Vec<NodeIndex> {
        let ids: Vec<NodeIndex> = filter_nodes(roster, exclude).iter().map(|n| n.index()).collect();
        info!(count = ids.len(), "Stopping the rest for a complete failure");
        self.injector.stop_subset(roster, &ids).await
    }

    /// Restart stopped nodes, looked up across every given cluster
    pub async fn start_node(&self, clusters: &[&Cluster], ids: &[NodeIndex]) -> Result<()> {
        let roster = all_nodes(clusters);
        self.injector.start_subset(&roster, ids).await
    }

    /// Switch the binary of one node for its next start
    pub fn update_binary(&self, cluster: &Cluster, index: NodeIndex, binary: &Path) -> Result<bool> {
        let node = cluster.find(index).ok_or(Error::UnknownNode(index))?;
        let updated = node.update_binary(binary);
        if updated {
            info!(index, binary = %binary.display(), "Updated node binary");
        } else {
            warn!(index, "Node does not run a binary");
        }
        Ok(updated)
    }

    /// Switch the binary of nodes created from now on
    pub fn update_global_binary(&self, binary: &Path) -> bool {
        let updated = self.lifecycle.factory().update_binary(binary);
        if updated {
            info!(binary = %binary.display(), "Updated global binary");
        }
        updated
    }

    /// Collect the log output of every node
    pub async fn print_logs(&self, clusters: &[&Cluster]) -> Vec<(NodeIndex, String)> {
        info!("Collecting node logs");
        let mut logs = Vec::new();
        for node in all_nodes(clusters) {
            let output = match node.log_output().await {
                Ok(output) => output,
                Err(e) => {
                    warn!(index = node.index(), error = %e, "Cannot read node log");
                    format!("<unavailable: {e}>")
                }
            };
            logs.push((node.index(), output));
        }
        logs
    }

    /// Signal every node to stop, then leave them `grace` to exit
    pub async fn shutdown(&self, clusters: &[&Cluster], grace: Duration) {
        let nodes = all_nodes(clusters);
        info!(count = nodes.len(), "Shutting down all nodes");
        self.lifecycle.stop_concurrently(&nodes).await;
        info!(?grace, "Sent stop command to all nodes");
        tokio::time::sleep(grace).await;
    }
}

/// Nodes of every cluster, each index once
fn all_nodes(clusters: &[&Cluster]) -> Roster {
    let mut nodes = Roster::new();
    for cluster in clusters {
        for node in &cluster.nodes {
            if find_node(&nodes, node.index()).is_none() {
                nodes.push(node.clone());
            }
        }
    }
    nodes
}
