//! Resharing of an existing collective key to a new node set

use super::{collect_group, fan_out};
use crate::node::{NodeHandle, ReshareParams};
use crate::types::Group;
use crate::{Error, Result};
use std::path::Path;
use tracing::{error, info, instrument};

/// Reshare the key of `prior` to `nodes`, the first node leading
///
/// Nodes that are not members of `prior` are handed `prior_path` so they can
/// join the running chain. The agreed group must keep the prior collective
/// key.
#[instrument(skip(nodes, prior), fields(participants = nodes.len()))]
pub async fn run_reshare(
    nodes: &[NodeHandle],
    prior: &Group,
    prior_path: &Path,
    params: &ReshareParams,
) -> Result<Group> {
    let previous_members = prior.member_indices();
    info!(
        nodes = params.nodes,
        threshold = params.threshold,
        previous_threshold = prior.threshold,
        "Starting resharing"
    );

    let joining = ReshareParams {
        old_group: Some(prior_path.to_path_buf()),
        ..params.clone()
    };
    let retained = ReshareParams {
        old_group: None,
        ..params.clone()
    };

    let previous_members = &previous_members;
    let (joining, retained) = (&joining, &retained);
    fan_out("resharing", nodes, |node, role| async move {
        let params = if previous_members.contains(&node.index()) {
            retained
        } else {
            joining
        };
        node.run_reshare(params, &role).await
    })
    .await?;

    let group = collect_group(nodes).await?;
    if !group.is_equivalent(prior) {
        error!(
            old = %prior.public_key_hex(),
            new = %group.public_key_hex(),
            "Resharing changed the collective key"
        );
        return Err(Error::ReshareKeyChanged {
            old: prior.public_key_hex(),
            new: group.public_key_hex(),
        });
    }

    info!(
        key = %group.public_key_hex(),
        transition = ?group.transition_time,
        members = ?group.member_indices(),
        "Resharing finished, collective key preserved"
    );
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::run_dkg;
    use crate::node::{DkgParams, MemoryNetwork, NodeFactory, StartOptions};
    use crate::schedule::MonotonicClock;
    use crate::StorageConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn options() -> StartOptions {
        StartOptions {
            cert_dir: "/tmp/certs".into(),
            storage: Some(StorageConfig::default()),
        }
    }

    async fn create(network: &MemoryNetwork, indices: std::ops::RangeInclusive<usize>) -> Vec<NodeHandle> {
        let mut nodes = Vec::new();
        for index in indices {
            let node = network.create(index).await.unwrap();
            node.start(&options()).await.unwrap();
            nodes.push(node);
        }
        nodes
    }

    fn reshare_params(nodes: usize, threshold: usize) -> ReshareParams {
        ReshareParams {
            nodes,
            threshold,
            old_group: None,
            timeout: Duration::from_secs(10),
            beacon_offset: 2,
        }
    }

    async fn bootstrap(network: &MemoryNetwork, dir: &Path) -> (Vec<NodeHandle>, Group, std::path::PathBuf) {
        let nodes = create(network, 1..=3).await;
        let params = DkgParams {
            nodes: 3,
            threshold: 2,
            period: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
            beacon_offset: 2,
        };
        let group = run_dkg(&nodes, &params).await.unwrap().group;
        let path = dir.join("group.json");
        group.save(&path).unwrap();
        (nodes, group, path)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reshare_to_larger_group_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new(Arc::new(MonotonicClock::new()));
        let (old, prior, path) = bootstrap(&network, dir.path()).await;
        old[2].stop().await.unwrap();

        let mut roster = old[..2].to_vec();
        roster.extend(create(&network, 4..=5).await);

        let group = run_reshare(&roster, &prior, &path, &reshare_params(4, 3))
            .await
            .unwrap();

        assert!(group.is_equivalent(&prior));
        assert_eq!(group.member_indices(), vec![1, 2, 4, 5]);
        assert_eq!(group.threshold, 3);
        assert!(group.transition_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_leader_gets_previous_group() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new(Arc::new(MonotonicClock::new()));
        let (old, prior, path) = bootstrap(&network, dir.path()).await;

        let mut roster = create(&network, 4..=4).await;
        roster.extend(old[..2].iter().cloned());

        let group = run_reshare(&roster, &prior, &path, &reshare_params(3, 2))
            .await
            .unwrap();
        assert_eq!(group.member_indices(), vec![1, 2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new(Arc::new(MonotonicClock::new()));
        let (old, mut prior, _) = bootstrap(&network, dir.path()).await;

        // a stale descriptor from another chain
        prior.public_key[1] ^= 0xff;
        let stale = dir.path().join("stale.json");
        prior.save(&stale).unwrap();

        // only retained nodes, so nobody reads the stale file
        let err = run_reshare(&old, &prior, &stale, &reshare_params(3, 2))
            .await
            .unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(matches!(err, Error::ReshareKeyChanged { .. }));
    }
}
