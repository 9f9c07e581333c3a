//! Protocol round coordination
//!
//! A round is fanned out to every participant concurrently: the roster's
//! first node leads, the others follow it. Every participant's result is
//! collected once all of them returned, and the round fails if any of them
//! failed.

mod dkg;
mod reshare;

pub use dkg::{run_dkg, DkgOutcome};
pub use reshare::run_reshare;

use crate::convergence::wait_until_all;
use crate::error::ParticipantFailure;
use crate::node::{NodeHandle, Role};
use crate::types::{Group, NodeIndex};
use crate::{Error, Result};
use futures_util::future::join_all;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Join attempts of a follower while the leader is not reachable
pub const FOLLOWER_ATTEMPTS: u32 = 10;

/// Backoff unit between follower join attempts
pub const FOLLOWER_BACKOFF: Duration = Duration::from_millis(100);

/// Interval between chain info polls after a round
pub const CHAIN_INFO_POLL: Duration = Duration::from_secs(3);

/// Retry a follower call while its leader is not reachable yet
async fn join_leader<T, F, Fut>(index: NodeIndex, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Err(Error::LeaderUnreachable(leader)) if attempt < FOLLOWER_ATTEMPTS => {
                let backoff = FOLLOWER_BACKOFF * attempt;
                debug!(index, %leader, attempt, ?backoff, "Leader not reachable yet");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Run `call` on every node concurrently, the first one as leader. Returns
/// each participant's output in roster order, or every failure.
pub(crate) async fn fan_out<'a, T, F, Fut>(
    round: &'static str,
    nodes: &'a [NodeHandle],
    call: F,
) -> Result<Vec<(NodeIndex, T)>>
where
    F: Fn(&'a NodeHandle, Role) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let leader = nodes
        .first()
        .ok_or_else(|| Error::InvalidConfig(format!("{round} round without participants")))?;
    let follower = Role::Follower {
        leader: leader.private_addr().to_string(),
    };
    info!(round, leader = leader.index(), participants = nodes.len(), "Launching round");

    let call = &call;
    let calls = nodes.iter().enumerate().map(|(position, node)| {
        let role = if position == 0 {
            Role::Leader
        } else {
            follower.clone()
        };
        async move {
            let result = if role.is_leader() {
                call(node, role).await
            } else {
                join_leader(node.index(), || call(node, role.clone())).await
            };
            (node.index(), result)
        }
    });

    let mut outputs = Vec::with_capacity(nodes.len());
    let mut failures = Vec::new();
    for (index, result) in join_all(calls).await {
        match result {
            Ok(output) => outputs.push((index, output)),
            Err(e) => {
                warn!(round, index, error = %e, "Participant failed");
                failures.push(ParticipantFailure {
                    index,
                    reason: e.to_string(),
                });
            }
        }
    }

    if !failures.is_empty() {
        error!(round, failed = failures.len(), "Round aborted");
        return Err(Error::RoundFailed { round, failures });
    }
    Ok(outputs)
}

/// Wait until every node materialized chain info, then fetch the group from
/// each of them and check they all carry the same collective key
pub(crate) async fn collect_group(nodes: &[NodeHandle]) -> Result<Group> {
    info!(count = nodes.len(), "Waiting for chain info on every node");
    wait_until_all(nodes, |node| node.chain_info(), CHAIN_INFO_POLL).await;

    let mut reference: Option<(NodeIndex, Group)> = None;
    for node in nodes {
        let group = node.get_group().await?;
        match &reference {
            None => reference = Some((node.index(), group)),
            Some((first, expected)) => {
                if !group.is_equivalent(expected) {
                    error!(
                        index = node.index(),
                        key = %group.public_key_hex(),
                        expected = %expected.public_key_hex(),
                        "Collective key differs between nodes"
                    );
                    return Err(Error::KeyMismatch {
                        index: node.index(),
                        reference: *first,
                    });
                }
            }
        }
    }

    let (_, group) = reference
        .ok_or_else(|| Error::InvalidConfig("no node to collect a group from".into()))?;
    info!(key = %group.public_key_hex(), "All nodes agree on the collective key");
    Ok(group)
}
