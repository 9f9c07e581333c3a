//! Initial distributed key generation

use super::{collect_group, fan_out};
use crate::node::{DkgParams, NodeHandle};
use crate::types::Group;
use crate::Result;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument};

/// Result of a successful DKG
#[derive(Debug, Clone)]
pub struct DkgOutcome {
    /// Group agreed by every participant
    pub group: Group,
    /// Time from launching the round to the key check passing
    pub total: Duration,
    /// Time spent waiting for chain info and comparing keys
    pub key_check: Duration,
}

/// Run the initial DKG over `nodes`, the first node leading
///
/// Every participant must report the same collective key afterwards.
#[instrument(skip(nodes), fields(participants = nodes.len()))]
pub async fn run_dkg(nodes: &[NodeHandle], params: &DkgParams) -> Result<DkgOutcome> {
    info!(
        nodes = params.nodes,
        threshold = params.threshold,
        period = ?params.period,
        "Starting DKG"
    );
    let started = Instant::now();

    fan_out("DKG", nodes, |node, role| async move {
        node.run_dkg(params, &role).await
    })
    .await?;
    info!(elapsed = ?started.elapsed(), "DKG round completed on every node");

    let key_check_started = Instant::now();
    let group = collect_group(nodes).await?;
    let key_check = key_check_started.elapsed();
    let total = started.elapsed();

    info!(
        key = %group.public_key_hex(),
        genesis = group.genesis_time,
        ?total,
        ?key_check,
        "DKG finished"
    );
    Ok(DkgOutcome {
        group,
        total,
        key_check,
    })
}
