//! Cross-node beacon consistency checks
//!
//! The last completed round is queried on every node twice: once through
//! the node's control interface and once through its public HTTP API. The
//! first control-interface answer is the reference every other answer is
//! compared against.

use crate::node::{NodeHandle, PublicApi};
use crate::schedule::{ScheduleClock, AFTER_PERIOD_WAIT};
use crate::types::{Agreement, BeaconValue, Group, NodeIndex};
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Control-interface queries per node while it lags behind the reference
pub const DIRECT_TRIALS: u32 = 3;

/// Pause between lagging control-interface queries
pub const DIRECT_BACKOFF: Duration = Duration::from_millis(100);

/// Public API queries per node before giving up
pub const PUBLIC_ATTEMPTS: u32 = 10;

/// Checks that every node serves the same beacon on both query paths
#[derive(Clone)]
pub struct ConsistencyChecker {
    public: Arc<dyn PublicApi>,
    schedule: ScheduleClock,
    with_http: bool,
}

impl ConsistencyChecker {
    /// Create a checker; `with_http == false` skips the public API pass
    pub fn new(public: Arc<dyn PublicApi>, schedule: ScheduleClock, with_http: bool) -> Self {
        Self {
            public,
            schedule,
            with_http,
        }
    }

    /// Check the last completed round of `group` on every node and return
    /// the reference beacon
    pub async fn check(
        &self,
        nodes: &[NodeHandle],
        group_path: &Path,
        group: &Group,
    ) -> Result<BeaconValue> {
        let period = Duration::from_secs(group.period_secs);
        let (next, _) = self.schedule.next_round(group.genesis_time, period);
        let round = next.saturating_sub(1);

        info!(round, nodes = nodes.len(), "Checking randomness beacon via control interface");
        let (reference, reference_index) = self.check_direct(nodes, group_path, round).await?;

        if self.with_http {
            info!(round, "Checking randomness beacon via public HTTP API");
            self.check_public(nodes, &reference).await?;
        } else {
            warn!("Public HTTP API check disabled, skipping");
        }

        info!(
            round = reference.round,
            reference = reference_index,
            randomness = %hex::encode(&reference.randomness),
            "Beacon consistent across nodes"
        );
        Ok(reference)
    }

    async fn check_direct(
        &self,
        nodes: &[NodeHandle],
        group_path: &Path,
        round: u64,
    ) -> Result<(BeaconValue, NodeIndex)> {
        let mut reference: Option<(BeaconValue, NodeIndex)> = None;

        for node in nodes {
            for trial in 1..=DIRECT_TRIALS {
                let (value, command) = node.get_beacon(group_path, round).await?;
                let Some((expected, reference_index)) = &reference else {
                    info!(index = node.index(), %command, "Example command");
                    reference = Some((value, node.index()));
                    break;
                };

                match value.agreement_with(expected) {
                    Agreement::Consistent => break,
                    Agreement::RoundLag => {
                        warn!(
                            index = node.index(),
                            reference = reference_index,
                            served = value.round,
                            expected = expected.round,
                            trial,
                            "Round mismatch, trying again"
                        );
                        if trial == DIRECT_TRIALS {
                            warn!(index = node.index(), "Node still lagging, moving on");
                        } else {
                            tokio::time::sleep(DIRECT_BACKOFF).await;
                        }
                    }
                    Agreement::SignatureMismatch => {
                        error!(
                            index = node.index(),
                            reference = reference_index,
                            round,
                            "Inconsistent beacon signature between nodes"
                        );
                        return Err(Error::BeaconMismatch {
                            round,
                            index: node.index(),
                            reference: *reference_index,
                        });
                    }
                }
            }
        }

        reference.ok_or_else(|| Error::InvalidConfig("no node to check".into()))
    }

    async fn check_public(&self, nodes: &[NodeHandle], reference: &BeaconValue) -> Result<()> {
        let round = reference.round;
        let mut described = false;

        for node in nodes {
            if !described {
                info!(command = %self.public.describe(node.as_ref(), round), "Example command");
                described = true;
            }

            let body = self.fetch_with_retry(node, round).await?;
            let served: BeaconValue = serde_json::from_slice(&body)?;

            if served.round != reference.round {
                error!(index = node.index(), served = served.round, round, "Inconsistent round over HTTP");
                return Err(Error::PublicRoundMismatch {
                    index: node.index(),
                    expected: reference.round,
                    actual: served.round,
                });
            }
            if served.signature != reference.signature {
                error!(
                    index = node.index(),
                    http = %hex::encode(&served.signature),
                    control = %hex::encode(&reference.signature),
                    "Inconsistent signature over HTTP"
                );
                return Err(Error::PublicSignatureMismatch {
                    index: node.index(),
                    round,
                });
            }
        }
        Ok(())
    }

    async fn fetch_with_retry(&self, node: &NodeHandle, round: u64) -> Result<Vec<u8>> {
        for attempt in 1..=PUBLIC_ATTEMPTS {
            match self.public.fetch_round(node.as_ref(), round).await {
                Ok(body) if !body.is_empty() => return Ok(body),
                Ok(_) => warn!(index = node.index(), attempt, "Empty response, retrying"),
                Err(e) => warn!(index = node.index(), attempt, error = %e, "Request failed, retrying"),
            }
            if attempt < PUBLIC_ATTEMPTS {
                tokio::time::sleep(AFTER_PERIOD_WAIT).await;
            }
        }
        Err(Error::PublicUnavailable {
            index: node.index(),
            attempts: PUBLIC_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::run_dkg;
    use crate::node::{DkgParams, MemoryNetwork, NodeFactory, StartOptions};
    use crate::schedule::MonotonicClock;
    use crate::StorageConfig;

    struct Fixture {
        network: MemoryNetwork,
        nodes: Vec<NodeHandle>,
        group: Group,
        checker: ConsistencyChecker,
    }

    async fn fixture(with_http: bool) -> Fixture {
        let clock = Arc::new(MonotonicClock::new());
        let network = MemoryNetwork::new(clock.clone());
        let options = StartOptions {
            cert_dir: "/tmp/certs".into(),
            storage: Some(StorageConfig::default()),
        };
        let mut nodes = Vec::new();
        for index in 1..=3 {
            let node = network.create(index).await.unwrap();
            node.start(&options).await.unwrap();
            nodes.push(node);
        }
        let params = DkgParams {
            nodes: 3,
            threshold: 2,
            period: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
            beacon_offset: 2,
        };
        let group = run_dkg(&nodes, &params).await.unwrap().group;

        let schedule = ScheduleClock::new(clock);
        schedule.wait_for_genesis(group.genesis_time).await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        let checker = ConsistencyChecker::new(network.public_api(), schedule, with_http);
        Fixture {
            network,
            nodes,
            group,
            checker,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consistent_cluster_passes() {
        let f = fixture(true).await;

        let beacon = f
            .checker
            .check(&f.nodes, Path::new("group.json"), &f.group)
            .await
            .unwrap();

        let expected = f
            .checker
            .schedule
            .current_round(f.group.genesis_time, Duration::from_secs(2));
        assert!(beacon.round >= 5);
        assert_eq!(beacon.round, expected);
        assert_eq!(beacon.randomness.len(), 32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signature_mismatch_is_fatal() {
        let f = fixture(true).await;
        f.network.corrupt_signature(3);

        let err = f
            .checker
            .check(&f.nodes, Path::new("group.json"), &f.group)
            .await
            .unwrap_err();

        assert!(err.is_invariant_violation());
        assert!(matches!(err, Error::BeaconMismatch { index: 3, reference: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lag_is_tolerated() {
        let f = fixture(false).await;
        // lags on the first two trials, catches up on the third
        f.network.lag(2, 1, 2);
        f.network.lag(3, 1, 5);

        let beacon = f
            .checker
            .check(&f.nodes, Path::new("group.json"), &f.group)
            .await
            .unwrap();
        assert!(beacon.round >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_signature_mismatch_is_fatal() {
        let f = fixture(true).await;
        f.network.corrupt_public(2);

        let err = f
            .checker
            .check(&f.nodes, Path::new("group.json"), &f.group)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PublicSignatureMismatch { index: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_round_mismatch_is_fatal() {
        let f = fixture(true).await;
        f.network.shift_public_round(1, 1);

        let err = f
            .checker
            .check(&f.nodes, Path::new("group.json"), &f.group)
            .await
            .unwrap_err();

        assert!(err.is_invariant_violation());
        match err {
            Error::PublicRoundMismatch {
                index,
                expected,
                actual,
            } => {
                assert_eq!(index, 1);
                assert_eq!(actual + 1, expected);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_public_responses_are_retried() {
        let f = fixture(true).await;
        f.network.empty_http_responses(1, 4);

        let start = tokio::time::Instant::now();
        f.checker
            .check(&f.nodes, Path::new("group.json"), &f.group)
            .await
            .unwrap();
        assert!(start.elapsed() >= AFTER_PERIOD_WAIT * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_api_exhaustion_is_fatal() {
        let f = fixture(true).await;
        f.network.empty_http_responses(1, PUBLIC_ATTEMPTS);

        let err = f
            .checker
            .check(&f.nodes, Path::new("group.json"), &f.group)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PublicUnavailable {
                index: 1,
                attempts: PUBLIC_ATTEMPTS
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_survives_one_stopped_node() {
        let f = fixture(true).await;
        f.nodes[1].stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        let live = vec![f.nodes[0].clone(), f.nodes[2].clone()];
        let beacon = f
            .checker
            .check(&live, Path::new("group.json"), &f.group)
            .await
            .unwrap();
        assert!(beacon.round >= 7);
    }
}
