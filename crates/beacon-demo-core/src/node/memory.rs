//! In-memory simulated beacon network for testing
//!
//! Every [`MemoryNode`] shares one [`MemoryNetwork`]. A DKG round produces a
//! secp256k1 collective key; the beacon for round `r` is the deterministic
//! ECDSA signature over `r` (big-endian), so every honest node serves the
//! same bytes. A round is served once the schedule has reached it and while
//! at least `threshold` members of the producing group are running.
//! Resharing keeps the key and moves the group to a transition time aligned
//! on a period boundary.

use super::{
    async_trait, DkgParams, NodeAgent, NodeFactory, NodeHandle, PublicApi, ReshareParams, Role,
    StartOptions,
};
use crate::config::DEFAULT_BEACON_ID;
use crate::schedule::{self, Clock};
use crate::types::{BeaconValue, Group, GroupMember, NodeIdentity, NodeIndex};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k256::ecdsa::{signature::Signer, Signature, SigningKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

/// Base port of simulated addresses; each node takes three consecutive ports
const BASE_PORT: usize = 20_000;

#[derive(Debug, Default, Clone)]
struct Faults {
    corrupt_signature: bool,
    corrupt_public: bool,
    lag_rounds: u64,
    lagged_queries: u32,
    empty_http: u32,
    public_round_shift: u64,
    ping_failures: u32,
    fail_rounds: bool,
}

struct SimNode {
    identity: NodeIdentity,
    running: bool,
    provisioned: bool,
    group: Option<Group>,
    chain_ready_at: Option<DateTime<Utc>>,
    faults: Faults,
    log: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    Dkg,
    Reshare,
}

struct Session {
    id: u64,
    kind: SessionKind,
    leader: String,
    expected: usize,
    threshold: usize,
    joined: Vec<NodeIndex>,
    outcome: Option<Group>,
    aborted: bool,
}

struct Chain {
    key: SigningKey,
    group: Group,
    previous: Option<Group>,
}

impl Chain {
    /// Group producing beacons at unix time `now`
    fn producing_group(&self, now: i64) -> &Group {
        match (&self.previous, self.group.transition_time) {
            (Some(previous), Some(transition)) if now < transition => previous,
            _ => &self.group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryPath {
    Direct,
    Public,
}

struct NetworkState {
    clock: Arc<dyn Clock>,
    beacon_id: String,
    nodes: DashMap<NodeIndex, SimNode>,
    session: Mutex<Option<Session>>,
    chain: Mutex<Option<Chain>>,
    chain_info_delay: Mutex<Duration>,
    notify: broadcast::Sender<()>,
}

/// Shared state of a simulated beacon network
///
/// Lock order: session, then chain, then node entries.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkState>,
}

impl MemoryNetwork {
    /// Create an empty network driven by a clock
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (notify, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(NetworkState {
                clock,
                beacon_id: DEFAULT_BEACON_ID.to_string(),
                nodes: DashMap::new(),
                session: Mutex::new(None),
                chain: Mutex::new(None),
                chain_info_delay: Mutex::new(Duration::ZERO),
                notify,
            }),
        }
    }

    /// Clock driving the network
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    /// Delay between a round completing and its chain info becoming visible
    pub fn set_chain_info_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.inner.chain_info_delay.lock() {
            *current = delay;
        }
    }

    /// Public API served by the simulated nodes
    pub fn public_api(&self) -> Arc<dyn PublicApi> {
        Arc::new(self.clone())
    }

    /// Whether a node is currently running
    pub fn is_running(&self, index: NodeIndex) -> bool {
        self.inner
            .nodes
            .get(&index)
            .map(|n| n.running)
            .unwrap_or(false)
    }

    /// Collective key of the running chain
    pub fn collective_key(&self) -> Option<Vec<u8>> {
        self.chain()
            .ok()
            .and_then(|chain| chain.as_ref().map(|c| c.group.public_key.clone()))
    }

    /// Make a node serve wrong signatures through its control interface
    pub fn corrupt_signature(&self, index: NodeIndex) {
        self.update_faults(index, |f| f.corrupt_signature = true);
    }

    /// Make a node serve wrong signatures through its public API
    pub fn corrupt_public(&self, index: NodeIndex) {
        self.update_faults(index, |f| f.corrupt_public = true);
    }

    /// Make the next `queries` control-interface queries of a node answer
    /// `rounds` rounds behind
    pub fn lag(&self, index: NodeIndex, rounds: u64, queries: u32) {
        self.update_faults(index, |f| {
            f.lag_rounds = rounds;
            f.lagged_queries = queries;
        });
    }

    /// Make the next `count` public API responses of a node empty
    pub fn empty_http_responses(&self, index: NodeIndex, count: u32) {
        self.update_faults(index, |f| f.empty_http = count);
    }

    /// Make a node answer `by` rounds behind through its public API
    pub fn shift_public_round(&self, index: NodeIndex, by: u64) {
        self.update_faults(index, |f| f.public_round_shift = by);
    }

    /// Make the next `count` pings of a running node fail
    pub fn delay_ping(&self, index: NodeIndex, count: u32) {
        self.update_faults(index, |f| f.ping_failures = count);
    }

    /// Make every protocol round call of a node fail
    pub fn fail_rounds(&self, index: NodeIndex) {
        self.update_faults(index, |f| f.fail_rounds = true);
    }

    fn update_faults(&self, index: NodeIndex, update: impl FnOnce(&mut Faults)) {
        if let Some(mut node) = self.inner.nodes.get_mut(&index) {
            update(&mut node.faults);
        }
    }

    fn session(&self) -> Result<MutexGuard<'_, Option<Session>>> {
        self.inner
            .session
            .lock()
            .map_err(|_| Error::Internal("session lock poisoned".into()))
    }

    fn chain(&self) -> Result<MutexGuard<'_, Option<Chain>>> {
        self.inner
            .chain
            .lock()
            .map_err(|_| Error::Internal("chain lock poisoned".into()))
    }

    fn chain_info_delay(&self) -> Duration {
        self.inner
            .chain_info_delay
            .lock()
            .map(|d| *d)
            .unwrap_or(Duration::ZERO)
    }

    fn with_node<T>(&self, index: NodeIndex, f: impl FnOnce(&mut SimNode) -> T) -> Result<T> {
        let mut node = self
            .inner
            .nodes
            .get_mut(&index)
            .ok_or(Error::UnknownNode(index))?;
        Ok(f(&mut node))
    }

    /// Wake every task polling the session; sending only fails when none is
    /// subscribed
    fn wake_waiters(&self) {
        let _ = self.inner.notify.send(());
    }

    /// Append a line to a node's log; unknown nodes have no log
    fn log(&self, index: NodeIndex, line: String) {
        let now = self.inner.clock.now().to_rfc3339();
        if let Some(mut node) = self.inner.nodes.get_mut(&index) {
            node.log.push(format!("{now} {line}"));
        }
    }

    fn ensure_can_run_round(&self, index: NodeIndex) -> Result<()> {
        let (running, failing) = self.with_node(index, |n| (n.running, n.faults.fail_rounds))?;
        if !running {
            return Err(Error::NodeStopped(index));
        }
        if failing {
            return Err(Error::Node(format!("node {index} aborted the round")));
        }
        Ok(())
    }

    fn open_session(
        &self,
        kind: SessionKind,
        leader: &NodeIdentity,
        expected: usize,
        threshold: usize,
    ) -> Result<u64> {
        let mut guard = self.session()?;
        if let Some(current) = guard.as_ref() {
            if current.outcome.is_none() && !current.aborted {
                return Err(Error::Node(format!(
                    "leader {} is already running a round",
                    current.leader
                )));
            }
        }
        let id = guard.as_ref().map(|s| s.id + 1).unwrap_or(1);
        *guard = Some(Session {
            id,
            kind,
            leader: leader.private_addr.clone(),
            expected,
            threshold,
            joined: vec![leader.index],
            outcome: None,
            aborted: false,
        });
        drop(guard);
        self.wake_waiters();
        Ok(id)
    }

    fn join_session(&self, kind: SessionKind, leader: &str, index: NodeIndex) -> Result<u64> {
        let mut guard = self.session()?;
        let session = guard
            .as_mut()
            .filter(|s| {
                s.kind == kind && s.leader == leader && s.outcome.is_none() && !s.aborted
            })
            .ok_or_else(|| Error::LeaderUnreachable(leader.to_string()))?;
        if !session.joined.contains(&index) {
            session.joined.push(index);
        }
        let id = session.id;
        drop(guard);
        self.wake_waiters();
        Ok(id)
    }

    fn abort_session(&self, id: u64) {
        if let Ok(mut guard) = self.session() {
            if let Some(session) = guard.as_mut().filter(|s| s.id == id) {
                session.aborted = true;
            }
        }
        self.wake_waiters();
    }

    /// Poll the session until `probe` yields an outcome or the timeout hits
    async fn wait_for<T: Send>(
        &self,
        timeout: Duration,
        what: &str,
        mut probe: impl FnMut(&Session) -> Option<Result<T>> + Send,
    ) -> Result<T> {
        let mut rx = self.inner.notify.subscribe();
        let wait = async {
            loop {
                let outcome = {
                    let guard = self.session()?;
                    match guard.as_ref() {
                        Some(session) => probe(session),
                        None => Some(Err(Error::Internal("no round in progress".into()))),
                    }
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }

                tokio::select! {
                    _ = rx.recv() => continue,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(what.to_string()))?
    }

    async fn wait_for_participants(&self, id: u64, timeout: Duration) -> Result<()> {
        let result = self
            .wait_for(timeout, "round participants", |s| {
                if s.id != id {
                    Some(Err(Error::Internal("round replaced".into())))
                } else if s.joined.len() >= s.expected {
                    Some(Ok(()))
                } else {
                    None
                }
            })
            .await;
        if result.is_err() {
            self.abort_session(id);
        }
        result
    }

    async fn wait_for_outcome(&self, id: u64, timeout: Duration) -> Result<Group> {
        self.wait_for(timeout, "round outcome", |s| {
            if s.id != id || s.aborted {
                Some(Err(Error::Node("leader aborted the round".into())))
            } else {
                s.outcome.clone().map(Ok)
            }
        })
        .await
    }

    /// Hand the agreed group to every participant
    fn install_group(&self, members: &[NodeIndex], group: &Group) {
        let ready_at = self.inner.clock.now()
            + chrono::Duration::from_std(self.chain_info_delay())
                .unwrap_or_else(|_| chrono::Duration::zero());
        for index in members {
            if let Some(mut node) = self.inner.nodes.get_mut(index) {
                node.group = Some(group.clone());
                node.chain_ready_at = Some(ready_at);
            }
        }
    }

    fn members_of(&self, joined: &[NodeIndex]) -> Vec<GroupMember> {
        let mut members: Vec<GroupMember> = joined
            .iter()
            .filter_map(|index| {
                self.inner.nodes.get(index).map(|n| GroupMember {
                    index: *index,
                    address: n.identity.private_addr.clone(),
                })
            })
            .collect();
        members.sort_by_key(|m| m.index);
        members
    }

    fn finalize_dkg(&self, id: u64, params: &DkgParams) -> Result<Group> {
        let mut session_guard = self.session()?;
        let session = session_guard
            .as_mut()
            .filter(|s| s.id == id)
            .ok_or_else(|| Error::Internal("round replaced".into()))?;

        let key = SigningKey::random(&mut OsRng);
        let public_key = key
            .verifying_key()
            .as_affine()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec();
        let group = Group {
            nodes: self.members_of(&session.joined),
            threshold: session.threshold,
            public_key,
            period_secs: params.period.as_secs(),
            genesis_time: self.inner.clock.unix() + params.beacon_offset as i64,
            transition_time: None,
            beacon_id: self.inner.beacon_id.clone(),
        };

        *self.chain()? = Some(Chain {
            key,
            group: group.clone(),
            previous: None,
        });
        self.install_group(&session.joined, &group);
        session.outcome = Some(group.clone());
        drop(session_guard);

        self.wake_waiters();
        Ok(group)
    }

    fn finalize_reshare(&self, id: u64, params: &ReshareParams) -> Result<Group> {
        let mut session_guard = self.session()?;
        let session = session_guard
            .as_mut()
            .filter(|s| s.id == id)
            .ok_or_else(|| Error::Internal("round replaced".into()))?;

        let mut chain_guard = self.chain()?;
        let chain = chain_guard
            .as_mut()
            .ok_or_else(|| Error::Node("no chain to reshare".into()))?;

        let period = Duration::from_secs(chain.group.period_secs);
        let earliest = self.inner.clock.unix() + params.beacon_offset as i64;
        let (_, transition) = schedule::next_round(earliest, chain.group.genesis_time, period);

        let group = Group {
            nodes: self.members_of(&session.joined),
            threshold: session.threshold,
            public_key: chain.group.public_key.clone(),
            period_secs: chain.group.period_secs,
            genesis_time: chain.group.genesis_time,
            transition_time: Some(transition),
            beacon_id: chain.group.beacon_id.clone(),
        };
        chain.previous = Some(std::mem::replace(&mut chain.group, group.clone()));
        drop(chain_guard);

        self.install_group(&session.joined, &group);
        session.outcome = Some(group.clone());
        drop(session_guard);

        self.wake_waiters();
        Ok(group)
    }

    /// A node joining an existing chain must be handed the previous group,
    /// and that group must describe the running chain.
    fn check_reshare_input(&self, index: NodeIndex, old_group: Option<&Path>) -> Result<()> {
        let is_member = self.with_node(index, |n| n.group.is_some())?;
        match old_group {
            Some(path) => {
                let previous = Group::load(path)?;
                let chain = self.chain()?;
                let running_key = chain.as_ref().map(|c| c.group.public_key.as_slice());
                if running_key != Some(previous.public_key.as_slice()) {
                    return Err(Error::Node(format!(
                        "group file {} does not describe the running chain",
                        path.display()
                    )));
                }
                Ok(())
            }
            None if is_member => Ok(()),
            None => Err(Error::Node(format!(
                "node {index} is not part of the current group and got no previous group"
            ))),
        }
    }

    async fn run_dkg(&self, identity: &NodeIdentity, params: &DkgParams, role: &Role) -> Result<()> {
        self.ensure_can_run_round(identity.index)?;
        match role {
            Role::Leader => {
                let id =
                    self.open_session(SessionKind::Dkg, identity, params.nodes, params.threshold)?;
                self.log(identity.index, format!("leading DKG for {} nodes", params.nodes));
                self.wait_for_participants(id, params.timeout).await?;
                let group = self.finalize_dkg(id, params)?;
                self.log(
                    identity.index,
                    format!("DKG finished, collective key {}", group.public_key_hex()),
                );
                Ok(())
            }
            Role::Follower { leader } => {
                let id = self.join_session(SessionKind::Dkg, leader, identity.index)?;
                self.log(identity.index, format!("joined DKG led by {leader}"));
                self.wait_for_outcome(id, params.timeout).await?;
                Ok(())
            }
        }
    }

    async fn run_reshare(
        &self,
        identity: &NodeIdentity,
        params: &ReshareParams,
        role: &Role,
    ) -> Result<Group> {
        self.ensure_can_run_round(identity.index)?;
        self.check_reshare_input(identity.index, params.old_group.as_deref())?;
        let group = match role {
            Role::Leader => {
                let id = self.open_session(
                    SessionKind::Reshare,
                    identity,
                    params.nodes,
                    params.threshold,
                )?;
                self.wait_for_participants(id, params.timeout).await?;
                self.finalize_reshare(id, params)?
            }
            Role::Follower { leader } => {
                let id = self.join_session(SessionKind::Reshare, leader, identity.index)?;
                self.wait_for_outcome(id, params.timeout).await?
            }
        };
        self.log(
            identity.index,
            format!("resharing finished, transition at {:?}", group.transition_time),
        );
        Ok(group)
    }

    fn beacon(&self, index: NodeIndex, round: u64, path: QueryPath) -> Result<BeaconValue> {
        let (running, has_group, lag, corrupt) = self.with_node(index, |n| {
            let mut lag = 0;
            if path == QueryPath::Direct && n.faults.lagged_queries > 0 {
                n.faults.lagged_queries -= 1;
                lag = n.faults.lag_rounds;
            }
            if path == QueryPath::Public {
                lag = n.faults.public_round_shift;
            }
            let corrupt = match path {
                QueryPath::Direct => n.faults.corrupt_signature,
                QueryPath::Public => n.faults.corrupt_public,
            };
            (n.running, n.group.is_some(), lag, corrupt)
        })?;
        if !running {
            return Err(Error::NodeStopped(index));
        }
        if !has_group {
            return Err(Error::Node(format!("node {index} has no chain yet")));
        }

        let chain_guard = self.chain()?;
        let chain = chain_guard
            .as_ref()
            .ok_or_else(|| Error::Node("no chain running".into()))?;
        let now = self.inner.clock.unix();
        let period = Duration::from_secs(chain.group.period_secs);
        if round == 0 || round > schedule::round_at(now, chain.group.genesis_time, period) {
            return Err(Error::BeaconNotReady(round));
        }

        let producing = chain.producing_group(now);
        let live = producing
            .nodes
            .iter()
            .filter(|m| self.is_running(m.index))
            .count();
        if live < producing.threshold {
            return Err(Error::Node(format!(
                "round {round} not produced: {live} of {} signers live",
                producing.threshold
            )));
        }

        let served = if round > lag { round - lag } else { round };
        let mut value = sign_round(&chain.key, served);
        if corrupt {
            value.signature[0] ^= 0xff;
            value.randomness = Sha256::digest(&value.signature).to_vec();
        }
        Ok(value)
    }
}

/// Beacon value for a round under a collective key
fn sign_round(key: &SigningKey, round: u64) -> BeaconValue {
    let signature: Signature = key.sign(&round.to_be_bytes());
    let signature = signature.to_bytes().to_vec();
    let randomness = Sha256::digest(&signature).to_vec();
    BeaconValue {
        round,
        signature,
        randomness,
    }
}

#[async_trait]
impl NodeFactory for MemoryNetwork {
    async fn create(&self, index: NodeIndex) -> Result<NodeHandle> {
        if self.inner.nodes.contains_key(&index) {
            return Err(Error::InvalidConfig(format!("node index {index} already used")));
        }
        let port = BASE_PORT + index * 3;
        let identity = NodeIdentity::new(
            index,
            &format!("127.0.0.1:{port}"),
            &format!("127.0.0.1:{}", port + 1),
            &format!("{}", port + 2),
        );
        self.inner.nodes.insert(
            index,
            SimNode {
                identity: identity.clone(),
                running: false,
                provisioned: false,
                group: None,
                chain_ready_at: None,
                faults: Faults::default(),
                log: Vec::new(),
            },
        );
        self.log(index, format!("created node {}", identity.private_addr));

        Ok(Arc::new(MemoryNode {
            identity,
            network: self.clone(),
        }))
    }
}

#[async_trait]
impl PublicApi for MemoryNetwork {
    fn describe(&self, node: &dyn NodeAgent, round: u64) -> String {
        format!(
            "curl -s -H 'Context-type: application/json' http://{}/public/{}",
            node.public_addr(),
            round
        )
    }

    async fn fetch_round(&self, node: &dyn NodeAgent, round: u64) -> Result<Vec<u8>> {
        let index = node.index();
        let (running, empty) = self.with_node(index, |n| {
            let empty = n.faults.empty_http > 0;
            if empty {
                n.faults.empty_http -= 1;
            }
            (n.running, empty)
        })?;
        if !running {
            return Err(Error::Http(format!(
                "connection refused: {}",
                node.public_addr()
            )));
        }
        if empty {
            return Ok(Vec::new());
        }

        let value = self.beacon(index, round, QueryPath::Public)?;
        Ok(serde_json::to_vec(&value)?)
    }
}

/// Node agent backed by a [`MemoryNetwork`]
pub struct MemoryNode {
    identity: NodeIdentity,
    network: MemoryNetwork,
}

fn write_artifact(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(|e| Error::Artifact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl NodeAgent for MemoryNode {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    async fn write_certificate(&self, path: &Path) -> Result<()> {
        let fingerprint = hex::encode(Sha256::digest(self.identity.private_addr.as_bytes()));
        write_artifact(
            path,
            &format!("-----BEGIN CERTIFICATE-----\n{fingerprint}\n-----END CERTIFICATE-----\n"),
        )
    }

    async fn write_public(&self, path: &Path) -> Result<()> {
        let key = hex::encode(Sha256::digest(self.identity.index.to_be_bytes()));
        let public = serde_json::json!({
            "index": self.identity.index,
            "address": self.identity.private_addr,
            "key": key,
        });
        write_artifact(path, &serde_json::to_string_pretty(&public)?)
    }

    async fn start(&self, options: &StartOptions) -> Result<()> {
        let index = self.identity.index;
        self.network.with_node(index, |n| {
            if options.storage.is_none() && !n.provisioned {
                return Err(Error::NodeStart {
                    index,
                    reason: "no existing state to reconnect to".into(),
                });
            }
            n.running = true;
            n.provisioned = true;
            Ok(())
        })??;
        self.network.log(
            index,
            format!("started with certs from {}", options.cert_dir.display()),
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.network.with_node(self.identity.index, |n| n.running = false)?;
        self.network.log(self.identity.index, "stopped".into());
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.network
            .with_node(self.identity.index, |n| {
                if !n.running {
                    return false;
                }
                if n.faults.ping_failures > 0 {
                    n.faults.ping_failures -= 1;
                    return false;
                }
                true
            })
            .unwrap_or(false)
    }

    async fn run_dkg(&self, params: &DkgParams, role: &Role) -> Result<()> {
        self.network.run_dkg(&self.identity, params, role).await
    }

    async fn run_reshare(&self, params: &ReshareParams, role: &Role) -> Result<Group> {
        self.network.run_reshare(&self.identity, params, role).await
    }

    async fn chain_info(&self) -> bool {
        let now = self.network.inner.clock.now();
        self.network
            .with_node(self.identity.index, |n| {
                n.running && n.group.is_some() && n.chain_ready_at.map_or(false, |t| t <= now)
            })
            .unwrap_or(false)
    }

    async fn get_group(&self) -> Result<Group> {
        let index = self.identity.index;
        let (running, group) = self.network.with_node(index, |n| (n.running, n.group.clone()))?;
        if !running {
            return Err(Error::NodeStopped(index));
        }
        group.ok_or_else(|| Error::Node(format!("node {index} has no group yet")))
    }

    async fn get_beacon(&self, group_path: &Path, round: u64) -> Result<(BeaconValue, String)> {
        let value = self
            .network
            .beacon(self.identity.index, round, QueryPath::Direct)?;
        let command = format!(
            "get public --round {round} --control {} {}",
            self.identity.ctrl_addr,
            group_path.display()
        );
        Ok((value, command))
    }

    async fn log_output(&self) -> Result<String> {
        self.network
            .with_node(self.identity.index, |n| n.log.join("\n"))
    }
}
