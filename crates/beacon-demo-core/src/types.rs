//! Core types shared by the orchestration components

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Stable identifier of a node within a run
pub type NodeIndex = usize;

/// Identity of a node under test, assigned at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique positive index, never reused within a run
    pub index: NodeIndex,
    /// Private (node-to-node) address
    pub private_addr: String,
    /// Public HTTP address
    pub public_addr: String,
    /// Control port address
    pub ctrl_addr: String,
}

impl NodeIdentity {
    /// Create a new node identity
    pub fn new(index: NodeIndex, private_addr: &str, public_addr: &str, ctrl_addr: &str) -> Self {
        Self {
            index,
            private_addr: private_addr.to_string(),
            public_addr: public_addr.to_string(),
            ctrl_addr: ctrl_addr.to_string(),
        }
    }
}

/// Committee member as recorded in a group descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Node index
    pub index: NodeIndex,
    /// Private address the member is reachable at
    pub address: String,
}

/// Group descriptor agreed by a successful DKG or resharing round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Committee membership, ordered by index
    pub nodes: Vec<GroupMember>,
    /// Minimum number of shares needed to produce a beacon
    pub threshold: usize,
    /// Collective public key
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
    /// Beacon period in seconds
    pub period_secs: u64,
    /// Unix time of round 1
    pub genesis_time: i64,
    /// Unix time at which this group takes over, set after a resharing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<i64>,
    /// Beacon identifier
    #[serde(default)]
    pub beacon_id: String,
}

impl Group {
    /// Two groups are equivalent when they share the collective key,
    /// regardless of membership churn.
    pub fn is_equivalent(&self, other: &Group) -> bool {
        self.public_key == other.public_key
    }

    /// Hex encoding of the collective public key
    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    /// Indices of the committee members
    pub fn member_indices(&self) -> Vec<NodeIndex> {
        self.nodes.iter().map(|m| m.index).collect()
    }

    /// Save the group descriptor as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| Error::Artifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load a group descriptor
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Beacon value for a single round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconValue {
    /// Round number
    pub round: u64,
    /// Threshold signature over the round
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    /// Randomness derived from the signature
    #[serde(default, with = "hex::serde", skip_serializing_if = "Vec::is_empty")]
    pub randomness: Vec<u8>,
}

/// Outcome of comparing a beacon value against a reference value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agreement {
    /// Same round and same signature
    Consistent,
    /// Rounds differ; the node is behind or ahead, not wrong
    RoundLag,
    /// Same round but different signatures
    SignatureMismatch,
}

impl BeaconValue {
    /// Compare against a reference. Equal rounds imply equal signatures;
    /// a round mismatch alone is only lag.
    pub fn agreement_with(&self, reference: &BeaconValue) -> Agreement {
        if self.round != reference.round {
            Agreement::RoundLag
        } else if self.signature != reference.signature {
            Agreement::SignatureMismatch
        } else {
            Agreement::Consistent
        }
    }
}

/// Membership change requested for a resharing round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshareSpec {
    /// Current-group nodes to keep, by index
    pub retain: Vec<NodeIndex>,
    /// Threshold of the new group
    pub threshold: usize,
}

impl ReshareSpec {
    /// Create a resharing spec
    pub fn new(retain: Vec<NodeIndex>, threshold: usize) -> Self {
        Self { retain, threshold }
    }

    /// Retain every current node except the given ones
    pub fn dropping(current: &[NodeIndex], drop: &[NodeIndex], threshold: usize) -> Self {
        let retain = current
            .iter()
            .copied()
            .filter(|idx| !drop.contains(idx))
            .collect();
        Self { retain, threshold }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(round: u64, sig: &[u8]) -> BeaconValue {
        BeaconValue {
            round,
            signature: sig.to_vec(),
            randomness: Vec::new(),
        }
    }

    #[test]
    fn test_agreement() {
        let reference = beacon(5, &[1, 2, 3]);

        assert_eq!(beacon(5, &[1, 2, 3]).agreement_with(&reference), Agreement::Consistent);
        assert_eq!(beacon(4, &[9, 9]).agreement_with(&reference), Agreement::RoundLag);
        assert_eq!(
            beacon(5, &[1, 2, 4]).agreement_with(&reference),
            Agreement::SignatureMismatch
        );
    }

    #[test]
    fn test_beacon_json_shape() {
        let value: BeaconValue =
            serde_json::from_str(r#"{"round": 12, "signature": "a1b2", "extra": true}"#).unwrap();
        assert_eq!(value.round, 12);
        assert_eq!(value.signature, vec![0xa1, 0xb2]);
        assert!(value.randomness.is_empty());
    }

    #[test]
    fn test_group_equivalence_ignores_membership() {
        let old = Group {
            nodes: vec![
                GroupMember { index: 1, address: "a".into() },
                GroupMember { index: 2, address: "b".into() },
            ],
            threshold: 2,
            public_key: vec![7; 33],
            period_secs: 2,
            genesis_time: 100,
            transition_time: None,
            beacon_id: "default".into(),
        };
        let mut reshared = old.clone();
        reshared.nodes.push(GroupMember { index: 4, address: "d".into() });
        reshared.threshold = 3;
        reshared.transition_time = Some(140);

        assert!(old.is_equivalent(&reshared));
        reshared.public_key[0] = 8;
        assert!(!old.is_equivalent(&reshared));
    }

    #[test]
    fn test_group_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.json");
        let group = Group {
            nodes: vec![GroupMember { index: 1, address: "127.0.0.1:1".into() }],
            threshold: 1,
            public_key: vec![2; 33],
            period_secs: 3,
            genesis_time: 1_700_000_000,
            transition_time: Some(1_700_000_030),
            beacon_id: "default".into(),
        };

        group.save(&path).unwrap();
        assert_eq!(Group::load(&path).unwrap(), group);
    }

    #[test]
    fn test_reshare_spec_dropping() {
        let spec = ReshareSpec::dropping(&[1, 2, 3], &[3], 3);
        assert_eq!(spec.retain, vec![1, 2]);
        assert_eq!(spec.threshold, 3);
    }
}
