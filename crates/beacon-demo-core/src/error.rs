//! Error types for cluster orchestration

use crate::types::NodeIndex;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

/// A single participant's abnormal termination during a protocol round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantFailure {
    /// Index of the failing node
    pub index: NodeIndex,
    /// Rendered error reported by the node
    pub reason: String,
}

impl std::fmt::Display for ParticipantFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {}: {}", self.index, self.reason)
    }
}

fn render_failures(failures: &[ParticipantFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while driving a beacon cluster
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid cluster configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Threshold requirements not met
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// A required artifact (certificate, public key, group file) could not be written
    #[error("Cannot write artifact {path:?}: {reason}")]
    Artifact { path: PathBuf, reason: String },

    /// Not every node answered a ping before the startup deadline
    #[error("Nodes {unreachable:?} did not answer ping within {waited:?}")]
    StartupTimeout {
        waited: Duration,
        unreachable: Vec<NodeIndex>,
    },

    /// A node process refused to start
    #[error("Cannot start node {index}: {reason}")]
    NodeStart { index: NodeIndex, reason: String },

    /// A restarted node never answered a ping
    #[error("Node {index} did not come back after {attempts} ping attempts")]
    RestartFailed { index: NodeIndex, attempts: u32 },

    /// No node with this index exists in the roster
    #[error("Unknown node index: {0}")]
    UnknownNode(NodeIndex),

    /// The round leader is not accepting participants yet
    #[error("Leader {0} is not reachable")]
    LeaderUnreachable(String),

    /// One or more participants of a protocol round failed
    #[error("{round} round failed: {}", render_failures(.failures))]
    RoundFailed {
        round: &'static str,
        failures: Vec<ParticipantFailure>,
    },

    /// Two nodes report different collective public keys
    #[error("Node {index} has a different collective key than node {reference}")]
    KeyMismatch { index: NodeIndex, reference: NodeIndex },

    /// Resharing produced a different collective public key
    #[error("Reshared group has collective key {new} instead of {old}")]
    ReshareKeyChanged { old: String, new: String },

    /// Two nodes serve different signatures for the same round
    #[error("Inconsistent beacon signature for round {round} between node {index} and node {reference}")]
    BeaconMismatch {
        round: u64,
        index: NodeIndex,
        reference: NodeIndex,
    },

    /// The public HTTP API served another round than the one requested
    #[error("Node {index} served round {actual} over HTTP instead of {expected}")]
    PublicRoundMismatch {
        index: NodeIndex,
        expected: u64,
        actual: u64,
    },

    /// The public HTTP API and the control interface disagree on a signature
    #[error("Node {index} serves a different signature for round {round} over HTTP than over its control interface")]
    PublicSignatureMismatch { index: NodeIndex, round: u64 },

    /// The public HTTP API never returned a usable body
    #[error("Node {index} public API unavailable after {attempts} attempts")]
    PublicUnavailable { index: NodeIndex, attempts: u32 },

    /// The requested round has not been produced yet
    #[error("Beacon round {0} not produced yet")]
    BeaconNotReady(u64),

    /// The node is not running
    #[error("Node {0} is stopped")]
    NodeStopped(NodeIndex),

    /// Control-plane command failed
    #[error("Node error: {0}")]
    Node(String),

    /// Public HTTP request failed
    #[error("HTTP error: {0}")]
    Http(String),

    /// Timeout waiting for an operation
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a protocol invariant violation rather than an
    /// operational failure. Invariant violations are never retried.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::KeyMismatch { .. }
                | Error::ReshareKeyChanged { .. }
                | Error::BeaconMismatch { .. }
                | Error::PublicRoundMismatch { .. }
                | Error::PublicSignatureMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_failed_lists_every_participant() {
        let err = Error::RoundFailed {
            round: "DKG",
            failures: vec![
                ParticipantFailure {
                    index: 2,
                    reason: "timeout".into(),
                },
                ParticipantFailure {
                    index: 3,
                    reason: "refused".into(),
                },
            ],
        };

        let rendered = err.to_string();
        assert!(rendered.contains("node 2: timeout"));
        assert!(rendered.contains("node 3: refused"));
    }

    #[test]
    fn test_invariant_classification() {
        assert!(Error::BeaconMismatch {
            round: 4,
            index: 1,
            reference: 2
        }
        .is_invariant_violation());
        assert!(Error::ReshareKeyChanged {
            old: "aa".into(),
            new: "bb".into()
        }
        .is_invariant_violation());
        assert!(!Error::Timeout("ping".into()).is_invariant_violation());
        assert!(!Error::BeaconNotReady(7).is_invariant_violation());
    }

    #[test]
    fn test_json_errors_classified_as_deserialization() {
        let err: Error = serde_json::from_str::<u64>("not json").unwrap_err().into();
        assert!(matches!(err, Error::Deserialization(_)));
    }
}
