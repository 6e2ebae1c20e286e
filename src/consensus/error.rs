use thiserror::Error;

use super::message::NodeId;

/// Errors surfaced by the round controller and the message handler.
///
/// These are per-node conditions; none of them is fatal to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// The fault bound or protocol variant cannot work for this network size.
    #[error("invalid configuration (n = {n}, f = {f}): {reason}")]
    Configuration { n: usize, f: usize, reason: String },

    /// The node was stopped and rejects all further protocol activity.
    #[error("killed")]
    Stopped,

    /// The node is faulty and does not take part in the protocol.
    #[error("faulty")]
    Faulty,

    #[error("consensus already started")]
    AlreadyStarted,

    #[error("unknown sender {0}")]
    UnknownSender(NodeId),

    #[error("round {0} is out of range")]
    InvalidRound(u64),

    #[error("bad signature on message from {0}")]
    BadSignature(NodeId),

    /// The node's worker task is gone.
    #[error("node worker unavailable")]
    WorkerUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("connection to node {0} closed")]
    Closed(NodeId),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] ConsensusError),
}
