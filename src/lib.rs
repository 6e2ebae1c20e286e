pub mod common;
pub mod consensus;
pub mod network;

pub use consensus::{
    ConsensusConfig, ConsensusError, ConsensusProcessor, Message, NodeStateSnapshot, NodeStatus,
    Value, Vote,
};
pub use network::{
    Envelope, HandlerResult, LocalCluster, LocalNetwork, Node, NodeHandle, Readiness, Transport,
};
