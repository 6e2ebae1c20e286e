pub mod local;
pub mod node;

pub use local::*;
pub use node::*;

use async_trait::async_trait;

use crate::{
    common::crypto::Signature,
    consensus::{ConsensusError, Message, NodeId, TransportError},
};

/*
    Links are point-to-point and may drop, duplicate or reorder messages.
    A "broadcast" is the sender handing the same envelope to every other
    node; a node counts its own vote locally instead of sending to itself.
    Senders are identified by the signature on the envelope, not by the link
    the envelope arrived on.
*/

#[derive(Clone, Debug)]
pub struct Envelope {
    pub sender: NodeId,
    pub message: Message,
    pub sig: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Accepted,
    Rejected(ConsensusError),
}

impl HandlerResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, HandlerResult::Accepted)
    }
}

impl<T> From<Result<T, ConsensusError>> for HandlerResult {
    fn from(result: Result<T, ConsensusError>) -> Self {
        match result {
            Ok(_) => HandlerResult::Accepted,
            Err(err) => HandlerResult::Rejected(err),
        }
    }
}

/// Point-to-point delivery. Address resolution is up to the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), TransportError>;
}

/// Whether every peer is up and able to receive messages.
pub trait Readiness: Send + Sync {
    fn is_network_ready(&self) -> bool;
}

impl<F> Readiness for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_network_ready(&self) -> bool {
        self()
    }
}
