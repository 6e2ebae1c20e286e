use crate::common::crypto::Pubkey;

use super::message::NodeId;

/// Cluster membership. A node's id is its index in `members`.
#[derive(Debug, Clone)]
pub struct Peers {
    pub members: Vec<Pubkey>,
}

impl Peers {
    pub fn new(members: Vec<Pubkey>) -> Self {
        Peers { members }
    }

    pub fn get(&self, id: NodeId) -> Option<&Pubkey> {
        self.members.get(id)
    }

    /// Every node id except `id`.
    pub fn others(&self, id: NodeId) -> impl Iterator<Item = NodeId> {
        (0..self.members.len()).filter(move |peer| *peer != id)
    }
}
