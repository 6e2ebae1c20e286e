use serde::{Deserialize, Serialize};
use sha2::{Digest as ShaDigest, Sha512};

use crate::common::crypto::Digest;

/*
    Every message is stamped with the sender's round number k and a phase.
    In the Propose phase a node announces its current estimate x. In the
    Decide phase it announces either the value that a strict majority of the
    proposals it collected agreed on, or "?" when no such majority formed.
*/

pub type NodeId = usize;

pub trait Hashable {
    fn hash(&self) -> Digest;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Zero,
    One,
}

/// A vote as stored in the ballot box: a binary value or the undecided marker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Value(Value),
    Undecided,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Propose,
    Decide,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Message {
    Propose(Propose),
    Decide(Decide),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Propose {
    pub round: u64,
    pub value: Value,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Decide {
    pub round: u64,
    pub vote: Vote,
}

impl Value {
    pub fn from_bit(bit: bool) -> Self {
        if bit {
            Value::One
        } else {
            Value::Zero
        }
    }
}

impl Message {
    pub fn propose(round: u64, value: Value) -> Self {
        Message::Propose(Propose { round, value })
    }

    pub fn decide(round: u64, vote: Vote) -> Self {
        Message::Decide(Decide { round, vote })
    }

    /// Builds a message of the given phase. A Propose can only carry a
    /// binary value, so an undecided vote is never turned into one.
    pub fn for_phase(phase: Phase, round: u64, vote: Vote) -> Option<Self> {
        match (phase, vote) {
            (Phase::Propose, Vote::Value(value)) => Some(Message::propose(round, value)),
            (Phase::Propose, Vote::Undecided) => None,
            (Phase::Decide, vote) => Some(Message::decide(round, vote)),
        }
    }

    pub fn round(&self) -> u64 {
        match self {
            Message::Propose(propose) => propose.round,
            Message::Decide(decide) => decide.round,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Message::Propose(_) => Phase::Propose,
            Message::Decide(_) => Phase::Decide,
        }
    }

    pub fn vote(&self) -> Vote {
        match self {
            Message::Propose(propose) => Vote::Value(propose.value),
            Message::Decide(decide) => decide.vote,
        }
    }
}

impl AsRef<[u8]> for Phase {
    fn as_ref(&self) -> &[u8] {
        match self {
            Phase::Propose => &[1u8],
            Phase::Decide => &[2u8],
        }
    }
}

impl AsRef<[u8]> for Vote {
    fn as_ref(&self) -> &[u8] {
        match self {
            Vote::Value(Value::Zero) => &[0u8],
            Vote::Value(Value::One) => &[1u8],
            Vote::Undecided => &[2u8],
        }
    }
}

impl Hashable for Message {
    fn hash(&self) -> Digest {
        let mut hasher = Sha512::new();
        hasher.update(self.round().to_be_bytes());
        hasher.update(self.phase().as_ref());
        hasher.update(self.vote().as_ref());
        let result = hasher.finalize();
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&result[..]);
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_propose_never_carries_undecided() {
        assert_eq!(Message::for_phase(Phase::Propose, 3, Vote::Undecided), None);
        assert_eq!(
            Message::for_phase(Phase::Propose, 3, Vote::Value(Value::One)),
            Some(Message::propose(3, Value::One))
        );
        assert_eq!(
            Message::for_phase(Phase::Decide, 3, Vote::Undecided),
            Some(Message::decide(3, Vote::Undecided))
        );
    }

    #[test]
    fn test_hash_distinguishes_phase_and_vote() {
        let propose = Message::propose(1, Value::Zero);
        let decide = Message::decide(1, Vote::Value(Value::Zero));
        let undecided = Message::decide(1, Vote::Undecided);

        assert_ne!(propose.hash(), decide.hash());
        assert_ne!(decide.hash(), undecided.hash());
        assert_eq!(propose.hash(), Message::propose(1, Value::Zero).hash());
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(Message::decide(2, Vote::Undecided)).unwrap();
        assert_eq!(json["kind"], "decide");
        assert_eq!(json["round"], 2);
        assert_eq!(json["vote"], "undecided");
    }
}
