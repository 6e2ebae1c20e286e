use std::collections::{BTreeMap, HashMap};

use super::message::{NodeId, Phase, Value, Vote};

/// Votes collected per `(round, phase)`, one per sender.
#[derive(Debug, Default)]
pub struct BallotBox {
    pub ballots: BTreeMap<(u64, Phase), HashMap<NodeId, Vote>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Tally {
    pub zeros: usize,
    pub ones: usize,
    pub undecided: usize,
}

impl BallotBox {
    pub fn new() -> Self {
        BallotBox {
            ballots: BTreeMap::new(),
        }
    }

    /// Records `vote` from `sender`, replacing any earlier vote it cast for
    /// the same round and phase. Returns true if the sender is new.
    pub fn record(&mut self, round: u64, phase: Phase, sender: NodeId, vote: Vote) -> bool {
        self.ballots
            .entry((round, phase))
            .or_default()
            .insert(sender, vote)
            .is_none()
    }

    pub fn voters(&self, round: u64, phase: Phase) -> usize {
        self.ballots
            .get(&(round, phase))
            .map_or(0, |votes| votes.len())
    }

    pub fn tally(&self, round: u64, phase: Phase) -> Tally {
        let mut tally = Tally::default();
        if let Some(votes) = self.ballots.get(&(round, phase)) {
            for vote in votes.values() {
                match vote {
                    Vote::Value(Value::Zero) => tally.zeros += 1,
                    Vote::Value(Value::One) => tally.ones += 1,
                    Vote::Undecided => tally.undecided += 1,
                }
            }
        }
        tally
    }

    /// Drops every round strictly below `round`.
    pub fn prune_before(&mut self, round: u64) {
        self.ballots = self.ballots.split_off(&(round, Phase::Propose));
    }

    pub fn clear(&mut self) {
        self.ballots.clear();
    }
}

impl Tally {
    /// The value held by more than half of all `n` nodes, if any.
    pub fn strict_majority(&self, n: usize) -> Option<Value> {
        if 2 * self.zeros > n {
            Some(Value::Zero)
        } else if 2 * self.ones > n {
            Some(Value::One)
        } else {
            None
        }
    }

    /// Majority among the binary votes only. Ties go to one; `None` when
    /// every vote was undecided.
    pub fn binary_majority(&self) -> Option<Value> {
        if self.zeros + self.ones == 0 {
            None
        } else if self.ones >= self.zeros {
            Some(Value::One)
        } else {
            Some(Value::Zero)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_vote_counts_once() {
        let mut ballots = BallotBox::new();
        assert!(ballots.record(1, Phase::Propose, 2, Vote::Value(Value::One)));
        assert!(!ballots.record(1, Phase::Propose, 2, Vote::Value(Value::One)));
        assert_eq!(ballots.voters(1, Phase::Propose), 1);

        // A later vote from the same sender replaces the earlier one.
        assert!(!ballots.record(1, Phase::Propose, 2, Vote::Value(Value::Zero)));
        let tally = ballots.tally(1, Phase::Propose);
        assert_eq!(tally, Tally { zeros: 1, ones: 0, undecided: 0 });
    }

    #[test]
    fn test_phases_are_separate() {
        let mut ballots = BallotBox::new();
        ballots.record(1, Phase::Propose, 0, Vote::Value(Value::One));
        ballots.record(1, Phase::Decide, 0, Vote::Undecided);
        ballots.record(2, Phase::Propose, 0, Vote::Value(Value::Zero));

        assert_eq!(ballots.voters(1, Phase::Propose), 1);
        assert_eq!(ballots.tally(1, Phase::Decide).undecided, 1);
        assert_eq!(ballots.tally(2, Phase::Propose).zeros, 1);
        assert_eq!(ballots.voters(3, Phase::Propose), 0);
    }

    #[test]
    fn test_prune_before() {
        let mut ballots = BallotBox::new();
        for round in 1..=4 {
            ballots.record(round, Phase::Propose, 0, Vote::Value(Value::One));
            ballots.record(round, Phase::Decide, 0, Vote::Undecided);
        }

        ballots.prune_before(3);

        assert_eq!(ballots.ballots.keys().next(), Some(&(3, Phase::Propose)));
        assert_eq!(ballots.voters(2, Phase::Decide), 0);
        assert_eq!(ballots.voters(3, Phase::Propose), 1);
        assert_eq!(ballots.voters(4, Phase::Decide), 1);
    }

    #[test]
    fn test_majorities() {
        let tally = Tally { zeros: 2, ones: 1, undecided: 0 };
        assert_eq!(tally.strict_majority(4), None);
        assert_eq!(tally.strict_majority(3), Some(Value::Zero));
        assert_eq!(tally.binary_majority(), Some(Value::Zero));

        let tie = Tally { zeros: 1, ones: 1, undecided: 1 };
        assert_eq!(tie.binary_majority(), Some(Value::One));

        let blank = Tally { zeros: 0, ones: 0, undecided: 3 };
        assert_eq!(blank.binary_majority(), None);
    }
}
