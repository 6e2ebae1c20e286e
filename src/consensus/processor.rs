use std::collections::HashMap;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    config::{ConsensusConfig, FaultMode, Variant},
    error::ConsensusError,
    message::{Message, NodeId, Phase, Value, Vote},
    store::{BallotBox, Tally},
};

/*
    Each round k has two phases. A node proposes its estimate x and waits for
    n - f proposals. If more than n / 2 of the whole network proposed the same
    value v it announces Decide(k, v), otherwise Decide(k, ?). It then waits
    for n - f Decide messages: f + 1 matching Decide(k, v) commit v. Failing
    that, it adopts the value most Decide messages carried, or a coin flip
    when all were "?", and moves on to round k + 1.
*/

pub struct ConsensusProcessor {
    pub id: NodeId,
    pub config: ConsensusConfig,
    pub initial_value: Value,
    pub faulty: bool,
    pub killed: bool,
    pub stage: Stage,
    pub state: ConsensusState,
    pub ballots: BallotBox,
    /// Highest round per phase already answered by a decided or random-fault node.
    answered: HashMap<Phase, u64>,
    rng: StdRng,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Propose,
    Decide,
    Decided,
    /// Hit the iteration cap without deciding.
    Exhausted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsensusState {
    pub round: u64,
    pub value: Value,
    pub decided: bool,
    pub decided_round: Option<u64>,
    pub messages_received: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Recipient {
    /// Every node but the sender.
    Peers,
    Node(NodeId),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Outbound {
    pub to: Recipient,
    pub message: Message,
}

/// Messages a single transition wants sent.
#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<Outbound>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Live,
    Faulty,
}

/// What `getState` reports. Every field but `status` is `None` for a faulty node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeStateSnapshot {
    pub node_id: Option<NodeId>,
    pub value: Option<Value>,
    pub round: Option<u64>,
    pub decided: Option<bool>,
    pub messages_received: Option<u64>,
    pub status: NodeStatus,
}

impl ConsensusState {
    fn new(value: Value) -> Self {
        ConsensusState {
            round: 0,
            value,
            decided: false,
            decided_round: None,
            messages_received: 0,
        }
    }
}

impl Step {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    fn broadcast(&mut self, message: Message) {
        self.outbound.push(Outbound {
            to: Recipient::Peers,
            message,
        });
    }

    fn send_to(&mut self, peer: NodeId, message: Message) {
        self.outbound.push(Outbound {
            to: Recipient::Node(peer),
            message,
        });
    }
}

impl NodeStateSnapshot {
    fn faulty() -> Self {
        NodeStateSnapshot {
            node_id: None,
            value: None,
            round: None,
            decided: None,
            messages_received: None,
            status: NodeStatus::Faulty,
        }
    }
}

impl ConsensusProcessor {
    pub fn new(id: NodeId, config: ConsensusConfig, initial_value: Value, faulty: bool) -> Self {
        let rng = match config.seed {
            Some(seed) => {
                let salt = (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                StdRng::seed_from_u64(seed ^ salt)
            }
            None => StdRng::from_entropy(),
        };

        ConsensusProcessor {
            id,
            config,
            initial_value,
            faulty,
            killed: false,
            stage: Stage::Idle,
            state: ConsensusState::new(initial_value),
            ballots: BallotBox::new(),
            answered: HashMap::new(),
            rng,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn start(&mut self) -> Result<Step, ConsensusError> {
        if self.killed {
            return Err(ConsensusError::Stopped);
        }
        self.config.validate()?;
        if self.faulty {
            warn!(node = self.id, "faulty node asked to start");
            return Err(ConsensusError::Faulty);
        }
        if self.stage != Stage::Idle {
            return Err(ConsensusError::AlreadyStarted);
        }

        self.state.round = 1;
        self.state.value = self.initial_value;
        self.state.decided = false;
        self.stage = Stage::Propose;
        info!(target: "consensus", node = self.id, value = ?self.state.value, "starting consensus");

        let mut step = Step::default();
        self.cast(Phase::Propose, Vote::Value(self.state.value), &mut step);
        self.advance(&mut step);
        Ok(step)
    }

    pub fn handle_message(
        &mut self,
        sender: NodeId,
        message: Message,
    ) -> Result<Step, ConsensusError> {
        if self.killed {
            return Err(ConsensusError::Stopped);
        }
        if self.faulty {
            return match self.config.fault_mode {
                FaultMode::Crash => Err(ConsensusError::Faulty),
                FaultMode::Random => Ok(self.equivocate(message)),
            };
        }
        if sender >= self.config.n {
            return Err(ConsensusError::UnknownSender(sender));
        }
        let round = message.round();
        if round == 0 || self.config.max_rounds.is_some_and(|max| round > max) {
            return Err(ConsensusError::InvalidRound(round));
        }
        if self.stage != Stage::Decided && round > self.lookahead_ceiling() {
            debug!(node = self.id, sender, round, "vote too far ahead of the current round");
            return Err(ConsensusError::InvalidRound(round));
        }

        self.state.messages_received += 1;
        debug!(node = self.id, sender, ?message, "received");

        let mut step = Step::default();
        if self.stage == Stage::Decided {
            self.relay_decision(message, &mut step);
            return Ok(step);
        }

        if round < self.retention_floor() {
            debug!(node = self.id, sender, round, "vote older than the retained rounds dropped");
            return Ok(step);
        }
        self.ballots.record(round, message.phase(), sender, message.vote());

        if round == self.state.round {
            self.advance(&mut step);
        }
        Ok(step)
    }

    /// Resets the round state and takes the node out of the protocol for good.
    pub fn stop(&mut self) {
        self.killed = true;
        self.faulty = true;
        self.stage = Stage::Idle;
        self.state = ConsensusState::new(self.initial_value);
        self.ballots.clear();
        self.answered.clear();
        info!(target: "consensus", node = self.id, "stopped");
    }

    pub fn snapshot(&self) -> NodeStateSnapshot {
        if self.faulty {
            return NodeStateSnapshot::faulty();
        }

        NodeStateSnapshot {
            node_id: Some(self.id),
            value: Some(self.state.value),
            round: Some(self.state.round),
            decided: Some(self.state.decided),
            messages_received: Some(self.state.messages_received),
            status: NodeStatus::Live,
        }
    }

    pub fn status(&self) -> NodeStatus {
        if self.faulty {
            NodeStatus::Faulty
        } else {
            NodeStatus::Live
        }
    }

    pub fn decision(&self) -> Option<Value> {
        self.state.decided.then_some(self.state.value)
    }

    /// True once the node will not start another round on its own.
    pub fn is_settled(&self) -> bool {
        self.faulty || matches!(self.stage, Stage::Decided | Stage::Exhausted)
    }

    /// Highest future round whose votes are buffered.
    fn lookahead_ceiling(&self) -> u64 {
        self.state.round.max(1).saturating_add(self.config.future_rounds)
    }

    /// Records that `(round, phase)` got an answer. False if that round, or
    /// a later one, already did.
    fn mark_answered(&mut self, round: u64, phase: Phase) -> bool {
        let last = self.answered.entry(phase).or_insert(0);
        if round <= *last {
            return false;
        }
        *last = round;
        true
    }

    fn retention_floor(&self) -> u64 {
        self.state.round.saturating_sub(self.config.retained_rounds)
    }

    /// Counts our own vote locally and sends it to everyone else.
    fn cast(&mut self, phase: Phase, vote: Vote, step: &mut Step) {
        let round = self.state.round;
        self.ballots.record(round, phase, self.id, vote);
        if self.config.n > 1 {
            if let Some(message) = Message::for_phase(phase, round, vote) {
                step.broadcast(message);
            }
        }
    }

    fn advance(&mut self, step: &mut Step) {
        loop {
            let progressed = match self.stage {
                Stage::Propose => self.check_majority(step),
                Stage::Decide => self.finalize(step),
                Stage::Idle | Stage::Decided | Stage::Exhausted => false,
            };
            if !progressed {
                break;
            }
        }
    }

    fn check_majority(&mut self, step: &mut Step) -> bool {
        let round = self.state.round;
        if self.ballots.voters(round, Phase::Propose) < self.config.quorum() {
            return false;
        }

        let tally = self.ballots.tally(round, Phase::Propose);
        let majority = tally.strict_majority(self.config.n);
        info!(
            target: "consensus",
            node = self.id, round, zeros = tally.zeros, ones = tally.ones, ?majority,
            "propose quorum reached"
        );

        match self.config.variant {
            Variant::TwoPhase => {
                self.stage = Stage::Decide;
                self.cast(Phase::Decide, majority.map_or(Vote::Undecided, Vote::Value), step);
                true
            }
            Variant::MajorityOnly => match majority {
                Some(value) => {
                    self.commit(value);
                    false
                }
                None => {
                    let value = self.fallback(tally);
                    self.next_round(value, step)
                }
            },
        }
    }

    fn finalize(&mut self, step: &mut Step) -> bool {
        let round = self.state.round;
        if self.ballots.voters(round, Phase::Decide) < self.config.quorum() {
            return false;
        }

        let tally = self.ballots.tally(round, Phase::Decide);
        let threshold = self.config.confirmation_threshold();
        if tally.ones >= threshold {
            self.commit(Value::One);
            return false;
        }
        if tally.zeros >= threshold {
            self.commit(Value::Zero);
            return false;
        }

        let value = self.fallback(tally);
        debug!(
            node = self.id, round, zeros = tally.zeros, ones = tally.ones,
            undecided = tally.undecided, ?value, "no confirmation"
        );
        self.next_round(value, step)
    }

    /// Majority of the binary votes, ties to one; a fair coin if there are none.
    fn fallback(&mut self, tally: Tally) -> Value {
        match tally.binary_majority() {
            Some(value) => value,
            None => Value::from_bit(self.rng.gen_bool(0.5)),
        }
    }

    fn next_round(&mut self, value: Value, step: &mut Step) -> bool {
        self.state.value = value;
        let next = self.state.round + 1;
        if self.config.max_rounds.is_some_and(|max| next > max) {
            warn!(
                target: "consensus",
                node = self.id, round = self.state.round, ?value,
                "iteration cap reached without a decision"
            );
            self.stage = Stage::Exhausted;
            return false;
        }

        self.state.round = next;
        self.ballots.prune_before(self.retention_floor());
        self.stage = Stage::Propose;
        info!(target: "consensus", node = self.id, round = next, ?value, "advancing round");
        self.cast(Phase::Propose, Vote::Value(value), step);
        true
    }

    fn commit(&mut self, value: Value) {
        self.state.value = value;
        self.state.decided = true;
        self.state.decided_round = Some(self.state.round);
        self.stage = Stage::Decided;
        info!(target: "consensus", node = self.id, round = self.state.round, ?value, "decided");
    }

    /// A decided node stays at its round but answers later-round traffic with
    /// its decided value, once per phase for each newer round it hears of, so
    /// lagging peers can still gather a quorum.
    fn relay_decision(&mut self, message: Message, step: &mut Step) {
        let round = message.round();
        let decided_round = match self.state.decided_round {
            Some(decided_round) => decided_round,
            None => return,
        };
        if round <= decided_round || !self.mark_answered(round, message.phase()) {
            return;
        }
        let vote = Vote::Value(self.state.value);
        if let Some(reply) = Message::for_phase(message.phase(), round, vote) {
            debug!(node = self.id, round, phase = ?message.phase(), "relaying decision");
            step.broadcast(reply);
        }
    }

    /// Random-fault behaviour: answer the first message of each newer round
    /// and phase with an independent random vote for every peer.
    fn equivocate(&mut self, message: Message) -> Step {
        let mut step = Step::default();
        let round = message.round();
        let phase = message.phase();
        if !self.mark_answered(round, phase) {
            return step;
        }

        for peer in (0..self.config.n).filter(|peer| *peer != self.id) {
            let vote = match phase {
                Phase::Propose => Vote::Value(Value::from_bit(self.rng.gen_bool(0.5))),
                Phase::Decide => match self.rng.gen_range(0..3) {
                    0 => Vote::Value(Value::Zero),
                    1 => Vote::Value(Value::One),
                    _ => Vote::Undecided,
                },
            };
            if let Some(message) = Message::for_phase(phase, round, vote) {
                step.send_to(peer, message);
            }
        }
        step
    }
}
