use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use super::error::{ConfigError, ConsensusError};

pub const DEFAULT_MAX_ROUNDS: u64 = 10;
pub const DEFAULT_FUTURE_ROUNDS: u64 = 4;

/// Which round structure the processor runs.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Propose, then confirm with a Decide round before committing.
    #[default]
    TwoPhase,
    /// Commit straight from a Propose majority. Only sound with no faults.
    MajorityOnly,
}

/// How a node constructed as faulty behaves on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultMode {
    /// Never sends anything.
    #[default]
    Crash,
    /// Answers traffic with random votes, a different one per recipient.
    Random,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub n: usize,
    pub f: usize,
    /// Iteration cap. `None` lets a node run rounds until it decides.
    pub max_rounds: Option<u64>,
    pub variant: Variant,
    pub fault_mode: FaultMode,
    /// Seed for the coin flips; mixed with the node id so nodes differ.
    pub seed: Option<u64>,
    /// Rounds kept in the ballot box below the current one.
    pub retained_rounds: u64,
    /// Rounds past the current one whose votes are buffered; later ones are rejected.
    pub future_rounds: u64,
    pub ready_poll_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            n: 1,
            f: 0,
            max_rounds: Some(DEFAULT_MAX_ROUNDS),
            variant: Variant::TwoPhase,
            fault_mode: FaultMode::Crash,
            seed: None,
            retained_rounds: 1,
            future_rounds: DEFAULT_FUTURE_ROUNDS,
            ready_poll_ms: 50,
        }
    }
}

impl ConsensusConfig {
    pub fn new(n: usize, f: usize) -> Self {
        ConsensusConfig {
            n,
            f,
            ..Default::default()
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: Option<u64>) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_fault_mode(mut self, fault_mode: FaultMode) -> Self {
        self.fault_mode = fault_mode;
        self
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: ConsensusConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.n == 0 {
            return Err(self.invalid("network must have at least one node"));
        }
        if self.f > self.n / 2 {
            return Err(self.invalid("fault bound exceeds floor(n / 2)"));
        }
        if self.variant == Variant::MajorityOnly && self.f != 0 {
            return Err(self.invalid("majority-only variant requires f = 0"));
        }
        if self.max_rounds == Some(0) {
            return Err(self.invalid("iteration cap must be at least 1"));
        }
        Ok(())
    }

    /// Votes needed before a node acts on a phase: n - f.
    pub fn quorum(&self) -> usize {
        self.n - self.f
    }

    /// Same-value Decide votes needed to commit: f + 1.
    pub fn confirmation_threshold(&self) -> usize {
        self.f + 1
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms.max(1))
    }

    fn invalid(&self, reason: &str) -> ConsensusError {
        ConsensusError::Configuration {
            n: self.n,
            f: self.f,
            reason: reason.to_string(),
        }
    }
}
