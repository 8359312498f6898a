//! Process configuration, built once and handed to every component.

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::elgamal::KeyGenParams;
use crate::randomizer::{ProofStoreConfig, RandomizerConfig};
use crate::requester::RequesterConfig;
use crate::sequencer::SequencerConfig;

/// Parameters every participant of a round has to agree on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub key_bits: u64,
    pub primality_confidence: u32,
    pub keygen_max_attempts: usize,
    pub randomizers_per_subtask: usize,
    pub subtask_count: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let keygen = KeyGenParams::default();
        Self {
            key_bits: keygen.bits,
            primality_confidence: keygen.confidence,
            keygen_max_attempts: keygen.max_attempts,
            randomizers_per_subtask: 3,
            subtask_count: 10,
        }
    }
}

impl ProtocolConfig {
    pub fn with_key_bits(mut self, bits: u64) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn with_randomizers_per_subtask(mut self, count: usize) -> Self {
        self.randomizers_per_subtask = count;
        self
    }

    pub fn with_subtask_count(mut self, count: usize) -> Self {
        self.subtask_count = count;
        self
    }
}

/// Local knobs of one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub proof_session_timeout: Duration,
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub task_pull_timeout: Duration,
    pub sequencer: SequencerConfig,
    pub proof_store: ProofStoreConfig,
    pub event_queue_capacity: usize,
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub sweep_interval: Duration,
    /// How long the requester waits for chains before closing the round with what it has.
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub round_deadline: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            proof_session_timeout: Duration::from_secs(10),
            task_pull_timeout: Duration::from_secs(10),
            sequencer: SequencerConfig::default(),
            proof_store: ProofStoreConfig::default(),
            event_queue_capacity: 1024,
            sweep_interval: Duration::from_secs(30),
            round_deadline: Duration::from_secs(600),
        }
    }
}

impl NodeConfig {
    pub fn with_proof_session_timeout(mut self, timeout: Duration) -> Self {
        self.proof_session_timeout = timeout;
        self
    }

    pub fn with_task_pull_timeout(mut self, timeout: Duration) -> Self {
        self.task_pull_timeout = timeout;
        self
    }

    pub fn with_sequencer(mut self, sequencer: SequencerConfig) -> Self {
        self.sequencer = sequencer;
        self
    }

    pub fn with_proof_store(mut self, proof_store: ProofStoreConfig) -> Self {
        self.proof_store = proof_store;
        self
    }

    pub fn with_round_deadline(mut self, deadline: Duration) -> Self {
        self.round_deadline = deadline;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrowdConfig {
    pub protocol: ProtocolConfig,
    pub node: NodeConfig,
}

impl CrowdConfig {
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }

    /// Missing fields fall back to their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.protocol.key_bits >= 16, "key_bits must be at least 16");
        ensure!(self.protocol.randomizers_per_subtask >= 1, "randomizers_per_subtask must be positive");
        ensure!(self.protocol.subtask_count >= 1, "subtask_count must be positive");
        ensure!(self.node.event_queue_capacity >= 1, "event_queue_capacity must be positive");
        ensure!(self.node.sequencer.max_submit_attempts >= 1, "max_submit_attempts must be positive");
        ensure!(!self.node.round_deadline.is_zero(), "round_deadline must be positive");
        Ok(())
    }

    pub fn keygen_params(&self) -> KeyGenParams {
        KeyGenParams::new(self.protocol.key_bits)
            .with_confidence(self.protocol.primality_confidence)
            .with_max_attempts(self.protocol.keygen_max_attempts)
    }

    pub fn randomizer_config(&self) -> RandomizerConfig {
        RandomizerConfig {
            event_queue_capacity: self.node.event_queue_capacity,
            sweep_interval: self.node.sweep_interval,
            proof_store: self.node.proof_store.clone(),
        }
    }

    pub fn requester_config(&self) -> RequesterConfig {
        RequesterConfig {
            event_queue_capacity: self.node.event_queue_capacity,
            task_pull_timeout: self.node.task_pull_timeout,
            round_deadline: self.node.round_deadline,
        }
    }
}
