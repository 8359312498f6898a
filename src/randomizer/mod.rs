//! Randomizer role: re-encrypt answers in chain order and prove each step on request.

pub mod proof_store;
pub mod service;
pub mod state;

pub use proof_store::{ProofStore, ProofStoreConfig};
pub use service::{RandomizerConfig, RandomizerNode};
pub use state::{Membership, Phase, ReEncryptJob, TurnTracker};

const LOG_TARGET: &str = "legit_crowd::randomizer";
