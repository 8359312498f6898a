//! Requester role: hand out subtasks, verify finished chains, decrypt and aggregate answers.

pub mod aggregator;
pub mod service;
pub mod verifier;

pub use aggregator::{Aggregate, Aggregator};
pub use service::{RequesterConfig, RequesterNode};
pub use verifier::{ChainReport, ChainVerifier, EntryCheck, StepReport, StepVerdict, VerifierError};

const LOG_TARGET: &str = "legit_crowd::requester";
