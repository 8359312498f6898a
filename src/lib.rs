//! Privacy-preserving crowdsourcing: submitters encrypt answers under the requester's ElGamal
//! key, a chain of randomizers re-encrypts each one in a fixed order with an interactive proof
//! per step, and the requester verifies the chain before decrypting and aggregating.

pub mod blob_store;
pub mod commitment;
pub mod config;
pub mod crypto_serde;
pub mod elgamal;
pub mod ledger;
pub mod logging;
pub mod network;
pub mod proof;
pub mod queue;
pub mod randomizer;
pub mod requester;
pub mod sequencer;
pub mod submitter;
pub mod task;
pub mod tokio_tools;

#[cfg(test)]
pub mod test_utils;

pub use config::CrowdConfig;
