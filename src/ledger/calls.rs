use serde::{Deserialize, Serialize};

use super::types::{Address, ContentPointer, Nonce, RandomizerId, SubtaskId};
use crate::commitment::Commitment;

/// Ledger write operations understood by the crowdsourcing contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum LedgerCall {
    RegisterRandomizer {
        randomizer_id: RandomizerId,
    },
    SubmitSubtaskAnswer {
        subtask_id: SubtaskId,
        commitment: Commitment,
        pointer: ContentPointer,
        aux_randomness: u64,
    },
    EncryptSubtaskAnswer {
        subtask_id: SubtaskId,
        commitment: Commitment,
        pointer: ContentPointer,
    },
}

impl LedgerCall {
    /// Contract function name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            LedgerCall::RegisterRandomizer { .. } => "registerRandomizer",
            LedgerCall::SubmitSubtaskAnswer { .. } => "submitSubTaskAnswer",
            LedgerCall::EncryptSubtaskAnswer { .. } => "encryptSubTaskAnswer",
        }
    }

    pub fn subtask_id(&self) -> Option<SubtaskId> {
        match self {
            LedgerCall::RegisterRandomizer { .. } => None,
            LedgerCall::SubmitSubtaskAnswer { subtask_id, .. }
            | LedgerCall::EncryptSubtaskAnswer { subtask_id, .. } => Some(*subtask_id),
        }
    }
}

/// A call bound to its sender and sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub nonce: Nonce,
    pub call: LedgerCall,
}
