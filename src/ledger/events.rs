use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::types::{ContentPointer, RandomizerId, SubtaskId};
use crate::commitment::Commitment;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LedgerEvent {
    SubTaskAnswerSubmitted {
        subtask_id: SubtaskId,
        filehash: ContentPointer,
    },
    SubTaskAnswerEncrypted {
        subtask_id: SubtaskId,
        randomizer_id: RandomizerId,
        filehash: ContentPointer,
    },
    SubTaskEncryptionCompleted {
        subtask_id: SubtaskId,
    },
}

impl LedgerEvent {
    pub fn subtask_id(&self) -> SubtaskId {
        match self {
            LedgerEvent::SubTaskAnswerSubmitted { subtask_id, .. }
            | LedgerEvent::SubTaskAnswerEncrypted { subtask_id, .. }
            | LedgerEvent::SubTaskEncryptionCompleted { subtask_id } => *subtask_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::SubTaskAnswerSubmitted { .. } => "SubTaskAnswerSubmitted",
            LedgerEvent::SubTaskAnswerEncrypted { .. } => "SubTaskAnswerEncrypted",
            LedgerEvent::SubTaskEncryptionCompleted { .. } => "SubTaskEncryptionCompleted",
        }
    }
}

/// Reduce a ledger history to what a listener needs to catch up: every event of subtasks still
/// in flight, plus the completion of every finished subtask. Emission order is kept.
pub fn catch_up_events(history: Vec<LedgerEvent>) -> Vec<LedgerEvent> {
    let finished: HashSet<SubtaskId> = history
        .iter()
        .filter_map(|event| match event {
            LedgerEvent::SubTaskEncryptionCompleted { subtask_id } => Some(*subtask_id),
            _ => None,
        })
        .collect();
    history
        .into_iter()
        .filter(|event| {
            matches!(event, LedgerEvent::SubTaskEncryptionCompleted { .. }) || !finished.contains(&event.subtask_id())
        })
        .collect()
}

/// One published `(commitment, pointer)` pair in a subtask's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub commitment: Commitment,
    pub pointer: ContentPointer,
}

/// Result of `getSubTaskFinalResult`: the submission, each re-encryption step, and the
/// fixed randomizer order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskFinalResult {
    pub initial: ChainEntry,
    pub steps: Vec<ChainEntry>,
    pub order: Vec<RandomizerId>,
}

impl SubtaskFinalResult {
    /// Initial submission followed by every step, in chain order.
    pub fn entries(&self) -> impl Iterator<Item = &ChainEntry> {
        std::iter::once(&self.initial).chain(self.steps.iter())
    }

    pub fn is_complete(&self) -> bool {
        !self.order.is_empty() && self.steps.len() == self.order.len()
    }
}
