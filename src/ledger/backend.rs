use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use super::calls::Transaction;
use super::events::{LedgerEvent, SubtaskFinalResult};
use super::types::{Address, Nonce, PendingTransaction, RandomizerId, SubtaskId, TransactionReceipt, TxHash};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("nonce mismatch for {address}: expected {expected}, got {actual}")]
    NonceMismatch {
        address: Address,
        expected: Nonce,
        actual: Nonce,
    },

    #[error("unknown subtask {0}")]
    UnknownSubtask(SubtaskId),

    #[error("subtask {0} has no finished chain yet")]
    IncompleteSubtask(SubtaskId),

    #[error("ledger transport error: {0}")]
    Transport(String),
}

/// Read-only ledger queries and the event feed. These bypass the sequencer.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Fixed randomizer order for a subtask; empty until selection is finalized.
    async fn selected_randomizers(&self, subtask_id: SubtaskId) -> Result<Vec<RandomizerId>, LedgerError>;

    async fn final_result(&self, subtask_id: SubtaskId) -> Result<SubtaskFinalResult, LedgerError>;

    async fn registered_randomizers(&self) -> Result<Vec<RandomizerId>, LedgerError>;

    /// Every event emitted so far, in emission order. Used to catch up after a lagged feed.
    async fn past_events(&self) -> Result<Vec<LedgerEvent>, LedgerError>;

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent>;
}

/// Account-level write surface used by the transaction sequencer.
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    /// Next nonce the ledger expects from `address`.
    async fn transaction_count(&self, address: &Address) -> Result<Nonce, LedgerError>;

    async fn send_transaction(&self, transaction: Transaction) -> Result<PendingTransaction, LedgerError>;

    /// `None` while the transaction is not yet confirmed.
    async fn receipt(&self, hash: &TxHash) -> Result<Option<TransactionReceipt>, LedgerError>;
}
