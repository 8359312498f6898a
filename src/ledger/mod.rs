pub mod backend;
pub mod calls;
pub mod events;
pub mod memory;
pub mod types;

pub use backend::{LedgerError, LedgerReader, LedgerWriter};
pub use calls::{LedgerCall, Transaction};
pub use events::{catch_up_events, ChainEntry, LedgerEvent, SubtaskFinalResult};
pub use memory::{InMemoryLedger, InMemoryLedgerConfig};
pub use types::{
    Address, ContentPointer, Gas, Nonce, PendingTransaction, RandomizerId, ReceiptStatus,
    SubtaskId, TransactionReceipt, TxHash,
};
