//! In-process stand-in for the crowdsourcing contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use super::backend::{LedgerError, LedgerReader, LedgerWriter};
use super::calls::{LedgerCall, Transaction};
use super::events::{ChainEntry, LedgerEvent, SubtaskFinalResult};
use super::types::{
    Address, Gas, Nonce, PendingTransaction, RandomizerId, ReceiptStatus, SubtaskId,
    TransactionReceipt, TxHash,
};

const LOG_TARGET: &str = "legit_crowd::ledger::memory";

#[derive(Clone, Debug)]
pub struct InMemoryLedgerConfig {
    pub randomizers_per_subtask: usize,
    pub receipt_delay: Duration,
    pub event_capacity: usize,
}

impl InMemoryLedgerConfig {
    pub fn new(randomizers_per_subtask: usize) -> Self {
        Self {
            randomizers_per_subtask,
            receipt_delay: Duration::from_millis(0),
            event_capacity: 1024,
        }
    }

    pub fn with_receipt_delay(mut self, delay: Duration) -> Self {
        self.receipt_delay = delay;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

impl Default for InMemoryLedgerConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[derive(Default)]
struct SubtaskRecord {
    initial: Option<ChainEntry>,
    order: Vec<RandomizerId>,
    steps: Vec<ChainEntry>,
}

struct StoredReceipt {
    receipt: TransactionReceipt,
    visible_at: Instant,
}

#[derive(Default)]
struct LedgerInner {
    nonces: HashMap<Address, Nonce>,
    randomizers: Vec<RandomizerId>,
    accounts: HashMap<Address, RandomizerId>,
    subtasks: HashMap<SubtaskId, SubtaskRecord>,
    receipts: HashMap<TxHash, StoredReceipt>,
    log: Vec<LedgerEvent>,
    block: u64,
}

pub struct InMemoryLedger {
    config: InMemoryLedgerConfig,
    inner: Mutex<LedgerInner>,
    events_tx: broadcast::Sender<LedgerEvent>,
    fail_next_sends: AtomicUsize,
    withhold_receipts: AtomicBool,
}

fn gas_for(call: &LedgerCall) -> Gas {
    match call {
        LedgerCall::RegisterRandomizer { .. } => 48_000,
        LedgerCall::SubmitSubtaskAnswer { .. } => 160_000,
        LedgerCall::EncryptSubtaskAnswer { .. } => 95_000,
    }
}

fn transaction_hash(transaction: &Transaction) -> TxHash {
    let mut hasher = Sha256::new();
    hasher.update(b"legit_crowd/tx/v1");
    hasher.update(transaction.from.as_str().as_bytes());
    hasher.update(transaction.nonce.to_be_bytes());
    hasher.update(format!("{:?}", transaction.call).as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    TxHash::new(bytes)
}

impl InMemoryLedger {
    pub fn new(config: InMemoryLedgerConfig) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            inner: Mutex::new(LedgerInner::default()),
            events_tx,
            fail_next_sends: AtomicUsize::new(0),
            withhold_receipts: AtomicBool::new(false),
        }
    }

    /// The next `count` sends fail with a transport error without touching state.
    pub fn fail_next_sends(&self, count: usize) {
        self.fail_next_sends.store(count, Ordering::SeqCst);
    }

    /// While set, receipts are never reported.
    pub fn withhold_receipts(&self, withhold: bool) {
        self.withhold_receipts.store(withhold, Ordering::SeqCst);
    }

    /// Consume a nonce of `address` out of band, as a write from another client would.
    pub fn advance_nonce(&self, address: &Address) {
        let mut inner = self.inner.lock();
        *inner.nonces.entry(address.clone()).or_insert(0) += 1;
    }

    fn execute(
        &self,
        inner: &mut LedgerInner,
        from: &Address,
        call: &LedgerCall,
        events: &mut Vec<LedgerEvent>,
    ) -> Result<(), String> {
        match call {
            LedgerCall::RegisterRandomizer { randomizer_id } => {
                if inner.randomizers.contains(randomizer_id) {
                    return Err(format!("randomizer {randomizer_id} already registered"));
                }
                if inner.accounts.contains_key(from) {
                    return Err(format!("account {from} already bound to a randomizer"));
                }
                inner.randomizers.push(*randomizer_id);
                inner.accounts.insert(from.clone(), *randomizer_id);
                Ok(())
            }
            LedgerCall::SubmitSubtaskAnswer {
                subtask_id,
                commitment,
                pointer,
                aux_randomness,
            } => {
                let wanted = self.config.randomizers_per_subtask;
                let available = inner.randomizers.len();
                if wanted == 0 || available < wanted {
                    return Err(format!(
                        "need {wanted} registered randomizers, have {available}"
                    ));
                }
                if inner
                    .subtasks
                    .get(subtask_id)
                    .map_or(false, |record| record.initial.is_some())
                {
                    return Err(format!("subtask {subtask_id} already answered"));
                }
                let start = (*aux_randomness as usize) % available;
                let order = (0..wanted)
                    .map(|offset| inner.randomizers[(start + offset) % available])
                    .collect::<Vec<_>>();
                let record = inner.subtasks.entry(*subtask_id).or_default();
                record.initial = Some(ChainEntry {
                    commitment: *commitment,
                    pointer: pointer.clone(),
                });
                record.order = order;
                events.push(LedgerEvent::SubTaskAnswerSubmitted {
                    subtask_id: *subtask_id,
                    filehash: pointer.clone(),
                });
                Ok(())
            }
            LedgerCall::EncryptSubtaskAnswer {
                subtask_id,
                commitment,
                pointer,
            } => {
                let randomizer_id = *inner
                    .accounts
                    .get(from)
                    .ok_or_else(|| format!("account {from} is not a randomizer"))?;
                let record = inner
                    .subtasks
                    .get_mut(subtask_id)
                    .filter(|record| record.initial.is_some())
                    .ok_or_else(|| format!("subtask {subtask_id} has no submission"))?;
                let expected = record
                    .order
                    .get(record.steps.len())
                    .copied()
                    .ok_or_else(|| format!("subtask {subtask_id} chain already complete"))?;
                if expected != randomizer_id {
                    return Err(format!(
                        "randomizer {randomizer_id} out of turn, expected {expected}"
                    ));
                }
                record.steps.push(ChainEntry {
                    commitment: *commitment,
                    pointer: pointer.clone(),
                });
                events.push(LedgerEvent::SubTaskAnswerEncrypted {
                    subtask_id: *subtask_id,
                    randomizer_id,
                    filehash: pointer.clone(),
                });
                if record.steps.len() == record.order.len() {
                    events.push(LedgerEvent::SubTaskEncryptionCompleted {
                        subtask_id: *subtask_id,
                    });
                }
                Ok(())
            }
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(InMemoryLedgerConfig::default())
    }
}

#[async_trait]
impl LedgerReader for InMemoryLedger {
    async fn selected_randomizers(&self, subtask_id: SubtaskId) -> Result<Vec<RandomizerId>, LedgerError> {
        let inner = self.inner.lock();
        Ok(inner
            .subtasks
            .get(&subtask_id)
            .map(|record| record.order.clone())
            .unwrap_or_default())
    }

    async fn final_result(&self, subtask_id: SubtaskId) -> Result<SubtaskFinalResult, LedgerError> {
        let inner = self.inner.lock();
        let record = inner
            .subtasks
            .get(&subtask_id)
            .ok_or(LedgerError::UnknownSubtask(subtask_id))?;
        let initial = record
            .initial
            .clone()
            .ok_or(LedgerError::UnknownSubtask(subtask_id))?;
        let result = SubtaskFinalResult {
            initial,
            steps: record.steps.clone(),
            order: record.order.clone(),
        };
        if !result.is_complete() {
            return Err(LedgerError::IncompleteSubtask(subtask_id));
        }
        Ok(result)
    }

    async fn registered_randomizers(&self) -> Result<Vec<RandomizerId>, LedgerError> {
        Ok(self.inner.lock().randomizers.clone())
    }

    async fn past_events(&self) -> Result<Vec<LedgerEvent>, LedgerError> {
        Ok(self.inner.lock().log.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events_tx.subscribe()
    }
}

#[async_trait]
impl LedgerWriter for InMemoryLedger {
    async fn transaction_count(&self, address: &Address) -> Result<Nonce, LedgerError> {
        Ok(self.inner.lock().nonces.get(address).copied().unwrap_or(0))
    }

    async fn send_transaction(&self, transaction: Transaction) -> Result<PendingTransaction, LedgerError> {
        let injected = self
            .fail_next_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LedgerError::Transport("injected send failure".into()));
        }

        let mut events = Vec::new();
        let pending = {
            let mut inner = self.inner.lock();
            let expected = inner.nonces.get(&transaction.from).copied().unwrap_or(0);
            if transaction.nonce != expected {
                return Err(LedgerError::NonceMismatch {
                    address: transaction.from.clone(),
                    expected,
                    actual: transaction.nonce,
                });
            }
            inner.nonces.insert(transaction.from.clone(), expected + 1);
            inner.block += 1;

            let hash = transaction_hash(&transaction);
            let gas = gas_for(&transaction.call);
            let status = match self.execute(&mut inner, &transaction.from, &transaction.call, &mut events) {
                Ok(()) => ReceiptStatus::Success,
                Err(reason) => {
                    debug!(
                        target: LOG_TARGET,
                        call = transaction.call.name(),
                        from = %transaction.from,
                        %reason,
                        "transaction reverted"
                    );
                    events.clear();
                    ReceiptStatus::Reverted { reason }
                }
            };
            inner.log.extend(events.iter().cloned());
            let receipt = TransactionReceipt {
                hash,
                from: transaction.from.clone(),
                nonce: transaction.nonce,
                block: inner.block,
                gas_used: gas,
                status,
            };
            inner.receipts.insert(
                hash,
                StoredReceipt {
                    receipt,
                    visible_at: Instant::now() + self.config.receipt_delay,
                },
            );
            PendingTransaction {
                hash,
                nonce: transaction.nonce,
                gas_limit: gas,
            }
        };

        for event in events {
            info!(
                target: LOG_TARGET,
                event = event.name(),
                subtask_id = event.subtask_id(),
                "emitting ledger event"
            );
            // no subscribers is fine
            let _ = self.events_tx.send(event);
        }
        Ok(pending)
    }

    async fn receipt(&self, hash: &TxHash) -> Result<Option<TransactionReceipt>, LedgerError> {
        if self.withhold_receipts.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let inner = self.inner.lock();
        Ok(inner
            .receipts
            .get(hash)
            .filter(|stored| stored.visible_at <= Instant::now())
            .map(|stored| stored.receipt.clone()))
    }
}
