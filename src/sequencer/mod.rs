//! Per-account ledger write pipeline.
//!
//! Writes are queued in issue order and submitted by a single worker that owns the local
//! nonce. Accepted writes move to a second queue where a confirmation worker waits for
//! receipts in submission order, so slow confirmations never hold up new submissions.

pub mod nonce;
mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, Span};
use uuid::Uuid;

use crate::ledger::{Address, Gas, LedgerCall, LedgerError, LedgerWriter, Nonce, TransactionReceipt, TxHash};
use crate::tokio_tools::TaskGroup;

pub use nonce::NonceTracker;
use worker::{ConfirmationWorker, SubmissionWorker, WriteRequest};

pub(crate) const LOG_TARGET: &str = "legit_crowd::sequencer";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub submit_capacity: usize,
    pub max_submit_attempts: u32,
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub retry_backoff: Duration,
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub receipt_timeout: Duration,
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub receipt_poll_interval: Duration,
}

impl SequencerConfig {
    pub fn with_max_submit_attempts(mut self, attempts: u32) -> Self {
        self.max_submit_attempts = attempts;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn with_receipt_poll_interval(mut self, interval: Duration) -> Self {
        self.receipt_poll_interval = interval;
        self
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            submit_capacity: 256,
            max_submit_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            receipt_timeout: Duration::from_secs(20),
            receipt_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Final status of one queued write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Confirmed(TransactionReceipt),
    Reverted(TransactionReceipt),
    TimedOut { hash: TxHash },
    SubmissionFailed { reason: String },
    ConfirmationFailed { hash: TxHash, reason: String },
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WriteOutcome::Confirmed(_))
    }

    pub fn receipt(&self) -> Option<&TransactionReceipt> {
        match self {
            WriteOutcome::Confirmed(receipt) | WriteOutcome::Reverted(receipt) => Some(receipt),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("sequencer is not running")]
    Stopped,

    #[error("write outcome dropped before delivery")]
    OutcomeDropped,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct TransactionSequencer {
    account: Address,
    submit_tx: mpsc::Sender<WriteRequest>,
    nonce: Arc<NonceTracker>,
    gas: Arc<AtomicU64>,
    tasks: Mutex<Option<TaskGroup>>,
}

impl TransactionSequencer {
    /// Seed the local nonce from the ledger and spawn both workers.
    pub async fn start(
        account: Address,
        backend: Arc<dyn LedgerWriter>,
        config: SequencerConfig,
    ) -> Result<Self, SequencerError> {
        let initial = backend.transaction_count(&account).await?;
        let nonce = Arc::new(NonceTracker::new(initial));
        let gas = Arc::new(AtomicU64::new(0));

        let (submit_tx, submit_rx) = mpsc::channel(config.submit_capacity.max(1));
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();

        let cancel = CancellationToken::new();
        let mut tasks = TaskGroup::new(cancel.clone());

        let submission = SubmissionWorker {
            account: account.clone(),
            backend: Arc::clone(&backend),
            nonce: Arc::clone(&nonce),
            gas: Arc::clone(&gas),
            confirm_tx,
            config: config.clone(),
        };
        let confirmation = ConfirmationWorker {
            account: account.clone(),
            backend,
            config,
        };
        tasks.spawn(
            format!("sequencer-submit-{account}"),
            submission.run(submit_rx, cancel.clone()),
        );
        tasks.spawn(
            format!("sequencer-confirm-{account}"),
            confirmation.run(confirm_rx, cancel),
        );

        info!(target: LOG_TARGET, %account, nonce = initial, "transaction sequencer started");

        Ok(Self {
            account,
            submit_tx,
            nonce,
            gas,
            tasks: Mutex::new(Some(tasks)),
        })
    }

    pub fn account(&self) -> &Address {
        &self.account
    }

    /// Queue a write; the receiver resolves once its receipt arrives or the write fails.
    #[instrument(
        skip(self, call),
        level = "debug",
        target = LOG_TARGET,
        fields(call = tracing::field::Empty, request_id = tracing::field::Empty)
    )]
    pub async fn submit(&self, call: LedgerCall) -> Result<oneshot::Receiver<WriteOutcome>, SequencerError> {
        let (reply, outcome) = oneshot::channel();
        self.enqueue(call, reply).await?;
        Ok(outcome)
    }

    pub async fn submit_and_wait(&self, call: LedgerCall) -> Result<WriteOutcome, SequencerError> {
        self.submit(call)
            .await?
            .await
            .map_err(|_| SequencerError::OutcomeDropped)
    }

    async fn enqueue(
        &self,
        call: LedgerCall,
        reply: oneshot::Sender<WriteOutcome>,
    ) -> Result<(), SequencerError> {
        let id = Uuid::new_v4();
        let span = Span::current();
        span.record("call", call.name());
        span.record("request_id", tracing::field::display(id));
        let request = WriteRequest {
            id,
            call,
            reply,
            queued_at: Instant::now(),
        };
        self.submit_tx
            .send(request)
            .await
            .map_err(|_| SequencerError::Stopped)
    }

    /// Next nonce the sequencer will assign.
    pub async fn next_nonce(&self) -> Nonce {
        self.nonce.peek().await
    }

    /// Gas accumulated over every accepted submission.
    pub fn total_gas(&self) -> Gas {
        self.gas.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown(Duration::from_secs(1)).await;
            info!(target: LOG_TARGET, account = %self.account, "transaction sequencer stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::Commitment;
    use crate::ledger::{ContentPointer, InMemoryLedger, InMemoryLedgerConfig, LedgerReader, ReceiptStatus};

    fn fast_config() -> SequencerConfig {
        SequencerConfig::default()
            .with_retry_backoff(Duration::from_millis(1))
            .with_receipt_poll_interval(Duration::from_millis(2))
            .with_receipt_timeout(Duration::from_secs(2))
    }

    fn answer(subtask_id: u64) -> LedgerCall {
        LedgerCall::SubmitSubtaskAnswer {
            subtask_id,
            commitment: Commitment::new([subtask_id as u8; 32]),
            pointer: ContentPointer::new(format!("blob-{subtask_id}")),
            aux_randomness: subtask_id,
        }
    }

    async fn ledger_with_randomizers() -> Arc<InMemoryLedger> {
        let ledger = Arc::new(InMemoryLedger::new(InMemoryLedgerConfig::new(1)));
        let account = Address::new("0xrandomizer");
        let sequencer = TransactionSequencer::start(account, ledger.clone(), fast_config())
            .await
            .unwrap();
        let outcome = sequencer
            .submit_and_wait(LedgerCall::RegisterRandomizer { randomizer_id: 1 })
            .await
            .unwrap();
        assert!(outcome.is_success());
        sequencer.shutdown().await;
        ledger
    }

    #[tokio::test]
    async fn concurrent_submissions_get_distinct_consecutive_nonces() {
        let ledger = ledger_with_randomizers().await;
        let sequencer = Arc::new(
            TransactionSequencer::start(Address::new("0xsubmitter"), ledger.clone(), fast_config())
                .await
                .unwrap(),
        );

        let n = 24u64;
        let mut handles = Vec::new();
        for subtask_id in 0..n {
            let sequencer = Arc::clone(&sequencer);
            handles.push(tokio::spawn(async move {
                sequencer.submit_and_wait(answer(subtask_id)).await.unwrap()
            }));
        }
        let mut nonces = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.is_success(), "{outcome:?}");
            nonces.push(outcome.receipt().unwrap().nonce);
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..n).collect::<Vec<_>>());
        assert_eq!(sequencer.next_nonce().await, n);
        assert_eq!(sequencer.total_gas(), 160_000 * n);
        assert_eq!(ledger.selected_randomizers(n - 1).await.unwrap(), vec![1]);
        sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn sequential_writes_follow_issue_order() {
        let ledger = ledger_with_randomizers().await;
        let sequencer = TransactionSequencer::start(Address::new("0xs"), ledger, fast_config())
            .await
            .unwrap();
        let mut receivers = Vec::new();
        for subtask_id in 10..15 {
            receivers.push((subtask_id, sequencer.submit(answer(subtask_id)).await.unwrap()));
        }
        for (offset, (_, rx)) in receivers.into_iter().enumerate() {
            let outcome = rx.await.unwrap();
            assert_eq!(outcome.receipt().unwrap().nonce, offset as u64);
        }
        sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn transport_failures_are_retried() {
        let ledger = ledger_with_randomizers().await;
        let sequencer = TransactionSequencer::start(Address::new("0xs"), ledger.clone(), fast_config())
            .await
            .unwrap();
        ledger.fail_next_sends(2);
        let outcome = sequencer.submit_and_wait(answer(1)).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(sequencer.next_nonce().await, 1);
        sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn out_of_band_nonce_use_is_recovered() {
        let ledger = ledger_with_randomizers().await;
        let account = Address::new("0xs");
        let sequencer = TransactionSequencer::start(account.clone(), ledger.clone(), fast_config())
            .await
            .unwrap();
        ledger.advance_nonce(&account);
        let outcome = sequencer.submit_and_wait(answer(1)).await.unwrap();
        assert_eq!(outcome.receipt().unwrap().nonce, 1);
        assert_eq!(sequencer.next_nonce().await, 2);
        sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure_and_keep_nonce() {
        let ledger = ledger_with_randomizers().await;
        let sequencer = TransactionSequencer::start(
            Address::new("0xs"),
            ledger.clone(),
            fast_config().with_max_submit_attempts(3),
        )
        .await
        .unwrap();
        ledger.fail_next_sends(10);
        let outcome = sequencer.submit_and_wait(answer(1)).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::SubmissionFailed { .. }));
        assert_eq!(sequencer.next_nonce().await, 0);

        ledger.fail_next_sends(0);
        let outcome = sequencer.submit_and_wait(answer(1)).await.unwrap();
        assert_eq!(outcome.receipt().unwrap().nonce, 0);
        sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn missing_receipts_time_out_without_blocking_submissions() {
        let ledger = ledger_with_randomizers().await;
        let sequencer = TransactionSequencer::start(
            Address::new("0xs"),
            ledger.clone(),
            fast_config().with_receipt_timeout(Duration::from_millis(40)),
        )
        .await
        .unwrap();
        ledger.withhold_receipts(true);
        let first = sequencer.submit(answer(1)).await.unwrap();
        let second = sequencer.submit(answer(2)).await.unwrap();
        assert!(matches!(first.await.unwrap(), WriteOutcome::TimedOut { .. }));
        assert!(matches!(second.await.unwrap(), WriteOutcome::TimedOut { .. }));
        assert_eq!(sequencer.next_nonce().await, 2);
        sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn reverted_writes_are_reported() {
        let ledger = ledger_with_randomizers().await;
        let sequencer = TransactionSequencer::start(Address::new("0xs"), ledger, fast_config())
            .await
            .unwrap();
        assert!(sequencer.submit_and_wait(answer(1)).await.unwrap().is_success());
        let duplicate = sequencer.submit_and_wait(answer(1)).await.unwrap();
        match duplicate {
            WriteOutcome::Reverted(receipt) => {
                assert!(matches!(receipt.status, ReceiptStatus::Reverted { .. }))
            }
            other => panic!("expected revert, got {other:?}"),
        }
        sequencer.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_sequencer_rejects_writes() {
        let ledger = ledger_with_randomizers().await;
        let sequencer = TransactionSequencer::start(Address::new("0xs"), ledger, fast_config())
            .await
            .unwrap();
        sequencer.shutdown().await;
        // the submission worker is gone; the channel eventually rejects
        let result = sequencer.submit_and_wait(answer(1)).await;
        assert!(result.is_err());
    }
}
