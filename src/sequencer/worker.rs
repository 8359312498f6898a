use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::nonce::NonceTracker;
use super::{SequencerConfig, WriteOutcome, LOG_TARGET};
use crate::ledger::{Address, LedgerCall, LedgerError, LedgerWriter, PendingTransaction, Transaction, TransactionReceipt};

pub(crate) struct WriteRequest {
    pub id: Uuid,
    pub call: LedgerCall,
    pub reply: oneshot::Sender<WriteOutcome>,
    pub queued_at: Instant,
}

pub(crate) struct AwaitingConfirmation {
    pub id: Uuid,
    pub call_name: &'static str,
    pub pending: PendingTransaction,
    pub reply: oneshot::Sender<WriteOutcome>,
}

fn deliver(reply: oneshot::Sender<WriteOutcome>, outcome: WriteOutcome) {
    // the caller may have stopped listening
    let _ = reply.send(outcome);
}

/// Pulls write requests in issue order and submits them one at a time.
pub(crate) struct SubmissionWorker {
    pub account: Address,
    pub backend: Arc<dyn LedgerWriter>,
    pub nonce: Arc<NonceTracker>,
    pub gas: Arc<AtomicU64>,
    pub confirm_tx: mpsc::UnboundedSender<AwaitingConfirmation>,
    pub config: SequencerConfig,
}

impl SubmissionWorker {
    pub async fn run(self, mut requests: mpsc::Receiver<WriteRequest>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: LOG_TARGET, account = %self.account, "submission worker cancelled");
                    break;
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        debug!(target: LOG_TARGET, account = %self.account, "submission queue closed");
                        break;
                    };
                    self.process(request).await;
                }
            }
        }
    }

    async fn process(&self, request: WriteRequest) {
        let WriteRequest {
            id,
            call,
            reply,
            queued_at,
        } = request;
        let call_name = call.name();

        match self.submit_with_retry(id, &call).await {
            Ok(pending) => {
                self.gas.fetch_add(pending.gas_limit, Ordering::SeqCst);
                info!(
                    target: LOG_TARGET,
                    request_id = %id,
                    call = call_name,
                    nonce = pending.nonce,
                    tx_hash = %pending.hash,
                    queued_ms = queued_at.elapsed().as_millis() as u64,
                    "transaction submitted"
                );
                let awaiting = AwaitingConfirmation {
                    id,
                    call_name,
                    pending,
                    reply,
                };
                if let Err(mpsc::error::SendError(awaiting)) = self.confirm_tx.send(awaiting) {
                    warn!(target: LOG_TARGET, request_id = %id, "confirmation worker gone");
                    deliver(
                        awaiting.reply,
                        WriteOutcome::ConfirmationFailed {
                            hash: awaiting.pending.hash,
                            reason: "confirmation worker stopped".into(),
                        },
                    );
                }
            }
            Err(err) => {
                error!(
                    target: LOG_TARGET,
                    request_id = %id,
                    call = call_name,
                    error = %err,
                    "transaction submission failed"
                );
                deliver(
                    reply,
                    WriteOutcome::SubmissionFailed {
                        reason: err.to_string(),
                    },
                );
            }
        }
    }

    /// Assign the local nonce and submit; on failure resynchronise the nonce and retry.
    async fn submit_with_retry(&self, id: Uuid, call: &LedgerCall) -> Result<PendingTransaction, LedgerError> {
        let mut next = self.nonce.lock().await;
        let attempts = self.config.max_submit_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let transaction = Transaction {
                from: self.account.clone(),
                nonce: *next,
                call: call.clone(),
            };
            match self.backend.send_transaction(transaction).await {
                Ok(pending) => {
                    // advance only once the ledger has accepted the write
                    *next = pending.nonce + 1;
                    return Ok(pending);
                }
                Err(LedgerError::NonceMismatch { expected, actual, .. }) => {
                    warn!(
                        target: LOG_TARGET,
                        request_id = %id,
                        attempt,
                        local = actual,
                        ledger = expected,
                        "nonce out of sync; adopting ledger value"
                    );
                    *next = expected;
                    last_error = Some(LedgerError::NonceMismatch {
                        address: self.account.clone(),
                        expected,
                        actual,
                    });
                }
                Err(err) => {
                    warn!(target: LOG_TARGET, request_id = %id, attempt, error = %err, "send failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                    match self.backend.transaction_count(&self.account).await {
                        Ok(count) => *next = count,
                        Err(err) => warn!(target: LOG_TARGET, request_id = %id, error = %err, "nonce refresh failed"),
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LedgerError::Transport("no submission attempt made".into())))
    }
}

/// Waits for receipts in submission order and reports each outcome.
pub(crate) struct ConfirmationWorker {
    pub account: Address,
    pub backend: Arc<dyn LedgerWriter>,
    pub config: SequencerConfig,
}

impl ConfirmationWorker {
    pub async fn run(self, mut awaiting: mpsc::UnboundedReceiver<AwaitingConfirmation>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: LOG_TARGET, account = %self.account, "confirmation worker cancelled");
                    break;
                }
                item = awaiting.recv() => {
                    let Some(item) = item else {
                        debug!(target: LOG_TARGET, account = %self.account, "confirmation queue closed");
                        break;
                    };
                    let outcome = self.confirm(&item).await;
                    deliver(item.reply, outcome);
                }
            }
        }
    }

    async fn confirm(&self, item: &AwaitingConfirmation) -> WriteOutcome {
        let hash = item.pending.hash;
        let outcome = match tokio::time::timeout(self.config.receipt_timeout, self.poll_receipt(item)).await {
            Ok(receipt) if receipt.succeeded() => WriteOutcome::Confirmed(receipt),
            Ok(receipt) => WriteOutcome::Reverted(receipt),
            Err(_) => WriteOutcome::TimedOut { hash },
        };

        match &outcome {
            WriteOutcome::Confirmed(receipt) => debug!(
                target: LOG_TARGET,
                request_id = %item.id,
                call = item.call_name,
                block = receipt.block,
                "transaction confirmed"
            ),
            WriteOutcome::Reverted(receipt) => warn!(
                target: LOG_TARGET,
                request_id = %item.id,
                call = item.call_name,
                status = ?receipt.status,
                "transaction reverted"
            ),
            _ => warn!(
                target: LOG_TARGET,
                request_id = %item.id,
                call = item.call_name,
                tx_hash = %hash,
                timeout_ms = self.config.receipt_timeout.as_millis() as u64,
                "no receipt before timeout"
            ),
        }
        outcome
    }

    async fn poll_receipt(&self, item: &AwaitingConfirmation) -> TransactionReceipt {
        let poll = self.config.receipt_poll_interval.max(Duration::from_millis(1));
        loop {
            match self.backend.receipt(&item.pending.hash).await {
                Ok(Some(receipt)) => return receipt,
                Ok(None) => {}
                Err(err) => debug!(target: LOG_TARGET, request_id = %item.id, error = %err, "receipt lookup failed"),
            }
            tokio::time::sleep(poll).await;
        }
    }
}
