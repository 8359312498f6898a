use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::proof_store::{ProofStore, ProofStoreConfig};
use super::state::{Phase, ReEncryptJob, TurnTracker};
use super::LOG_TARGET;
use crate::blob_store::{fetch_ciphertexts, put_ciphertexts, BlobStore};
use crate::commitment::Commitment;
use crate::elgamal::{re_encrypt_blocks, PublicKey};
use crate::ledger::{catch_up_events, Gas, LedgerCall, LedgerEvent, LedgerReader, RandomizerId};
use crate::network::ControlHandler;
use crate::queue::{forward_feed, next_item, FifoQueue, WorkQueue};
use crate::sequencer::TransactionSequencer;
use crate::tokio_tools::{run_blocking, TaskGroup};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomizerConfig {
    pub event_queue_capacity: usize,
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub sweep_interval: Duration,
    pub proof_store: ProofStoreConfig,
}

impl Default for RandomizerConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 1024,
            sweep_interval: Duration::from_secs(30),
            proof_store: ProofStoreConfig::default(),
        }
    }
}

/// One randomizer: event listener, turn-driven re-encryption and proof-store upkeep.
///
/// The proof server is run separately over [`RandomizerNode::proof_store`].
pub struct RandomizerNode {
    randomizer_id: RandomizerId,
    pk: Arc<PublicKey>,
    ledger: Arc<dyn LedgerReader>,
    blobs: Arc<dyn BlobStore>,
    sequencer: Arc<TransactionSequencer>,
    proofs: Arc<ProofStore>,
    tracker: Mutex<TurnTracker>,
    rng: Mutex<StdRng>,
    config: RandomizerConfig,
}

impl RandomizerNode {
    pub fn new(
        randomizer_id: RandomizerId,
        pk: Arc<PublicKey>,
        ledger: Arc<dyn LedgerReader>,
        blobs: Arc<dyn BlobStore>,
        sequencer: Arc<TransactionSequencer>,
        config: RandomizerConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            randomizer_id,
            pk,
            ledger,
            blobs,
            sequencer,
            proofs: Arc::new(ProofStore::new(config.proof_store.clone())),
            tracker: Mutex::new(TurnTracker::new(randomizer_id)),
            rng: Mutex::new(rng),
            config,
        }
    }

    pub fn randomizer_id(&self) -> RandomizerId {
        self.randomizer_id
    }

    pub fn proof_store(&self) -> Arc<ProofStore> {
        Arc::clone(&self.proofs)
    }

    pub fn phase(&self, subtask_id: u64) -> Option<Phase> {
        self.tracker.lock().phase(subtask_id)
    }

    /// Subtasks whose turn state is still held.
    pub fn tracked_subtasks(&self) -> usize {
        self.tracker.lock().len()
    }

    /// Register this node's id on the ledger and wait for the receipt.
    pub async fn register(&self) -> Result<()> {
        let outcome = self
            .sequencer
            .submit_and_wait(LedgerCall::RegisterRandomizer {
                randomizer_id: self.randomizer_id,
            })
            .await
            .context("failed to queue randomizer registration")?;
        if !outcome.is_success() {
            bail!("registration of randomizer {} failed: {outcome:?}", self.randomizer_id);
        }
        info!(target: LOG_TARGET, randomizer_id = self.randomizer_id, "randomizer registered");
        Ok(())
    }

    /// Subscribe to the ledger and start the listener, handler, resync and sweeper tasks.
    ///
    /// The subscription is taken before this returns, so no event published afterwards is missed.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> TaskGroup {
        let id = self.randomizer_id;
        let mut tasks = TaskGroup::new(cancel.clone());
        let queue = Arc::new(FifoQueue::new(self.config.event_queue_capacity));
        let lagged = Arc::new(Notify::new());

        tasks.spawn(
            format!("randomizer-{id}-listener"),
            forward_feed(
                self.ledger.subscribe(),
                Arc::clone(&queue),
                cancel.clone(),
                format!("randomizer-{id}"),
                Arc::clone(&lagged),
            ),
        );

        let node = Arc::clone(self);
        let resync_queue = Arc::clone(&queue);
        let resync_cancel = cancel.clone();
        tasks.spawn(format!("randomizer-{id}-resync"), async move {
            loop {
                tokio::select! {
                    _ = resync_cancel.cancelled() => break,
                    _ = lagged.notified() => {
                        if let Err(err) = node.resync(resync_queue.as_ref()).await {
                            warn!(target: LOG_TARGET, randomizer_id = id, error = %err, "resync failed");
                        }
                    }
                }
            }
        });

        let node = Arc::clone(self);
        let handler_cancel = cancel.clone();
        tasks.spawn(format!("randomizer-{id}-handler"), async move {
            while let Some(event) = next_item(queue.as_ref(), &handler_cancel).await {
                node.handle_event(event).await;
            }
            debug!(target: LOG_TARGET, randomizer_id = id, "event handler stopped");
        });

        let node = Arc::clone(self);
        tasks.spawn(format!("randomizer-{id}-sweeper"), async move {
            node.sweep_loop(cancel).await;
        });
        tasks
    }

    /// Re-queue the ledger's history of every subtask still in flight.
    ///
    /// Events the turn tracker already acted on are ignored when they come round again.
    pub async fn resync(&self, queue: &dyn WorkQueue<LedgerEvent>) -> Result<usize> {
        let history = self.ledger.past_events().await.context("failed to read ledger history")?;
        let replay = catch_up_events(history);
        let replayed = replay.len();
        for event in replay {
            queue.push(event).context("event queue closed during resync")?;
        }
        info!(target: LOG_TARGET, randomizer_id = self.randomizer_id, replayed, "replayed ledger history");
        Ok(replayed)
    }

    /// Process one event. Failures are logged and confined to the subtask.
    pub async fn handle_event(&self, event: LedgerEvent) {
        let subtask_id = event.subtask_id();

        if let LedgerEvent::SubTaskEncryptionCompleted { .. } = event {
            self.tracker.lock().mark_completed(subtask_id);
            let marked = self.proofs.mark_subtask_completed(subtask_id);
            debug!(target: LOG_TARGET, randomizer_id = self.randomizer_id, subtask_id, marked, "subtask completed");
            return;
        }

        if !self.tracker.lock().is_known(subtask_id) {
            match self.ledger.selected_randomizers(subtask_id).await {
                Ok(order) if order.is_empty() => {
                    warn!(target: LOG_TARGET, randomizer_id = self.randomizer_id, subtask_id, "selection not finalized; event ignored");
                    return;
                }
                Ok(order) => {
                    let phase = self.tracker.lock().admit(subtask_id, &order);
                    debug!(target: LOG_TARGET, randomizer_id = self.randomizer_id, subtask_id, ?order, ?phase, "membership resolved");
                }
                Err(err) => {
                    warn!(target: LOG_TARGET, randomizer_id = self.randomizer_id, subtask_id, error = %err, "selection lookup failed");
                    return;
                }
            }
        }

        let Some(job) = self.tracker.lock().on_event(&event) else {
            return;
        };

        match self.re_encrypt_step(&job).await {
            Ok(commitment) => {
                self.tracker.lock().mark_published(subtask_id);
                info!(
                    target: LOG_TARGET,
                    randomizer_id = self.randomizer_id,
                    subtask_id,
                    position = job.position,
                    %commitment,
                    "re-encryption published"
                );
            }
            Err(err) => {
                self.tracker.lock().mark_failed(subtask_id);
                error!(
                    target: LOG_TARGET,
                    randomizer_id = self.randomizer_id,
                    subtask_id,
                    error = %err,
                    "re-encryption step failed"
                );
            }
        }
    }

    /// Fetch, re-encrypt, upload, remember `alpha_prime`, then publish to the ledger and wait
    /// for the receipt.
    async fn re_encrypt_step(&self, job: &ReEncryptJob) -> Result<Commitment> {
        let previous = fetch_ciphertexts(self.blobs.as_ref(), &job.source, &self.pk)
            .await
            .with_context(|| format!("failed to fetch {}", job.source))?;

        let alpha_prime = self.pk.random_exponent(&mut *self.rng.lock());
        let (fresh, alpha_prime) = run_blocking("re-encrypt", move || {
            let fresh = re_encrypt_blocks(&previous, &alpha_prime);
            (fresh, alpha_prime)
        })
        .await?;

        let pointer = put_ciphertexts(self.blobs.as_ref(), &fresh)
            .await
            .context("failed to upload re-encrypted answer")?;
        let commitment = Commitment::compute(&fresh);

        // must be provable before the ledger announces it
        self.proofs.insert(commitment, job.subtask_id, alpha_prime);

        let landed = self
            .publish(LedgerCall::EncryptSubtaskAnswer {
                subtask_id: job.subtask_id,
                commitment,
                pointer,
            })
            .await;
        if landed.is_err() {
            // nothing on the ledger refers to this exponent
            self.proofs.remove(&commitment);
        }
        landed.map(|()| commitment)
    }

    /// Queue a write and wait until the ledger confirms it.
    async fn publish(&self, call: LedgerCall) -> Result<()> {
        let name = call.name();
        let outcome = self
            .sequencer
            .submit_and_wait(call)
            .await
            .with_context(|| format!("failed to queue {name}"))?;
        if !outcome.is_success() {
            bail!("{name} did not land: {outcome:?}");
        }
        Ok(())
    }

    async fn sweep_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.proofs.sweep(now);
                    let pruned = self.tracker.lock().prune(now, self.config.proof_store.retention);
                    if pruned > 0 {
                        debug!(target: LOG_TARGET, randomizer_id = self.randomizer_id, pruned, "pruned settled subtasks");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ControlHandler for RandomizerNode {
    fn gas_cost(&self) -> Gas {
        self.sequencer.total_gas()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::InMemoryBlobStore;
    use crate::elgamal::{decrypt_bytes, encrypt_bytes};
    use crate::ledger::{Address, InMemoryLedger, InMemoryLedgerConfig, LedgerReader};
    use crate::proof::{Prover, Verifier};
    use crate::sequencer::SequencerConfig;
    use crate::test_utils::keys::small_keys;
    use rand::SeedableRng;

    fn sequencer_config() -> SequencerConfig {
        SequencerConfig::default()
            .with_receipt_poll_interval(Duration::from_millis(2))
            .with_retry_backoff(Duration::from_millis(1))
    }

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        blobs: Arc<InMemoryBlobStore>,
        nodes: Vec<Arc<RandomizerNode>>,
        submitter: TransactionSequencer,
        cancel: CancellationToken,
        groups: Vec<TaskGroup>,
    }

    async fn harness(count: u64, per_subtask: usize) -> Harness {
        let (pk, _) = small_keys();
        let ledger = Arc::new(InMemoryLedger::new(InMemoryLedgerConfig::new(per_subtask)));
        let blobs = Arc::new(InMemoryBlobStore::new());
        let cancel = CancellationToken::new();
        let mut nodes = Vec::new();
        let mut groups = Vec::new();
        for id in 1..=count {
            let sequencer = TransactionSequencer::start(
                Address::new(format!("0xrandomizer{id}")),
                ledger.clone(),
                sequencer_config(),
            )
            .await
            .unwrap();
            let node = Arc::new(RandomizerNode::new(
                id,
                Arc::clone(&pk),
                ledger.clone(),
                blobs.clone(),
                Arc::new(sequencer),
                RandomizerConfig::default(),
                StdRng::seed_from_u64(id),
            ));
            node.register().await.unwrap();
            groups.push(node.spawn(cancel.child_token()));
            nodes.push(node);
        }
        let submitter = TransactionSequencer::start(Address::new("0xsubmitter"), ledger.clone(), sequencer_config())
            .await
            .unwrap();
        Harness {
            ledger,
            blobs,
            nodes,
            submitter,
            cancel,
            groups,
        }
    }

    async fn wait_for_completion(ledger: &InMemoryLedger, subtask_id: u64) {
        let mut feed = ledger.subscribe();
        if ledger.final_result(subtask_id).await.is_ok() {
            return;
        }
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(LedgerEvent::SubTaskEncryptionCompleted { subtask_id: done }) = feed.recv().await {
                    if done == subtask_id {
                        break;
                    }
                }
            }
        })
        .await
        .expect("chain did not complete in time");
    }

    async fn wait_for_phase(node: &RandomizerNode, subtask_id: u64, phase: Phase) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while node.phase(subtask_id) != Some(phase) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("phase not reached in time");
    }

    /// One registered randomizer whose events are fed by hand, plus a submitter account.
    async fn idle_node(sequencer: SequencerConfig) -> (Arc<InMemoryLedger>, Arc<InMemoryBlobStore>, RandomizerNode, TransactionSequencer) {
        let (pk, _) = small_keys();
        let ledger = Arc::new(InMemoryLedger::new(InMemoryLedgerConfig::new(1)));
        let blobs = Arc::new(InMemoryBlobStore::new());
        let node = RandomizerNode::new(
            1,
            pk,
            ledger.clone(),
            blobs.clone(),
            Arc::new(
                TransactionSequencer::start(Address::new("0xrandomizer1"), ledger.clone(), sequencer)
                    .await
                    .unwrap(),
            ),
            RandomizerConfig::default(),
            StdRng::seed_from_u64(1),
        );
        node.register().await.unwrap();
        let submitter = TransactionSequencer::start(Address::new("0xsubmitter"), ledger.clone(), sequencer_config())
            .await
            .unwrap();
        (ledger, blobs, node, submitter)
    }

    async fn submit_answer(
        blobs: &InMemoryBlobStore,
        submitter: &TransactionSequencer,
        subtask_id: u64,
        rng: &mut StdRng,
    ) -> crate::ledger::ContentPointer {
        let (pk, _) = small_keys();
        let initial = encrypt_bytes(&pk, &3i64.to_be_bytes(), None, rng).unwrap();
        let pointer = put_ciphertexts(blobs, &initial).await.unwrap();
        let outcome = submitter
            .submit_and_wait(LedgerCall::SubmitSubtaskAnswer {
                subtask_id,
                commitment: Commitment::compute(&initial),
                pointer: pointer.clone(),
                aux_randomness: 0,
            })
            .await
            .unwrap();
        assert!(outcome.is_success());
        pointer
    }

    #[tokio::test]
    async fn chain_re_encrypts_in_selection_order() {
        let h = harness(4, 3).await;
        let (pk, sk) = small_keys();
        let mut rng = StdRng::seed_from_u64(81);
        let answer = 42i64.to_be_bytes();
        let initial = encrypt_bytes(&pk, &answer, None, &mut rng).unwrap();
        let pointer = put_ciphertexts(h.blobs.as_ref(), &initial).await.unwrap();

        let outcome = h
            .submitter
            .submit_and_wait(LedgerCall::SubmitSubtaskAnswer {
                subtask_id: 0,
                commitment: Commitment::compute(&initial),
                pointer,
                aux_randomness: 2,
            })
            .await
            .unwrap();
        assert!(outcome.is_success());
        wait_for_completion(&h.ledger, 0).await;

        let result = h.ledger.final_result(0).await.unwrap();
        assert_eq!(result.steps.len(), 3);
        let order = h.ledger.selected_randomizers(0).await.unwrap();
        assert_eq!(result.order, order);

        let mut previous = initial;
        for (entry, randomizer_id) in result.steps.iter().zip(&order) {
            let current = fetch_ciphertexts(h.blobs.as_ref(), &entry.pointer, &pk).await.unwrap();
            assert!(entry.commitment.matches(&current));
            assert_eq!(decrypt_bytes(&sk, &current).unwrap(), answer);

            // the producing node can prove the step
            let node = &h.nodes[(*randomizer_id - 1) as usize];
            let alpha_prime = node.proof_store().get(&entry.commitment).unwrap();
            let (prover, e_prime) = Prover::new(Arc::clone(&pk), alpha_prime).commit(&mut rng);
            let (verifier, c) = Verifier::new(&previous, &current)
                .unwrap()
                .receive_commitment(e_prime, &mut rng)
                .unwrap();
            assert!(verifier.finish(prover.respond(&c).unwrap()).accepted);
            wait_for_phase(node, 0, Phase::Completed).await;
            previous = current;
        }

        let unselected: Vec<_> = h.nodes.iter().filter(|n| !order.contains(&n.randomizer_id())).collect();
        assert_eq!(unselected.len(), 1);
        assert!(unselected[0].proof_store().is_empty());
        assert_eq!(unselected[0].phase(0), Some(Phase::NotSelected));

        h.cancel.cancel();
        for group in h.groups {
            group.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn missing_blob_fails_only_that_subtask() {
        let h = harness(1, 1).await;
        let (pk, _) = small_keys();
        let mut rng = StdRng::seed_from_u64(82);
        let initial = encrypt_bytes(&pk, &7i64.to_be_bytes(), None, &mut rng).unwrap();

        h.submitter
            .submit_and_wait(LedgerCall::SubmitSubtaskAnswer {
                subtask_id: 0,
                commitment: Commitment::compute(&initial),
                pointer: crate::ledger::ContentPointer::new("missing"),
                aux_randomness: 1,
            })
            .await
            .unwrap();
        let pointer = put_ciphertexts(h.blobs.as_ref(), &initial).await.unwrap();
        h.submitter
            .submit_and_wait(LedgerCall::SubmitSubtaskAnswer {
                subtask_id: 1,
                commitment: Commitment::compute(&initial),
                pointer,
                aux_randomness: 1,
            })
            .await
            .unwrap();
        wait_for_completion(&h.ledger, 1).await;

        assert_eq!(h.nodes[0].phase(0), Some(Phase::Failed));
        assert!(h.ledger.final_result(0).await.is_err());
        h.cancel.cancel();
        for group in h.groups {
            group.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn unconfirmed_write_leaves_the_subtask_failed() {
        let (ledger, blobs, node, submitter) = idle_node(sequencer_config().with_max_submit_attempts(2)).await;
        let mut rng = StdRng::seed_from_u64(83);
        let pointer = submit_answer(blobs.as_ref(), &submitter, 0, &mut rng).await;

        ledger.fail_next_sends(2);
        let submitted = LedgerEvent::SubTaskAnswerSubmitted {
            subtask_id: 0,
            filehash: pointer,
        };
        node.handle_event(submitted.clone()).await;
        assert_eq!(node.phase(0), Some(Phase::Failed));
        assert!(node.proof_store().is_empty());
        assert!(ledger.final_result(0).await.is_err());

        // a redelivered notification does not start another attempt
        node.handle_event(submitted).await;
        assert_eq!(node.phase(0), Some(Phase::Failed));
        assert!(ledger.final_result(0).await.is_err());
    }

    #[tokio::test]
    async fn resync_recovers_events_the_listener_never_saw() {
        let (ledger, blobs, node, submitter) = idle_node(sequencer_config()).await;
        let mut rng = StdRng::seed_from_u64(84);
        submit_answer(blobs.as_ref(), &submitter, 0, &mut rng).await;
        assert_eq!(node.phase(0), None);

        let queue: FifoQueue<LedgerEvent> = FifoQueue::new(16);
        assert_eq!(node.resync(&queue).await.unwrap(), 1);
        let cancel = CancellationToken::new();
        while !queue.is_empty() {
            let event = next_item(&queue, &cancel).await.unwrap();
            node.handle_event(event).await;
        }
        assert_eq!(node.phase(0), Some(Phase::Published));
        let result = ledger.final_result(0).await.unwrap();
        assert_eq!(result.order, vec![1]);
        assert!(node.proof_store().contains(&result.steps[0].commitment));

        // once finished, only the completion is replayed
        let replayed = node.resync(&queue).await.unwrap();
        assert_eq!(replayed, 1);
        node.handle_event(next_item(&queue, &cancel).await.unwrap()).await;
        assert_eq!(node.phase(0), Some(Phase::Completed));
        assert_eq!(node.tracked_subtasks(), 1);
    }
}
