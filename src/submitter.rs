//! Submitter role: pull subtasks, execute them and submit encrypted answers.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blob_store::{put_ciphertexts, BlobStore};
use crate::commitment::Commitment;
use crate::elgamal::{encrypt_bytes, PublicKey};
use crate::ledger::{Gas, LedgerCall, SubtaskId};
use crate::network::{ControlHandler, TaskPullClient};
use crate::sequencer::{TransactionSequencer, WriteOutcome};
use crate::task::{Answer, SubTask};
use crate::tokio_tools::spawn_named_task;

const LOG_TARGET: &str = "legit_crowd::submitter";

/// Upper bound of the auxiliary randomness attached to a submission.
const MAX_AUX_RANDOMNESS: u64 = 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmissionSummary {
    pub pulled: usize,
    pub confirmed: Vec<SubtaskId>,
    pub failed: Vec<SubtaskId>,
}

struct SubmitterInner<S> {
    name: String,
    pk: Arc<PublicKey>,
    blobs: Arc<dyn BlobStore>,
    sequencer: Arc<TransactionSequencer>,
    tasks: TaskPullClient,
    rng: Mutex<StdRng>,
    _subtask: PhantomData<fn() -> S>,
}

impl<S: SubTask> SubmitterInner<S> {
    async fn run(&self) -> Result<SubmissionSummary> {
        let mut summary = SubmissionSummary::default();
        let mut pending = Vec::new();

        while let Some(envelope) = self.tasks.pull().await.context("task pull failed")? {
            summary.pulled += 1;
            let subtask_id = envelope.subtask_id;
            debug!(target: LOG_TARGET, submitter = %self.name, subtask_id, "subtask received");
            match self.submit(envelope.open::<S>()).await {
                Ok(outcome) => pending.push((subtask_id, outcome)),
                Err(err) => {
                    error!(target: LOG_TARGET, submitter = %self.name, subtask_id, error = %err, "submission failed");
                    summary.failed.push(subtask_id);
                }
            }
        }

        for (subtask_id, outcome) in pending {
            match outcome.await {
                Ok(outcome) if outcome.is_success() => {
                    info!(target: LOG_TARGET, submitter = %self.name, subtask_id, "answer submitted");
                    summary.confirmed.push(subtask_id);
                }
                Ok(outcome) => {
                    warn!(target: LOG_TARGET, submitter = %self.name, subtask_id, ?outcome, "answer not accepted by the ledger");
                    summary.failed.push(subtask_id);
                }
                Err(_) => {
                    warn!(target: LOG_TARGET, submitter = %self.name, subtask_id, "sequencer stopped before confirming");
                    summary.failed.push(subtask_id);
                }
            }
        }
        Ok(summary)
    }

    async fn submit(
        &self,
        subtask: Result<S, crate::task::TaskError>,
    ) -> Result<oneshot::Receiver<WriteOutcome>> {
        let subtask = subtask?;
        let answer = subtask.execute()?;
        let (ciphertexts, aux_randomness) = {
            let mut rng = self.rng.lock();
            let ciphertexts = encrypt_bytes(&self.pk, &answer.encode(), None, &mut *rng)?;
            (ciphertexts, rng.gen_range(1..=MAX_AUX_RANDOMNESS))
        };
        let pointer = put_ciphertexts(self.blobs.as_ref(), &ciphertexts).await?;
        let commitment = Commitment::compute(&ciphertexts);
        let outcome = self
            .sequencer
            .submit(LedgerCall::SubmitSubtaskAnswer {
                subtask_id: subtask.id(),
                commitment,
                pointer,
                aux_randomness,
            })
            .await?;
        Ok(outcome)
    }
}

/// A submitter whose main loop is triggered once, locally or through the control protocol.
pub struct SubmitterNode<S> {
    inner: Arc<SubmitterInner<S>>,
    handle: Mutex<Option<JoinHandle<Result<SubmissionSummary>>>>,
    started: Mutex<bool>,
}

impl<S: SubTask> SubmitterNode<S> {
    pub fn new(
        name: impl Into<String>,
        pk: Arc<PublicKey>,
        blobs: Arc<dyn BlobStore>,
        sequencer: Arc<TransactionSequencer>,
        tasks: TaskPullClient,
        rng: StdRng,
    ) -> Self {
        Self {
            inner: Arc::new(SubmitterInner {
                name: name.into(),
                pk,
                blobs,
                sequencer,
                tasks,
                rng: Mutex::new(rng),
                _subtask: PhantomData,
            }),
            handle: Mutex::new(None),
            started: Mutex::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn the pull/execute/submit loop. Fails if it was already started.
    pub fn begin(&self) -> Result<()> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(anyhow!("submitter {} already started", self.inner.name));
            }
            *started = true;
        }
        let inner = Arc::clone(&self.inner);
        let handle = spawn_named_task(format!("submitter-{}", self.inner.name), async move { inner.run().await });
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Wait for the loop spawned by [`SubmitterNode::begin`].
    pub async fn finished(&self) -> Result<SubmissionSummary> {
        let handle = self
            .handle
            .lock()
            .take()
            .ok_or_else(|| anyhow!("submitter {} was not started", self.inner.name))?;
        handle.await.context("submitter loop panicked")?
    }
}

#[async_trait]
impl<S: SubTask> ControlHandler for SubmitterNode<S> {
    fn gas_cost(&self) -> Gas {
        self.inner.sequencer.total_gas()
    }

    async fn start(&self) -> Result<(), String> {
        self.begin().map_err(|err| err.to_string())
    }
}
