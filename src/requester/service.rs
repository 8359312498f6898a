use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aggregator::{Aggregate, Aggregator};
use super::verifier::{ChainReport, ChainVerifier};
use super::LOG_TARGET;
use crate::ledger::{Gas, LedgerEvent, LedgerReader, RandomizerId, SubtaskId};
use crate::network::{ControlHandler, SubtaskQueue};
use crate::queue::{forward_feed, next_item, FifoQueue, WorkQueue};
use crate::task::{Answer, SubTask, Task};
use crate::tokio_tools::TaskGroup;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequesterConfig {
    pub event_queue_capacity: usize,
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub task_pull_timeout: Duration,
    /// Measured from [`RequesterNode::spawn`]; subtasks still open then are excluded.
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub round_deadline: Duration,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 1024,
            task_pull_timeout: Duration::from_secs(10),
            round_deadline: Duration::from_secs(600),
        }
    }
}

/// The requester daemon: owns the task, verifies each completed chain and aggregates.
pub struct RequesterNode<T: Task> {
    task: Arc<T>,
    verifier: ChainVerifier,
    ledger: Arc<dyn LedgerReader>,
    subtasks: Arc<SubtaskQueue>,
    reports: DashMap<SubtaskId, ChainReport>,
    aggregator: Mutex<Aggregator<T>>,
    result_tx: Mutex<Option<oneshot::Sender<Aggregate<T::Output>>>>,
    config: RequesterConfig,
}

impl<T: Task> RequesterNode<T> {
    /// The receiver resolves once every subtask has been settled.
    pub fn new(
        task: Arc<T>,
        verifier: ChainVerifier,
        ledger: Arc<dyn LedgerReader>,
        config: RequesterConfig,
    ) -> Result<(Self, oneshot::Receiver<Aggregate<T::Output>>)> {
        let subtasks = SubtaskQueue::from_task(task.as_ref()).context("failed to serialize subtasks")?;
        let (result_tx, result_rx) = oneshot::channel();
        let node = Self {
            aggregator: Mutex::new(Aggregator::new(Arc::clone(&task))),
            task,
            verifier,
            ledger,
            subtasks: Arc::new(subtasks),
            reports: DashMap::new(),
            result_tx: Mutex::new(Some(result_tx)),
            config,
        };
        Ok((node, result_rx))
    }

    pub fn config(&self) -> &RequesterConfig {
        &self.config
    }

    /// Queue served by the task-pull server.
    pub fn subtask_queue(&self) -> Arc<SubtaskQueue> {
        Arc::clone(&self.subtasks)
    }

    pub fn report(&self, subtask_id: SubtaskId) -> Option<ChainReport> {
        self.reports.get(&subtask_id).map(|entry| entry.value().clone())
    }

    /// Every randomizer flagged so far, ascending and without repeats.
    pub fn flagged(&self) -> Vec<RandomizerId> {
        let mut flagged: Vec<RandomizerId> = self
            .reports
            .iter()
            .flat_map(|entry| entry.value().flagged.clone())
            .collect();
        flagged.sort_unstable();
        flagged.dedup();
        flagged
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> TaskGroup {
        let mut tasks = TaskGroup::new(cancel.clone());
        let queue = Arc::new(FifoQueue::new(self.config.event_queue_capacity));
        let lagged = Arc::new(Notify::new());
        tasks.spawn(
            "requester-listener",
            forward_feed(
                self.ledger.subscribe(),
                Arc::clone(&queue),
                cancel.clone(),
                "requester".to_string(),
                Arc::clone(&lagged),
            ),
        );

        let node = Arc::clone(self);
        let resync_queue = Arc::clone(&queue);
        let resync_cancel = cancel.clone();
        tasks.spawn("requester-resync", async move {
            loop {
                tokio::select! {
                    _ = resync_cancel.cancelled() => break,
                    _ = lagged.notified() => {
                        if let Err(err) = node.resync(resync_queue.as_ref()).await {
                            warn!(target: LOG_TARGET, error = %err, "resync failed");
                        }
                    }
                }
            }
        });

        let node = Arc::clone(self);
        let deadline_cancel = cancel.clone();
        tasks.spawn("requester-deadline", async move {
            tokio::select! {
                _ = deadline_cancel.cancelled() => {}
                _ = tokio::time::sleep(node.config.round_deadline) => {
                    node.close_round();
                }
            }
        });

        let node = Arc::clone(self);
        tasks.spawn("requester-handler", async move {
            while let Some(event) = next_item(queue.as_ref(), &cancel).await {
                node.handle_event(event).await;
            }
            debug!(target: LOG_TARGET, "event handler stopped");
        });
        tasks
    }

    /// Re-queue completions the listener may have missed for subtasks still open.
    pub async fn resync(&self, queue: &dyn WorkQueue<LedgerEvent>) -> Result<usize> {
        let history = self.ledger.past_events().await.context("failed to read ledger history")?;
        let mut replayed = 0;
        for event in history {
            let LedgerEvent::SubTaskEncryptionCompleted { subtask_id } = event else {
                continue;
            };
            if self.aggregator.lock().is_settled(subtask_id) {
                continue;
            }
            queue.push(event).context("event queue closed during resync")?;
            replayed += 1;
        }
        info!(target: LOG_TARGET, replayed, "replayed ledger completions");
        Ok(replayed)
    }

    /// Exclude every subtask without an outcome and publish whatever has been gathered.
    ///
    /// Returns how many subtasks were cut off. Completions arriving later are still verified
    /// and reported, but no longer change the aggregate.
    pub fn close_round(&self) -> usize {
        let closed = {
            let mut aggregator = self.aggregator.lock();
            let open = aggregator.unsettled();
            for subtask_id in &open {
                aggregator.exclude(*subtask_id, "round deadline elapsed");
            }
            open
        };
        if !closed.is_empty() {
            warn!(target: LOG_TARGET, subtasks = ?closed, "round deadline elapsed; open subtasks excluded");
        }
        self.publish_if_complete();
        closed.len()
    }

    pub async fn handle_event(&self, event: LedgerEvent) {
        let LedgerEvent::SubTaskEncryptionCompleted { subtask_id } = event else {
            return;
        };
        if self.reports.contains_key(&subtask_id) {
            debug!(target: LOG_TARGET, subtask_id, "duplicate completion ignored");
            return;
        }

        match self.verifier.verify_subtask(subtask_id).await {
            Ok(report) => self.settle(report),
            Err(err) => {
                error!(target: LOG_TARGET, subtask_id, error = %err, "chain verification failed");
                self.aggregator.lock().exclude(subtask_id, err.to_string());
            }
        }
        self.publish_if_complete();
    }

    fn settle(&self, report: ChainReport) {
        let subtask_id = report.subtask_id;
        let decoded = report
            .answer
            .as_deref()
            .map(<<T::SubTask as SubTask>::Answer as Answer>::decode);
        {
            let mut aggregator = self.aggregator.lock();
            match decoded {
                Some(Ok(answer)) => {
                    if aggregator.record(subtask_id, answer) {
                        info!(
                            target: LOG_TARGET,
                            subtask_id,
                            verified = report.fully_verified(),
                            flagged = ?report.flagged,
                            "answer accepted"
                        );
                    } else {
                        warn!(target: LOG_TARGET, subtask_id, "answer arrived after the subtask was settled");
                    }
                }
                Some(Err(err)) => {
                    warn!(target: LOG_TARGET, subtask_id, error = %err, "answer does not decode");
                    aggregator.exclude(subtask_id, err.to_string());
                }
                None => {
                    warn!(target: LOG_TARGET, subtask_id, "initial submission untrusted; answer excluded");
                    aggregator.exclude(subtask_id, "initial commitment mismatch");
                }
            }
        }
        self.reports.insert(subtask_id, report);
    }

    fn publish_if_complete(&self) {
        let aggregate = {
            let aggregator = self.aggregator.lock();
            if !aggregator.is_complete() {
                return;
            }
            aggregator.finish()
        };
        if let Some(tx) = self.result_tx.lock().take() {
            info!(
                target: LOG_TARGET,
                subtask_count = self.task.subtask_count(),
                merged = aggregate.merged.len(),
                output = ?aggregate.output,
                "task aggregated"
            );
            let _ = tx.send(aggregate);
        }
    }
}

impl<T: Task> ControlHandler for RequesterNode<T> {
    /// The requester only reads from the ledger.
    fn gas_cost(&self) -> Gas {
        0
    }
}
