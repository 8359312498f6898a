use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::sync::oneshot::{self, Receiver, Sender};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const LOG_TARGET: &str = "legit_crowd::queue";

/// Ordered hand-off between an event listener and the daemon that processes its items.
pub trait WorkQueue<T>: Send + Sync {
    fn push(&self, item: T) -> Result<(), QueueError>;
    /// Resolves with the next item, or errors once the queue is closed.
    fn pop(&self) -> Receiver<T>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn close(&self);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,
}

pub struct FifoQueue<T> {
    state: Mutex<QueueState<T>>,
}

struct QueueState<T> {
    items: VecDeque<T>,
    waiters: VecDeque<Sender<T>>,
    closed: bool,
}

impl<T> FifoQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    fn close_inner(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.waiters.clear();
        state.items.clear();
    }
}

impl<T: Send> WorkQueue<T> for FifoQueue<T> {
    fn push(&self, item: T) -> Result<(), QueueError> {
        let mut pending = item;

        loop {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            let Some(waiter) = state.waiters.pop_front() else {
                state.items.push_back(pending);
                return Ok(());
            };
            drop(state);

            // a waiter whose receiver was dropped hands the item back
            match waiter.send(pending) {
                Ok(()) => return Ok(()),
                Err(returned) => pending = returned,
            }
        }
    }

    fn pop(&self) -> Receiver<T> {
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock();
        if state.closed {
            drop(tx);
            return rx;
        }

        if let Some(item) = state.items.pop_front() {
            drop(state);
            if let Err(item) = tx.send(item) {
                self.state.lock().items.push_front(item);
            }
        } else {
            state.waiters.push_back(tx);
        }

        rx
    }

    fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    fn close(&self) {
        self.close_inner();
    }
}

impl<T> Drop for FifoQueue<T> {
    fn drop(&mut self) {
        self.close_inner();
    }
}

impl<T> fmt::Debug for FifoQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FifoQueue")
            .field("pending_items", &state.items.len())
            .field("waiting_receivers", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Copy a broadcast feed into `queue` until cancelled, the feed ends, or the queue closes.
///
/// Items skipped because the listener lagged cannot be recovered from the feed; `lagged` is
/// notified so the owner can catch up from the source of record.
pub async fn forward_feed<T, Q>(
    feed: broadcast::Receiver<T>,
    queue: Arc<Q>,
    cancel: CancellationToken,
    node: String,
    lagged: Arc<Notify>,
) where
    T: Clone + Send + 'static,
    Q: WorkQueue<T> + ?Sized,
{
    let mut stream = BroadcastStream::new(feed);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(item)) => {
                    if queue.push(item).is_err() {
                        debug!(target: LOG_TARGET, %node, "work queue closed; listener stopping");
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(target: LOG_TARGET, %node, skipped, "event listener lagged; requesting resync");
                    lagged.notify_one();
                }
                None => {
                    debug!(target: LOG_TARGET, %node, "event feed closed");
                    break;
                }
            }
        }
    }
}

/// Next queued item, or `None` once cancelled or closed.
pub async fn next_item<T, Q>(queue: &Q, cancel: &CancellationToken) -> Option<T>
where
    Q: WorkQueue<T> + ?Sized,
{
    tokio::select! {
        _ = cancel.cancelled() => None,
        item = queue.pop() => item.ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ContentPointer, LedgerEvent};
    use tokio::runtime::Runtime;

    fn submitted(subtask_id: u64) -> LedgerEvent {
        LedgerEvent::SubTaskAnswerSubmitted {
            subtask_id,
            filehash: ContentPointer::new(format!("blob-{subtask_id}")),
        }
    }

    #[test]
    fn fifo_ordering_is_preserved() {
        let queue = FifoQueue::new(8);
        queue.push(submitted(1)).unwrap();
        queue.push(submitted(2)).unwrap();
        queue.push(submitted(3)).unwrap();

        let rt = Runtime::new().unwrap();
        let a = rt.block_on(queue.pop()).unwrap();
        let b = rt.block_on(queue.pop()).unwrap();
        let c = rt.block_on(queue.pop()).unwrap();

        assert_eq!(a.subtask_id(), 1);
        assert_eq!(b.subtask_id(), 2);
        assert_eq!(c.subtask_id(), 3);
    }

    #[test]
    fn pop_before_push_completes_when_item_arrives() {
        let queue = FifoQueue::new(2);
        let rx = queue.pop();
        queue.push(submitted(7)).unwrap();
        let rt = Runtime::new().unwrap();
        assert_eq!(rt.block_on(rx).unwrap().subtask_id(), 7);
    }

    #[test]
    fn dropped_waiter_does_not_swallow_items() {
        let queue = FifoQueue::new(2);
        drop(queue.pop());
        queue.push(submitted(9)).unwrap();
        assert_eq!(queue.len(), 1);
        let rt = Runtime::new().unwrap();
        assert_eq!(rt.block_on(queue.pop()).unwrap().subtask_id(), 9);
    }

    #[test]
    fn len_reflects_enqueued_items() {
        let queue = FifoQueue::new(2);
        assert!(queue.is_empty());
        queue.push(submitted(5)).unwrap();
        assert_eq!(queue.len(), 1);
        let rt = Runtime::new().unwrap();
        let _ = rt.block_on(queue.pop()).unwrap();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn push_after_close_returns_error() {
        let queue = FifoQueue::new(2);
        queue.close();
        assert_eq!(queue.push(submitted(0)), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn feed_items_arrive_in_order() {
        let (tx, rx) = broadcast::channel(8);
        let queue: Arc<FifoQueue<LedgerEvent>> = Arc::new(FifoQueue::new(8));
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(forward_feed(
            rx,
            queue.clone(),
            cancel.clone(),
            "test".into(),
            Arc::new(Notify::new()),
        ));
        for id in 0..3 {
            tx.send(submitted(id)).unwrap();
        }
        for id in 0..3 {
            assert_eq!(next_item(queue.as_ref(), &cancel).await.unwrap().subtask_id(), id);
        }
        drop(tx);
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn lagging_listener_requests_resync() {
        let (tx, rx) = broadcast::channel(2);
        for id in 0..5 {
            tx.send(submitted(id)).unwrap();
        }
        let queue: Arc<FifoQueue<LedgerEvent>> = Arc::new(FifoQueue::new(8));
        let cancel = CancellationToken::new();
        let lagged = Arc::new(Notify::new());
        let listener = tokio::spawn(forward_feed(rx, queue.clone(), cancel.clone(), "test".into(), lagged.clone()));

        tokio::time::timeout(std::time::Duration::from_secs(1), lagged.notified())
            .await
            .expect("lag was not reported");
        // only what the channel still held gets through
        assert_eq!(next_item(queue.as_ref(), &cancel).await.unwrap().subtask_id(), 3);
        assert_eq!(next_item(queue.as_ref(), &cancel).await.unwrap().subtask_id(), 4);
        drop(tx);
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_releases_a_waiting_consumer() {
        let queue: FifoQueue<LedgerEvent> = FifoQueue::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(next_item(&queue, &cancel).await.is_none());
    }

    #[test]
    fn outstanding_waiters_receive_error_when_closed() {
        let queue: FifoQueue<LedgerEvent> = FifoQueue::new(2);
        let rx = queue.pop();
        queue.close();
        let rt = Runtime::new().unwrap();
        assert!(rt.block_on(rx).is_err());
        assert!(rt.block_on(queue.pop()).is_err());
    }
}
