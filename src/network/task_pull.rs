use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{accept_loop, connect, JsonLines, NetworkError, LOG_TARGET, PROTOCOL_VERSION};
use crate::ledger::SubtaskId;
use crate::task::{SubTask, Task, TaskError};

/// A serialized subtask as handed to a submitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubtaskEnvelope {
    pub subtask_id: SubtaskId,
    pub payload: serde_json::Value,
}

impl SubtaskEnvelope {
    pub fn wrap<S: SubTask>(subtask: &S) -> Result<Self, serde_json::Error> {
        Ok(Self {
            subtask_id: subtask.id(),
            payload: serde_json::to_value(subtask)?,
        })
    }

    pub fn open<S: SubTask>(&self) -> Result<S, TaskError> {
        let subtask: S =
            serde_json::from_value(self.payload.clone()).map_err(|err| TaskError::InvalidSubtask(err.to_string()))?;
        if subtask.id() != self.subtask_id {
            return Err(TaskError::InvalidSubtask(format!(
                "envelope for subtask {} carries subtask {}",
                self.subtask_id,
                subtask.id()
            )));
        }
        Ok(subtask)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPullMessage {
    Ready { version: u32 },
    Subtask { subtask: SubtaskEnvelope },
    NoMoreTasks,
    Error { reason: String },
}

/// Subtasks not yet handed out; each is given to exactly one submitter.
#[derive(Debug, Default)]
pub struct SubtaskQueue {
    pending: Mutex<VecDeque<SubtaskEnvelope>>,
}

impl SubtaskQueue {
    pub fn from_task<T: Task>(task: &T) -> Result<Self, serde_json::Error> {
        let pending = task
            .subtasks()
            .iter()
            .map(SubtaskEnvelope::wrap)
            .collect::<Result<VecDeque<_>, _>>()?;
        Ok(Self {
            pending: Mutex::new(pending),
        })
    }

    pub fn take(&self) -> Option<SubtaskEnvelope> {
        self.pending.lock().pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Answer `ready` requests until the peer hangs up.
pub async fn serve_pulls<S>(stream: S, queue: &SubtaskQueue, read_timeout: Duration) -> Result<usize, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = JsonLines::new(stream, read_timeout);
    let mut handed_out = 0;
    while let Some(request) = lines.recv_optional::<TaskPullMessage>().await? {
        let reply = match request {
            TaskPullMessage::Ready { version } if version == PROTOCOL_VERSION => match queue.take() {
                Some(subtask) => {
                    handed_out += 1;
                    TaskPullMessage::Subtask { subtask }
                }
                None => TaskPullMessage::NoMoreTasks,
            },
            TaskPullMessage::Ready { version } => {
                lines
                    .send(&TaskPullMessage::Error {
                        reason: format!("unsupported protocol version {version}"),
                    })
                    .await?;
                return Err(NetworkError::VersionMismatch(version));
            }
            other => {
                return Err(NetworkError::Unexpected {
                    expected: "ready",
                    got: format!("{other:?}"),
                })
            }
        };
        lines.send(&reply).await?;
    }
    Ok(handed_out)
}

pub struct TaskPullServer {
    listener: TcpListener,
    queue: Arc<SubtaskQueue>,
    read_timeout: Duration,
}

impl TaskPullServer {
    pub async fn bind(addr: SocketAddr, queue: Arc<SubtaskQueue>, read_timeout: Duration) -> Result<Self, NetworkError> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            queue,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            listener,
            queue,
            read_timeout,
        } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(target: LOG_TARGET, %addr, remaining = queue.remaining(), "task-pull server listening");
        }
        accept_loop(listener, cancel, "task-pull", move |stream, peer| {
            let queue = Arc::clone(&queue);
            async move {
                match serve_pulls(stream, &queue, read_timeout).await {
                    Ok(handed_out) => debug!(target: LOG_TARGET, %peer, handed_out, "task-pull session closed"),
                    Err(err) => warn!(target: LOG_TARGET, %peer, error = %err, "task-pull session failed"),
                }
            }
        })
        .await;
    }
}

#[derive(Clone, Debug)]
pub struct TaskPullClient {
    addr: SocketAddr,
    read_timeout: Duration,
}

impl TaskPullClient {
    pub fn new(addr: SocketAddr, read_timeout: Duration) -> Self {
        Self { addr, read_timeout }
    }

    /// `None` once the requester has no subtasks left.
    pub async fn pull(&self) -> Result<Option<SubtaskEnvelope>, NetworkError> {
        let stream = connect(self.addr, self.read_timeout).await?;
        let mut lines = JsonLines::new(stream, self.read_timeout);
        lines
            .send(&TaskPullMessage::Ready {
                version: PROTOCOL_VERSION,
            })
            .await?;
        match lines.recv::<TaskPullMessage>().await? {
            TaskPullMessage::Subtask { subtask } => Ok(Some(subtask)),
            TaskPullMessage::NoMoreTasks => Ok(None),
            TaskPullMessage::Error { reason } => Err(NetworkError::Remote(reason)),
            other => Err(NetworkError::Unexpected {
                expected: "subtask",
                got: format!("{other:?}"),
            }),
        }
    }
}
