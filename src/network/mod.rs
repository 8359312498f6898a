//! Line-delimited JSON protocols between nodes.
//!
//! Every exchange is a synchronous request/response conversation over one stream. Reads are
//! bounded by a per-read timeout so a silent peer cannot stall a session.

pub mod control;
pub mod proof;
pub mod task_pull;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ledger::RandomizerId;
use crate::proof::ProofError;
use crate::tokio_tools::spawn_named_task;

pub use control::{ControlClient, ControlHandler, ControlReply, ControlRequest, ControlServer};
pub use proof::{PeerDirectory, ProofClient, ProofMessage, ProofServer, TcpProofClient};
pub use task_pull::{SubtaskEnvelope, SubtaskQueue, TaskPullClient, TaskPullMessage, TaskPullServer};

const LOG_TARGET: &str = "legit_crowd::network";

/// Carried by the opening message of every conversation.
pub const PROTOCOL_VERSION: u32 = 1;

const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] LinesCodecError),

    #[error("invalid message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("peer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("unexpected message: expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: String },

    #[error("peer reported error: {0}")]
    Remote(String),

    #[error("unsupported protocol version {0}")]
    VersionMismatch(u32),

    #[error("no address known for randomizer {0}")]
    UnknownPeer(RandomizerId),

    #[error(transparent)]
    Proof(#[from] ProofError),
}

/// JSON values framed one per line.
pub struct JsonLines<S> {
    inner: Framed<S, LinesCodec>,
    read_timeout: Duration,
}

impl<S> JsonLines<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            inner: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            read_timeout,
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), NetworkError> {
        let line = serde_json::to_string(message)?;
        self.inner.send(line).await?;
        Ok(())
    }

    /// Next message; `None` when the peer closed the stream cleanly.
    pub async fn recv_optional<T: DeserializeOwned>(&mut self) -> Result<Option<T>, NetworkError> {
        match tokio::time::timeout(self.read_timeout, self.inner.next()).await {
            Err(_) => Err(NetworkError::Timeout(self.read_timeout)),
            Ok(None) => Ok(None),
            Ok(Some(line)) => Ok(Some(serde_json::from_str(&line?)?)),
        }
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, NetworkError> {
        self.recv_optional().await?.ok_or(NetworkError::Closed)
    }
}

pub(crate) async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, NetworkError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(NetworkError::Timeout(timeout)),
    }
}

/// Per-session generator split off a shared seeded one.
pub(crate) fn session_rng(shared: &Mutex<StdRng>) -> StdRng {
    let mut seed = [0u8; 32];
    shared.lock().fill_bytes(&mut seed);
    StdRng::from_seed(seed)
}

/// Accept connections until cancelled, running each one as its own task.
pub(crate) async fn accept_loop<F, Fut>(
    listener: TcpListener,
    cancel: CancellationToken,
    name: &'static str,
    mut on_connection: F,
) where
    F: FnMut(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target: LOG_TARGET, server = name, "listener cancelled");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let session = on_connection(stream, peer);
                    let cancel = cancel.clone();
                    spawn_named_task(format!("{name}-session-{peer}"), async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = session => {}
                        }
                    });
                }
                Err(err) => {
                    warn!(target: LOG_TARGET, server = name, error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn messages_cross_a_duplex_stream() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = JsonLines::new(a, Duration::from_secs(1));
        let mut right = JsonLines::new(b, Duration::from_secs(1));
        left.send(&Ping { n: 7 }).await.unwrap();
        assert_eq!(right.recv::<Ping>().await.unwrap(), Ping { n: 7 });
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (a, _b) = tokio::io::duplex(1024);
        let mut side = JsonLines::new(a, Duration::from_millis(20));
        assert!(matches!(side.recv::<Ping>().await, Err(NetworkError::Timeout(_))));
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (a, b) = tokio::io::duplex(1024);
        drop(b);
        let mut side = JsonLines::new(a, Duration::from_secs(1));
        assert!(side.recv_optional::<Ping>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        use tokio::io::AsyncWriteExt;
        let (a, mut b) = tokio::io::duplex(1024);
        b.write_all(b"not json\n").await.unwrap();
        let mut side = JsonLines::new(a, Duration::from_secs(1));
        assert!(matches!(side.recv::<Ping>().await, Err(NetworkError::Decode(_))));
    }
}
