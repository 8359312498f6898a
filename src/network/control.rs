use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{accept_loop, connect, JsonLines, NetworkError, LOG_TARGET, PROTOCOL_VERSION};
use crate::ledger::Gas;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    GasCost { version: u32 },
    Start { version: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Gas { gas: Gas },
    Started,
    Error { reason: String },
}

/// What an operator can ask of a running node.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    fn gas_cost(&self) -> Gas;

    /// Trigger the node's main loop. Nodes without one refuse.
    async fn start(&self) -> Result<(), String> {
        Err("this node has nothing to start".into())
    }
}

pub async fn serve_control<S>(
    stream: S,
    handler: &dyn ControlHandler,
    read_timeout: Duration,
) -> Result<ControlRequest, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = JsonLines::new(stream, read_timeout);
    let request = lines.recv::<ControlRequest>().await?;
    let version = match &request {
        ControlRequest::GasCost { version } | ControlRequest::Start { version } => *version,
    };
    let reply = if version != PROTOCOL_VERSION {
        ControlReply::Error {
            reason: format!("unsupported protocol version {version}"),
        }
    } else {
        match &request {
            ControlRequest::GasCost { .. } => ControlReply::Gas {
                gas: handler.gas_cost(),
            },
            ControlRequest::Start { .. } => match handler.start().await {
                Ok(()) => ControlReply::Started,
                Err(reason) => ControlReply::Error { reason },
            },
        }
    };
    lines.send(&reply).await?;
    Ok(request)
}

pub struct ControlServer {
    listener: TcpListener,
    handler: Arc<dyn ControlHandler>,
    read_timeout: Duration,
}

impl ControlServer {
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn ControlHandler>,
        read_timeout: Duration,
    ) -> Result<Self, NetworkError> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            handler,
            read_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            listener,
            handler,
            read_timeout,
        } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(target: LOG_TARGET, %addr, "control server listening");
        }
        accept_loop(listener, cancel, "control", move |stream, peer| {
            let handler = Arc::clone(&handler);
            async move {
                match serve_control(stream, handler.as_ref(), read_timeout).await {
                    Ok(request) => debug!(target: LOG_TARGET, %peer, ?request, "control request served"),
                    Err(err) => warn!(target: LOG_TARGET, %peer, error = %err, "control session failed"),
                }
            }
        })
        .await;
    }
}

#[derive(Clone, Debug)]
pub struct ControlClient {
    addr: SocketAddr,
    read_timeout: Duration,
}

impl ControlClient {
    pub fn new(addr: SocketAddr, read_timeout: Duration) -> Self {
        Self { addr, read_timeout }
    }

    async fn request(&self, request: ControlRequest) -> Result<ControlReply, NetworkError> {
        let stream = connect(self.addr, self.read_timeout).await?;
        let mut lines = JsonLines::new(stream, self.read_timeout);
        lines.send(&request).await?;
        lines.recv().await
    }

    pub async fn gas_cost(&self) -> Result<Gas, NetworkError> {
        match self
            .request(ControlRequest::GasCost {
                version: PROTOCOL_VERSION,
            })
            .await?
        {
            ControlReply::Gas { gas } => Ok(gas),
            ControlReply::Error { reason } => Err(NetworkError::Remote(reason)),
            other => Err(NetworkError::Unexpected {
                expected: "gas",
                got: format!("{other:?}"),
            }),
        }
    }

    pub async fn start(&self) -> Result<(), NetworkError> {
        match self
            .request(ControlRequest::Start {
                version: PROTOCOL_VERSION,
            })
            .await?
        {
            ControlReply::Started => Ok(()),
            ControlReply::Error { reason } => Err(NetworkError::Remote(reason)),
            other => Err(NetworkError::Unexpected {
                expected: "started",
                got: format!("{other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixed {
        started: AtomicBool,
    }

    #[async_trait]
    impl ControlHandler for Fixed {
        fn gas_cost(&self) -> Gas {
            1_234
        }

        async fn start(&self) -> Result<(), String> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Passive;

    impl ControlHandler for Passive {
        fn gas_cost(&self) -> Gas {
            0
        }
    }

    #[tokio::test]
    async fn control_requests_reach_the_handler() {
        let handler = Arc::new(Fixed {
            started: AtomicBool::new(false),
        });
        let server = ControlServer::bind("127.0.0.1:0".parse().unwrap(), handler.clone(), Duration::from_secs(2))
            .await
            .unwrap();
        let client = ControlClient::new(server.local_addr().unwrap(), Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        assert_eq!(client.gas_cost().await.unwrap(), 1_234);
        client.start().await.unwrap();
        assert!(handler.started.load(Ordering::SeqCst));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn nodes_without_a_main_loop_refuse_to_start() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let timeout = Duration::from_secs(1);
        let server = serve_control(server_io, &Passive, timeout);
        let client = async move {
            let mut lines = JsonLines::new(client_io, timeout);
            lines
                .send(&ControlRequest::Start {
                    version: PROTOCOL_VERSION,
                })
                .await
                .unwrap();
            lines.recv::<ControlReply>().await.unwrap()
        };
        let (_, reply) = tokio::join!(server, client);
        assert!(matches!(reply, ControlReply::Error { .. }));
    }
}
