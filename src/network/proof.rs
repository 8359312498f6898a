use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use num_bigint::BigUint;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{accept_loop, connect, session_rng, JsonLines, NetworkError, LOG_TARGET, PROTOCOL_VERSION};
use crate::commitment::Commitment;
use crate::elgamal::{Ciphertext, PublicKey};
use crate::ledger::RandomizerId;
use crate::proof::{ProofError, Prover, VerificationOutcome, Verifier};
use crate::randomizer::ProofStore;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProofMessage {
    Open {
        version: u32,
        commitment: Commitment,
    },
    Commit {
        e_prime: Ciphertext,
    },
    Challenge {
        #[serde(with = "crate::crypto_serde::biguint")]
        c: BigUint,
    },
    Response {
        #[serde(with = "crate::crypto_serde::biguint")]
        beta: BigUint,
    },
    Error {
        reason: String,
    },
}

impl ProofMessage {
    fn kind(&self) -> &'static str {
        match self {
            ProofMessage::Open { .. } => "open",
            ProofMessage::Commit { .. } => "commit",
            ProofMessage::Challenge { .. } => "challenge",
            ProofMessage::Response { .. } => "response",
            ProofMessage::Error { .. } => "error",
        }
    }
}

fn unexpected(expected: &'static str, got: &ProofMessage) -> NetworkError {
    match got {
        ProofMessage::Error { reason } => NetworkError::Remote(reason.clone()),
        other => NetworkError::Unexpected {
            expected,
            got: other.kind().to_string(),
        },
    }
}

/// Prover side of one session. The stored exponent is only read, never removed.
pub async fn serve_session<S, R>(
    stream: S,
    store: &ProofStore,
    pk: &Arc<PublicKey>,
    read_timeout: Duration,
    rng: &mut R,
) -> Result<Commitment, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Rng + ?Sized,
{
    let mut lines = JsonLines::new(stream, read_timeout);

    let commitment = match lines.recv::<ProofMessage>().await? {
        ProofMessage::Open { version, commitment } if version == PROTOCOL_VERSION => commitment,
        ProofMessage::Open { version, .. } => {
            lines
                .send(&ProofMessage::Error {
                    reason: format!("unsupported protocol version {version}"),
                })
                .await?;
            return Err(NetworkError::VersionMismatch(version));
        }
        other => return Err(unexpected("open", &other)),
    };

    let Some(alpha_prime) = store.get(&commitment) else {
        let err = ProofError::UnknownCommitment(commitment);
        lines
            .send(&ProofMessage::Error {
                reason: err.to_string(),
            })
            .await?;
        return Err(err.into());
    };

    let (prover, e_prime) = Prover::new(Arc::clone(pk), alpha_prime).commit(rng);
    lines.send(&ProofMessage::Commit { e_prime }).await?;

    let challenge = match lines.recv::<ProofMessage>().await? {
        ProofMessage::Challenge { c } => c,
        other => return Err(unexpected("challenge", &other)),
    };
    let beta = match prover.respond(&challenge) {
        Ok(beta) => beta,
        Err(err) => {
            lines
                .send(&ProofMessage::Error {
                    reason: err.to_string(),
                })
                .await?;
            return Err(err.into());
        }
    };
    lines.send(&ProofMessage::Response { beta }).await?;
    Ok(commitment)
}

/// Verifier side of one session against the prover at the other end of `stream`.
pub async fn run_verifier<S, R>(
    stream: S,
    read_timeout: Duration,
    commitment: Commitment,
    old: &[Ciphertext],
    new: &[Ciphertext],
    rng: &mut R,
) -> Result<VerificationOutcome, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: Rng + ?Sized,
{
    let verifier = Verifier::new(old, new)?;
    let mut lines = JsonLines::new(stream, read_timeout);

    lines
        .send(&ProofMessage::Open {
            version: PROTOCOL_VERSION,
            commitment,
        })
        .await?;

    let e_prime = match lines.recv::<ProofMessage>().await? {
        ProofMessage::Commit { e_prime } => e_prime,
        other => return Err(unexpected("commit", &other)),
    };
    let (verifier, c) = verifier.receive_commitment(e_prime, rng)?;
    lines.send(&ProofMessage::Challenge { c }).await?;

    let beta = match lines.recv::<ProofMessage>().await? {
        ProofMessage::Response { beta } => beta,
        other => return Err(unexpected("response", &other)),
    };
    Ok(verifier.finish(beta))
}

/// Serves proofs for every commitment in this node's [`ProofStore`].
pub struct ProofServer {
    listener: TcpListener,
    randomizer_id: RandomizerId,
    pk: Arc<PublicKey>,
    store: Arc<ProofStore>,
    read_timeout: Duration,
    rng: Arc<Mutex<StdRng>>,
}

impl ProofServer {
    pub async fn bind(
        addr: SocketAddr,
        randomizer_id: RandomizerId,
        pk: Arc<PublicKey>,
        store: Arc<ProofStore>,
        read_timeout: Duration,
        rng: StdRng,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            randomizer_id,
            pk,
            store,
            read_timeout,
            rng: Arc::new(Mutex::new(rng)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            listener,
            randomizer_id,
            pk,
            store,
            read_timeout,
            rng,
        } = self;
        if let Ok(addr) = listener.local_addr() {
            info!(target: LOG_TARGET, randomizer_id, %addr, "proof server listening");
        }

        accept_loop(listener, cancel, "proof-server", move |stream, peer| {
            let pk = Arc::clone(&pk);
            let store = Arc::clone(&store);
            let mut rng = session_rng(&rng);
            async move {
                match serve_session(stream, &store, &pk, read_timeout, &mut rng).await {
                    Ok(commitment) => debug!(
                        target: LOG_TARGET,
                        randomizer_id,
                        %peer,
                        %commitment,
                        "proof session served"
                    ),
                    Err(err) => warn!(
                        target: LOG_TARGET,
                        randomizer_id,
                        %peer,
                        error = %err,
                        "proof session failed"
                    ),
                }
            }
        })
        .await;
        info!(target: LOG_TARGET, randomizer_id, "proof server stopped");
    }
}

/// Where each randomizer's proof server listens.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: DashMap<RandomizerId, SocketAddr>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, randomizer_id: RandomizerId, addr: SocketAddr) {
        self.peers.insert(randomizer_id, addr);
    }

    pub fn resolve(&self, randomizer_id: RandomizerId) -> Option<SocketAddr> {
        self.peers.get(&randomizer_id).map(|entry| *entry.value())
    }
}

#[async_trait]
pub trait ProofClient: Send + Sync {
    /// Run one verification session against `randomizer_id` for the step `old -> new`.
    async fn verify_step(
        &self,
        randomizer_id: RandomizerId,
        commitment: Commitment,
        old: &[Ciphertext],
        new: &[Ciphertext],
    ) -> Result<VerificationOutcome, NetworkError>;
}

pub struct TcpProofClient {
    peers: Arc<PeerDirectory>,
    read_timeout: Duration,
    rng: Mutex<StdRng>,
}

impl TcpProofClient {
    pub fn new(peers: Arc<PeerDirectory>, read_timeout: Duration, rng: StdRng) -> Self {
        Self {
            peers,
            read_timeout,
            rng: Mutex::new(rng),
        }
    }
}

#[async_trait]
impl ProofClient for TcpProofClient {
    async fn verify_step(
        &self,
        randomizer_id: RandomizerId,
        commitment: Commitment,
        old: &[Ciphertext],
        new: &[Ciphertext],
    ) -> Result<VerificationOutcome, NetworkError> {
        let addr = self
            .peers
            .resolve(randomizer_id)
            .ok_or(NetworkError::UnknownPeer(randomizer_id))?;
        let stream = connect(addr, self.read_timeout).await?;
        let mut rng = session_rng(&self.rng);
        run_verifier(stream, self.read_timeout, commitment, old, new, &mut rng).await
    }
}
