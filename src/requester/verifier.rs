use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::LOG_TARGET;
use crate::blob_store::{fetch_ciphertexts, BlobStore};
use crate::commitment::Commitment;
use crate::elgamal::{decrypt_bytes, Ciphertext, PrivateKey, PublicKey};
use crate::ledger::{ContentPointer, LedgerError, LedgerReader, RandomizerId, SubtaskId};
use crate::network::{NetworkError, ProofClient};

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("subtask {subtask_id} has {steps} steps for {randomizers} randomizers")]
    InconsistentChain {
        subtask_id: SubtaskId,
        steps: usize,
        randomizers: usize,
    },
}

/// Local check of one published chain entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCheck {
    pub pointer: ContentPointer,
    pub commitment: Commitment,
    /// The blob was fetched and hashes to the recorded commitment.
    pub matches: bool,
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum StepVerdict {
    Accepted,
    Rejected { reason: String },
    /// The input of the step was discarded, so there is nothing sound to verify against.
    Unverifiable,
    Unreachable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub randomizer_id: RandomizerId,
    pub verdict: StepVerdict,
}

/// Everything the requester learned about one subtask's chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub subtask_id: SubtaskId,
    pub entries: Vec<EntryCheck>,
    pub steps: Vec<StepReport>,
    /// Decrypted answer bytes; `None` when the initial entry could not be trusted.
    pub answer: Option<Vec<u8>>,
    pub flagged: Vec<RandomizerId>,
    pub checked_at: DateTime<Utc>,
}

impl ChainReport {
    pub fn fully_verified(&self) -> bool {
        self.entries.iter().all(|entry| entry.matches)
            && self.steps.iter().all(|step| step.verdict == StepVerdict::Accepted)
    }
}

/// Recomputes every commitment of a finished chain, verifies each re-encryption step against
/// the randomizer that produced it, and decrypts the submitted answer.
pub struct ChainVerifier {
    pk: Arc<PublicKey>,
    sk: Arc<PrivateKey>,
    ledger: Arc<dyn LedgerReader>,
    blobs: Arc<dyn BlobStore>,
    proofs: Arc<dyn ProofClient>,
}

impl ChainVerifier {
    pub fn new(
        pk: Arc<PublicKey>,
        sk: Arc<PrivateKey>,
        ledger: Arc<dyn LedgerReader>,
        blobs: Arc<dyn BlobStore>,
        proofs: Arc<dyn ProofClient>,
    ) -> Self {
        Self {
            pk,
            sk,
            ledger,
            blobs,
            proofs,
        }
    }

    async fn load_entry(&self, pointer: &ContentPointer, commitment: &Commitment) -> (EntryCheck, Option<Vec<Ciphertext>>) {
        let (matches, reason, ciphertexts) = match fetch_ciphertexts(self.blobs.as_ref(), pointer, &self.pk).await {
            Ok(ciphertexts) if commitment.matches(&ciphertexts) => (true, None, Some(ciphertexts)),
            Ok(_) => (false, Some("commitment mismatch".to_string()), None),
            Err(err) => (false, Some(err.to_string()), None),
        };
        let check = EntryCheck {
            pointer: pointer.clone(),
            commitment: *commitment,
            matches,
            reason,
        };
        (check, ciphertexts)
    }

    #[instrument(skip(self), level = "debug", target = LOG_TARGET)]
    pub async fn verify_subtask(&self, subtask_id: SubtaskId) -> Result<ChainReport, VerifierError> {
        let chain = self.ledger.final_result(subtask_id).await?;
        if chain.steps.len() != chain.order.len() {
            return Err(VerifierError::InconsistentChain {
                subtask_id,
                steps: chain.steps.len(),
                randomizers: chain.order.len(),
            });
        }

        let mut entries = Vec::with_capacity(chain.steps.len() + 1);
        let mut ciphertexts = Vec::with_capacity(chain.steps.len() + 1);
        for entry in chain.entries() {
            let (check, loaded) = self.load_entry(&entry.pointer, &entry.commitment).await;
            if !check.matches {
                warn!(
                    target: LOG_TARGET,
                    subtask_id,
                    pointer = %entry.pointer,
                    reason = check.reason.as_deref().unwrap_or_default(),
                    "chain entry discarded"
                );
            }
            entries.push(check);
            ciphertexts.push(loaded);
        }

        let mut steps = Vec::with_capacity(chain.order.len());
        let mut flagged = Vec::new();
        // strictly in chain order: step i turns entry i-1 into entry i
        for (index, randomizer_id) in chain.order.iter().copied().enumerate() {
            let verdict = match (&ciphertexts[index], &ciphertexts[index + 1]) {
                (_, None) => StepVerdict::Rejected {
                    reason: "published entry discarded".into(),
                },
                (None, Some(_)) => StepVerdict::Unverifiable,
                (Some(old), Some(new)) => {
                    let commitment = entries[index + 1].commitment;
                    match self.proofs.verify_step(randomizer_id, commitment, old, new).await {
                        Ok(outcome) if outcome.accepted => StepVerdict::Accepted,
                        Ok(_) => StepVerdict::Rejected {
                            reason: "proof did not verify".into(),
                        },
                        Err(NetworkError::Remote(reason)) => StepVerdict::Rejected { reason },
                        Err(NetworkError::Proof(err)) => StepVerdict::Rejected {
                            reason: err.to_string(),
                        },
                        Err(err) => StepVerdict::Unreachable {
                            reason: err.to_string(),
                        },
                    }
                }
            };
            match &verdict {
                StepVerdict::Accepted => {
                    debug!(target: LOG_TARGET, subtask_id, randomizer_id, "re-encryption step verified")
                }
                StepVerdict::Rejected { reason } => {
                    warn!(target: LOG_TARGET, subtask_id, randomizer_id, reason = %reason, "randomizer flagged");
                    flagged.push(randomizer_id);
                }
                other => {
                    warn!(target: LOG_TARGET, subtask_id, randomizer_id, verdict = ?other, "step not verified")
                }
            }
            steps.push(StepReport { randomizer_id, verdict });
        }

        let answer = match &ciphertexts[0] {
            Some(initial) => match decrypt_bytes(&self.sk, initial) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!(target: LOG_TARGET, subtask_id, error = %err, "initial submission does not decrypt");
                    None
                }
            },
            None => None,
        };

        Ok(ChainReport {
            subtask_id,
            entries,
            steps,
            answer,
            flagged,
            checked_at: Utc::now(),
        })
    }
}
