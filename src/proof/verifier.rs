use std::sync::Arc;

use num_bigint::BigUint;
use rand::Rng;

use super::{check_response, differences, ProofError, ProofTranscript, LOG_TARGET};
use crate::elgamal::{Ciphertext, PublicKey};

#[derive(Debug)]
pub struct AwaitingCommitment;

#[derive(Debug)]
pub struct Challenged {
    e_prime: Ciphertext,
    challenge: BigUint,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub accepted: bool,
    pub transcript: ProofTranscript,
}

/// Verifier side of one session over a fixed `(old, new)` pair.
#[derive(Debug)]
pub struct Verifier<S> {
    pk: Arc<PublicKey>,
    diffs: Vec<Ciphertext>,
    state: S,
}

impl Verifier<AwaitingCommitment> {
    pub fn new(old: &[Ciphertext], new: &[Ciphertext]) -> Result<Self, ProofError> {
        let diffs = differences(old, new)?;
        let pk = Arc::clone(&diffs[0].pk);
        Ok(Self {
            pk,
            diffs,
            state: AwaitingCommitment,
        })
    }

    /// Accept the prover's commitment and draw a fresh challenge for it.
    pub fn receive_commitment<R: Rng + ?Sized>(
        self,
        e_prime: Ciphertext,
        rng: &mut R,
    ) -> Result<(Verifier<Challenged>, BigUint), ProofError> {
        if *e_prime.pk != *self.pk {
            return Err(ProofError::Malformed("commitment under a different key".into()));
        }
        e_prime.validate()?;
        e_prime.validate_subgroup()?;
        let e_prime = Ciphertext::new(e_prime.cm, e_prime.cr, Arc::clone(&self.pk));
        let challenge = self.pk.random_exponent(rng);
        Ok((
            Verifier {
                pk: self.pk,
                diffs: self.diffs,
                state: Challenged {
                    e_prime,
                    challenge: challenge.clone(),
                },
            },
            challenge,
        ))
    }
}

impl Verifier<Challenged> {
    pub fn finish(self, beta: BigUint) -> VerificationOutcome {
        let Challenged { e_prime, challenge } = self.state;
        let accepted = beta < self.pk.exponent_modulus() && check_response(&self.diffs, &e_prime, &challenge, &beta);
        tracing::debug!(target: LOG_TARGET, accepted, blocks = self.diffs.len(), "proof session finished");
        VerificationOutcome {
            accepted,
            transcript: ProofTranscript {
                e_prime,
                challenge,
                beta,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elgamal::{encrypt_integer, re_encrypt_blocks};
    use crate::test_utils::keys::{other_small_keys, small_keys};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn foreign_commitment_is_malformed() {
        let (pk, _) = small_keys();
        let (other, _) = other_small_keys();
        let mut rng = StdRng::seed_from_u64(61);
        let old = vec![encrypt_integer(&pk, &BigUint::from(4u32), None, &mut rng).unwrap()];
        let new = re_encrypt_blocks(&old, &BigUint::from(11u32));
        let verifier = Verifier::new(&old, &new).unwrap();
        let foreign = Ciphertext::encrypt_zero(&other, &BigUint::from(3u32));
        assert!(matches!(
            verifier.receive_commitment(foreign, &mut rng),
            Err(ProofError::Malformed(_))
        ));
    }

    #[test]
    fn challenges_are_fresh_per_session() {
        let (pk, _) = small_keys();
        let mut rng = StdRng::seed_from_u64(62);
        let old = vec![encrypt_integer(&pk, &BigUint::from(4u32), None, &mut rng).unwrap()];
        let new = re_encrypt_blocks(&old, &BigUint::from(11u32));
        let e_prime = Ciphertext::encrypt_zero(&pk, &BigUint::from(5u32));
        let (_, c1) = Verifier::new(&old, &new)
            .unwrap()
            .receive_commitment(e_prime.clone(), &mut rng)
            .unwrap();
        let (_, c2) = Verifier::new(&old, &new)
            .unwrap()
            .receive_commitment(e_prime, &mut rng)
            .unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn oversized_response_is_rejected() {
        let (pk, _) = small_keys();
        let mut rng = StdRng::seed_from_u64(63);
        let old = vec![encrypt_integer(&pk, &BigUint::from(4u32), None, &mut rng).unwrap()];
        let new = re_encrypt_blocks(&old, &BigUint::from(11u32));
        let e_prime = Ciphertext::encrypt_zero(&pk, &BigUint::from(5u32));
        let (verifier, _) = Verifier::new(&old, &new)
            .unwrap()
            .receive_commitment(e_prime, &mut rng)
            .unwrap();
        assert!(!verifier.finish(pk.p.clone()).accepted);
    }
}
