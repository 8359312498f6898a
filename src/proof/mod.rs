//! Interactive proof that a ciphertext list is a re-encryption of another.
//!
//! The prover knows `alpha_prime` with `new = old * Enc0(alpha_prime)` block by block and
//! shows it through a 3-move sigma protocol:
//!
//! 1. commit: `e_prime = Enc0(alpha_tmp)` for a fresh `alpha_tmp`;
//! 2. challenge: the verifier draws `c` uniformly from `[0, p-2]`;
//! 3. respond: `beta = c * alpha_prime + alpha_tmp mod (p-1)`.
//!
//! The verifier accepts iff `Enc0(beta) == e^c * e_prime` component-wise for every block,
//! where `e = new - old`.

pub mod prover;
pub mod verifier;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commitment::Commitment;
use crate::elgamal::{Ciphertext, ElGamalError};

pub use prover::{Committed, Prover, Ready};
pub use verifier::{AwaitingCommitment, Challenged, VerificationOutcome, Verifier};

const LOG_TARGET: &str = "legit_crowd::proof";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("no re-encryption exponent stored for commitment {0}")]
    UnknownCommitment(Commitment),

    #[error("malformed proof message: {0}")]
    Malformed(String),

    #[error(transparent)]
    ElGamal(#[from] ElGamalError),
}

/// Everything a verifier saw in one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofTranscript {
    pub e_prime: Ciphertext,
    #[serde(with = "crate::crypto_serde::biguint")]
    pub challenge: BigUint,
    #[serde(with = "crate::crypto_serde::biguint")]
    pub beta: BigUint,
}

impl ProofTranscript {
    /// Re-check a recorded transcript against a ciphertext pair.
    pub fn verify(&self, old: &[Ciphertext], new: &[Ciphertext]) -> bool {
        match differences(old, new) {
            Ok(diffs) => check_response(&diffs, &self.e_prime, &self.challenge, &self.beta),
            Err(err) => {
                tracing::debug!(target: LOG_TARGET, error = %err, "transcript does not fit ciphertext pair");
                false
            }
        }
    }
}

/// Block-wise `new - old`; both lists must be non-empty, equally long and under one key.
///
/// Every difference has to be an element of the order-`q` subgroup, otherwise a factor of
/// `p - 1` smuggled into `new` survives every even challenge.
pub(crate) fn differences(old: &[Ciphertext], new: &[Ciphertext]) -> Result<Vec<Ciphertext>, ProofError> {
    if old.is_empty() {
        return Err(ProofError::Malformed("empty ciphertext list".into()));
    }
    if old.len() != new.len() {
        return Err(ElGamalError::BlockCountMismatch {
            expected: old.len(),
            actual: new.len(),
        }
        .into());
    }
    old.iter()
        .zip(new)
        .map(|(before, after)| {
            before.validate()?;
            after.validate()?;
            let diff = after.sub(before)?;
            diff.validate_subgroup()?;
            Ok(diff)
        })
        .collect()
}

/// `Enc0(beta) == e^c * e_prime` for every difference `e`.
pub(crate) fn check_response(diffs: &[Ciphertext], e_prime: &Ciphertext, c: &BigUint, beta: &BigUint) -> bool {
    let Some(first) = diffs.first() else {
        return false;
    };
    let pk = &first.pk;
    if e_prime.pk != *pk || e_prime.validate().is_err() || e_prime.validate_subgroup().is_err() {
        return false;
    }
    let p = &pk.p;
    let expected = Ciphertext::encrypt_zero(pk, beta);

    diffs.iter().enumerate().all(|(block, e)| {
        let rhs_cm = (e.cm.modpow(c, p) * &e_prime.cm) % p;
        let rhs_cr = (e.cr.modpow(c, p) * &e_prime.cr) % p;
        let cm_ok = expected.cm == rhs_cm;
        let cr_ok = expected.cr == rhs_cr;
        if !(cm_ok && cr_ok) {
            tracing::debug!(target: LOG_TARGET, block, cm_ok, cr_ok, "response check failed");
        }
        cm_ok && cr_ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elgamal::{encrypt_integer, re_encrypt_blocks};
    use crate::test_utils::keys::{small_keys, standard_keys};
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::Arc;

    fn run_session(
        alpha_prime: &BigUint,
        old: &[Ciphertext],
        new: &[Ciphertext],
        rng: &mut StdRng,
    ) -> VerificationOutcome {
        let pk = Arc::clone(&old[0].pk);
        let (prover, e_prime) = Prover::new(pk, alpha_prime.clone()).commit(rng);
        let (verifier, c) = Verifier::new(old, new)
            .unwrap()
            .receive_commitment(e_prime, rng)
            .unwrap();
        let beta = prover.respond(&c).unwrap();
        verifier.finish(beta)
    }

    #[test]
    fn honest_prover_is_accepted() {
        let (pk, _) = small_keys();
        let mut rng = StdRng::seed_from_u64(41);
        for _ in 0..8 {
            let m = BigUint::from(rng_value(&mut rng));
            let old = vec![encrypt_integer(&pk, &m, None, &mut rng).unwrap()];
            let alpha_prime = pk.random_exponent(&mut rng);
            let new = re_encrypt_blocks(&old, &alpha_prime);
            let outcome = run_session(&alpha_prime, &old, &new, &mut rng);
            assert!(outcome.accepted);
            assert!(outcome.transcript.verify(&old, &new));
        }
    }

    fn rng_value(rng: &mut StdRng) -> u64 {
        use rand::Rng;
        rng.gen_range(1..1_000_000)
    }

    #[test]
    fn one_exponent_covers_every_block() {
        let (pk, _) = small_keys();
        let mut rng = StdRng::seed_from_u64(42);
        let old = crate::elgamal::encrypt_bytes(&pk, &[7u8; 50], None, &mut rng).unwrap();
        assert!(old.len() > 1);
        let alpha_prime = pk.random_exponent(&mut rng);
        let new = re_encrypt_blocks(&old, &alpha_prime);
        assert!(run_session(&alpha_prime, &old, &new, &mut rng).accepted);
    }

    #[test]
    fn wrong_exponent_is_rejected() {
        let (pk, _) = small_keys();
        let mut rng = StdRng::seed_from_u64(43);
        let old = vec![encrypt_integer(&pk, &BigUint::from(99u32), None, &mut rng).unwrap()];
        let used = pk.random_exponent(&mut rng);
        let claimed = (&used + 1u32) % pk.exponent_modulus();
        let new = re_encrypt_blocks(&old, &used);
        for _ in 0..8 {
            assert!(!run_session(&claimed, &old, &new, &mut rng).accepted);
        }
    }

    /// `new.cm` carries an extra factor `p - 1`, so `new` decrypts to `p - m`.
    fn sign_flipped(old: &[Ciphertext], alpha_prime: &BigUint) -> Vec<Ciphertext> {
        let mut new = re_encrypt_blocks(old, alpha_prime);
        let p = old[0].pk.p.clone();
        new[0].cm = (&new[0].cm * (&p - 1u32)) % &p;
        new
    }

    #[test]
    fn plaintext_changing_step_is_never_accepted() {
        let (pk, sk) = small_keys();
        let mut rng = StdRng::seed_from_u64(47);
        let m = BigUint::from(12_345u32);
        let old = vec![encrypt_integer(&pk, &m, None, &mut rng).unwrap()];
        let alpha_prime = pk.random_exponent(&mut rng);
        let forged = sign_flipped(&old, &alpha_prime);
        assert_ne!(crate::elgamal::decrypt_integer(&sk, &forged[0]).unwrap(), m);

        assert!(matches!(
            Verifier::new(&old, &forged),
            Err(ProofError::ElGamal(ElGamalError::OutsideSubgroup))
        ));
        // recorded transcripts from an honest prover never vouch for the forged pair either
        for _ in 0..64 {
            let (prover, e_prime) = Prover::new(Arc::clone(&pk), alpha_prime.clone()).commit(&mut rng);
            let c = pk.random_exponent(&mut rng);
            let beta = prover.respond(&c).unwrap();
            let transcript = ProofTranscript {
                e_prime,
                challenge: c,
                beta,
            };
            assert!(!transcript.verify(&old, &forged));
        }
    }

    #[test]
    fn commitment_outside_the_subgroup_is_refused() {
        let (pk, _) = small_keys();
        let mut rng = StdRng::seed_from_u64(48);
        let old = vec![encrypt_integer(&pk, &BigUint::from(8u32), None, &mut rng).unwrap()];
        let new = re_encrypt_blocks(&old, &BigUint::from(21u32));
        let mut e_prime = Ciphertext::encrypt_zero(&pk, &BigUint::from(6u32));
        e_prime.cr = (&e_prime.cr * (&pk.p - 1u32)) % &pk.p;
        assert!(matches!(
            Verifier::new(&old, &new).unwrap().receive_commitment(e_prime, &mut rng),
            Err(ProofError::ElGamal(ElGamalError::OutsideSubgroup))
        ));
    }

    #[test]
    fn mismatched_block_counts_are_malformed() {
        let (pk, _) = small_keys();
        let mut rng = StdRng::seed_from_u64(44);
        let old = crate::elgamal::encrypt_bytes(&pk, &[1u8; 40], None, &mut rng).unwrap();
        let new = re_encrypt_blocks(&old[..1], &BigUint::from(5u32));
        assert!(Verifier::new(&old, &new).is_err());
        assert!(Verifier::new(&[], &[]).is_err());
    }

    #[test]
    fn second_hop_proof_binds_to_its_input() {
        let (pk, sk) = standard_keys();
        let mut rng = StdRng::seed_from_u64(45);
        let m = BigUint::from(12_345u32);
        let c0 = vec![encrypt_integer(&pk, &m, None, &mut rng).unwrap()];
        let a1 = pk.random_exponent(&mut rng);
        let c1 = re_encrypt_blocks(&c0, &a1);
        let a2 = pk.random_exponent(&mut rng);
        let c2 = re_encrypt_blocks(&c1, &a2);
        assert_ne!(a1, a2);
        assert_eq!(crate::elgamal::decrypt_integer(&sk, &c2[0]).unwrap(), m);

        let outcome = run_session(&a2, &c1, &c2, &mut rng);
        assert!(outcome.accepted);
        assert!(!outcome.transcript.verify(&c0, &c2));
    }

    #[test]
    fn transcripts_serialize() {
        let (pk, _) = small_keys();
        let mut rng = StdRng::seed_from_u64(46);
        let old = vec![encrypt_integer(&pk, &BigUint::from(3u32), None, &mut rng).unwrap()];
        let alpha_prime = pk.random_exponent(&mut rng);
        let new = re_encrypt_blocks(&old, &alpha_prime);
        let outcome = run_session(&alpha_prime, &old, &new, &mut rng);
        let restored: ProofTranscript = crate::test_utils::serde::assert_round_trip_eq(&outcome.transcript);
        assert!(restored.verify(&old, &new));
    }
}
