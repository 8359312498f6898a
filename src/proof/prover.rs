use std::fmt;
use std::sync::Arc;

use num_bigint::BigUint;
use rand::Rng;

use super::{ProofError, LOG_TARGET};
use crate::elgamal::{Ciphertext, PublicKey};

/// Fresh session; nothing sent yet.
#[derive(Debug)]
pub struct Ready;

/// Commitment sent; holds the one-time exponent behind it.
pub struct Committed {
    alpha_tmp: BigUint,
}

impl fmt::Debug for Committed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Committed { alpha_tmp: <redacted> }")
    }
}

/// Prover side of one session. Responding consumes it, so `alpha_tmp` answers one challenge only.
pub struct Prover<S> {
    pk: Arc<PublicKey>,
    alpha_prime: BigUint,
    state: S,
}

impl Prover<Ready> {
    pub fn new(pk: Arc<PublicKey>, alpha_prime: BigUint) -> Self {
        Self {
            pk,
            alpha_prime,
            state: Ready,
        }
    }

    /// Draw `alpha_tmp` and return the commitment `Enc0(alpha_tmp)`.
    pub fn commit<R: Rng + ?Sized>(self, rng: &mut R) -> (Prover<Committed>, Ciphertext) {
        let alpha_tmp = self.pk.random_exponent(rng);
        let e_prime = Ciphertext::encrypt_zero(&self.pk, &alpha_tmp);
        tracing::trace!(target: LOG_TARGET, "prover committed");
        (
            Prover {
                pk: self.pk,
                alpha_prime: self.alpha_prime,
                state: Committed { alpha_tmp },
            },
            e_prime,
        )
    }
}

impl Prover<Committed> {
    /// `beta = c * alpha_prime + alpha_tmp mod (p-1)`.
    pub fn respond(self, challenge: &BigUint) -> Result<BigUint, ProofError> {
        let order = self.pk.exponent_modulus();
        if challenge >= &order {
            return Err(ProofError::Malformed("challenge outside [0, p-2]".into()));
        }
        Ok((challenge * &self.alpha_prime + &self.state.alpha_tmp) % order)
    }
}

impl<S> fmt::Debug for Prover<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prover")
            .field("pk", &self.pk.fingerprint())
            .field("state", &std::any::type_name::<S>())
            .finish()
    }
}
