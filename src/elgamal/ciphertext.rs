use std::fmt;
use std::sync::Arc;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

use super::error::ElGamalError;
use super::group::mod_inverse;
use super::keys::PublicKey;
use crate::crypto_serde::biguint_to_hex;

/// ElGamal ciphertext `(cm, cr) = (m * h^alpha, g^alpha)` bound to the key it was made under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    #[serde(with = "crate::crypto_serde::biguint")]
    pub cm: BigUint,
    #[serde(with = "crate::crypto_serde::biguint")]
    pub cr: BigUint,
    pub pk: Arc<PublicKey>,
}

impl Ciphertext {
    pub fn new(cm: BigUint, cr: BigUint, pk: Arc<PublicKey>) -> Self {
        Self { cm, cr, pk }
    }

    /// Encrypt a group element `m` in `[1, p-1]` under exponent `alpha`.
    pub fn encrypt(pk: &Arc<PublicKey>, m: &BigUint, alpha: &BigUint) -> Result<Self, ElGamalError> {
        if m.is_zero() || m >= &pk.p {
            return Err(ElGamalError::MessageOutOfRange);
        }
        let cm = (m * pk.h.modpow(alpha, &pk.p)) % &pk.p;
        let cr = pk.g.modpow(alpha, &pk.p);
        Ok(Self::new(cm, cr, Arc::clone(pk)))
    }

    /// Encryption of the neutral plaintext `g^0 = 1`: `(h^alpha, g^alpha)`.
    pub fn encrypt_zero(pk: &Arc<PublicKey>, alpha: &BigUint) -> Self {
        let cm = pk.h.modpow(alpha, &pk.p);
        let cr = pk.g.modpow(alpha, &pk.p);
        Self::new(cm, cr, Arc::clone(pk))
    }

    /// The neutral ciphertext `(1, 1)`.
    pub fn identity(pk: &Arc<PublicKey>) -> Self {
        Self::new(BigUint::one(), BigUint::one(), Arc::clone(pk))
    }

    /// Both components must be units of `Z_p`.
    pub fn validate(&self) -> Result<(), ElGamalError> {
        let p = &self.pk.p;
        for component in [&self.cm, &self.cr] {
            if component.is_zero() || component >= p {
                return Err(ElGamalError::MalformedCiphertext);
            }
        }
        Ok(())
    }

    /// Both components must lie in the subgroup generated by `g`.
    ///
    /// Every encryption of zero does; a component carrying a factor of order 2 does not.
    pub fn validate_subgroup(&self) -> Result<(), ElGamalError> {
        if self.pk.in_subgroup(&self.cm) && self.pk.in_subgroup(&self.cr) {
            Ok(())
        } else {
            Err(ElGamalError::OutsideSubgroup)
        }
    }

    fn ensure_same_key(&self, other: &Ciphertext) -> Result<(), ElGamalError> {
        if Arc::ptr_eq(&self.pk, &other.pk) || self.pk == other.pk {
            Ok(())
        } else {
            Err(ElGamalError::KeyMismatch)
        }
    }

    /// Homomorphic composition; multiplies the underlying plaintexts.
    pub fn add(&self, other: &Ciphertext) -> Result<Ciphertext, ElGamalError> {
        self.ensure_same_key(other)?;
        let p = &self.pk.p;
        Ok(Self::new(
            (&self.cm * &other.cm) % p,
            (&self.cr * &other.cr) % p,
            Arc::clone(&self.pk),
        ))
    }

    pub fn negate(&self) -> Result<Ciphertext, ElGamalError> {
        let p = &self.pk.p;
        let cm = mod_inverse(&self.cm, p).ok_or(ElGamalError::MalformedCiphertext)?;
        let cr = mod_inverse(&self.cr, p).ok_or(ElGamalError::MalformedCiphertext)?;
        Ok(Self::new(cm, cr, Arc::clone(&self.pk)))
    }

    /// `self - other`, i.e. `negate(other) + self`.
    pub fn sub(&self, other: &Ciphertext) -> Result<Ciphertext, ElGamalError> {
        self.ensure_same_key(other)?;
        other.negate()?.add(self)
    }

    /// Double-and-add over the bits of `scalar`, most significant first.
    pub fn scalar_mul(&self, scalar: &BigUint) -> Ciphertext {
        let mut acc = Self::identity(&self.pk);
        let p = &self.pk.p;
        for i in (0..scalar.bits()).rev() {
            acc = Self::new((&acc.cm * &acc.cm) % p, (&acc.cr * &acc.cr) % p, Arc::clone(&self.pk));
            if scalar.bit(i) {
                acc = Self::new((&acc.cm * &self.cm) % p, (&acc.cr * &self.cr) % p, Arc::clone(&self.pk));
            }
        }
        acc
    }

    /// Compose with an encryption of zero under `alpha_prime`.
    pub fn re_encrypt(&self, alpha_prime: &BigUint) -> Ciphertext {
        let zero = Self::encrypt_zero(&self.pk, alpha_prime);
        let p = &self.pk.p;
        Self::new(
            (&self.cm * &zero.cm) % p,
            (&self.cr * &zero.cr) % p,
            Arc::clone(&self.pk),
        )
    }
}

/// Canonical string form; commitments hash exactly this text.
impl fmt::Display for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{\"cm\":\"{}\",\"cr\":\"{}\",\"pk\":\"{}\"}}",
            biguint_to_hex(&self.cm),
            biguint_to_hex(&self.cr),
            self.pk.fingerprint()
        )
    }
}
