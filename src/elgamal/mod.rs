//! Multiplicative ElGamal over a safe-prime group.
//!
//! Integers are encrypted directly as group elements; byte payloads are packed into blocks
//! first (see [`encoding`]). Re-encryption composes a ciphertext with an encryption of the
//! neutral element, which keeps the plaintext and refreshes the randomness.

pub mod ciphertext;
pub mod encoding;
pub mod error;
pub mod group;
pub mod keys;

use std::sync::Arc;

use num_bigint::BigUint;
use rand::Rng;

pub use ciphertext::Ciphertext;
pub use error::ElGamalError;
pub use keys::{generate_keypair, KeyGenParams, PrivateKey, PublicKey};

use encoding::{decode_blocks, encode_blocks};
use group::mod_inverse;

const LOG_TARGET: &str = "legit_crowd::elgamal";

/// Encrypt a group element. A fresh exponent is drawn unless `alpha` pins one.
pub fn encrypt_integer<R: Rng + ?Sized>(
    pk: &Arc<PublicKey>,
    m: &BigUint,
    alpha: Option<&BigUint>,
    rng: &mut R,
) -> Result<Ciphertext, ElGamalError> {
    match alpha {
        Some(alpha) => Ciphertext::encrypt(pk, m, alpha),
        None => Ciphertext::encrypt(pk, m, &pk.random_exponent(rng)),
    }
}

/// Encrypt an arbitrary byte payload block by block.
///
/// Every block gets its own exponent unless `alpha` pins a shared one.
pub fn encrypt_bytes<R: Rng + ?Sized>(
    pk: &Arc<PublicKey>,
    payload: &[u8],
    alpha: Option<&BigUint>,
    rng: &mut R,
) -> Result<Vec<Ciphertext>, ElGamalError> {
    let blocks = encode_blocks(payload, pk.block_bytes())?;
    tracing::debug!(
        target: LOG_TARGET,
        payload_len = payload.len(),
        blocks = blocks.len(),
        "encrypting payload"
    );
    blocks
        .iter()
        .map(|block| encrypt_integer(pk, block, alpha, rng))
        .collect()
}

/// `cm * (cr^x)^-1 mod p`.
pub fn decrypt_integer(sk: &PrivateKey, ciphertext: &Ciphertext) -> Result<BigUint, ElGamalError> {
    if !sk.matches(&ciphertext.pk) {
        return Err(ElGamalError::PrivateKeyMismatch);
    }
    ciphertext.validate()?;
    let shared = ciphertext.cr.modpow(sk.secret_exponent(), &sk.p);
    let shared_inv = mod_inverse(&shared, &sk.p).ok_or(ElGamalError::MalformedCiphertext)?;
    Ok((&ciphertext.cm * shared_inv) % &sk.p)
}

/// Decrypt a block list and strip the payload padding.
pub fn decrypt_bytes(sk: &PrivateKey, ciphertexts: &[Ciphertext]) -> Result<Vec<u8>, ElGamalError> {
    let Some(first) = ciphertexts.first() else {
        return Err(ElGamalError::BlockCountMismatch {
            expected: 1,
            actual: 0,
        });
    };
    let block_bytes = first.pk.block_bytes();
    let blocks = ciphertexts
        .iter()
        .map(|c| decrypt_integer(sk, c))
        .collect::<Result<Vec<_>, _>>()?;
    decode_blocks(&blocks, block_bytes)
}

/// Re-encrypt one ciphertext; a fresh `alpha_prime` is drawn unless one is given.
pub fn re_encrypt<R: Rng + ?Sized>(
    ciphertext: &Ciphertext,
    alpha_prime: Option<&BigUint>,
    rng: &mut R,
) -> Ciphertext {
    match alpha_prime {
        Some(alpha_prime) => ciphertext.re_encrypt(alpha_prime),
        None => ciphertext.re_encrypt(&ciphertext.pk.random_exponent(rng)),
    }
}

/// Re-encrypt every block of a message with the same `alpha_prime`, so a single proof covers it.
pub fn re_encrypt_blocks(ciphertexts: &[Ciphertext], alpha_prime: &BigUint) -> Vec<Ciphertext> {
    ciphertexts.iter().map(|c| c.re_encrypt(alpha_prime)).collect()
}
