use std::fmt;
use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::error::ElGamalError;
use super::group::{find_generator, generate_safe_prime, random_below};
use crate::crypto_serde::biguint_to_hex;

const LOG_TARGET: &str = "legit_crowd::elgamal::keys";
const FINGERPRINT_DOMAIN: &[u8] = b"legit_crowd/elgamal/pk/v1";

/// Parameters for [`generate_keypair`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenParams {
    pub bits: u64,
    /// Primality confidence; Miller-Rabin runs `confidence / 2` rounds.
    pub confidence: u32,
    pub max_attempts: usize,
}

impl KeyGenParams {
    pub fn new(bits: u64) -> Self {
        Self {
            bits,
            confidence: 32,
            max_attempts: 2_000_000,
        }
    }

    pub fn with_confidence(mut self, confidence: u32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn rounds(&self) -> u32 {
        (self.confidence / 2).max(1)
    }
}

impl Default for KeyGenParams {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(with = "crate::crypto_serde::biguint")]
    pub p: BigUint,
    #[serde(with = "crate::crypto_serde::biguint")]
    pub g: BigUint,
    #[serde(with = "crate::crypto_serde::biguint")]
    pub h: BigUint,
    pub block_bits: u64,
}

impl PublicKey {
    /// Payload bytes carried by one encoded block; every block value stays below `p`.
    pub fn block_bytes(&self) -> usize {
        (self.block_bits.saturating_sub(1) / 8) as usize
    }

    /// Order of `Z_p^*`, the modulus for exponent arithmetic.
    pub fn exponent_modulus(&self) -> BigUint {
        &self.p - 1u32
    }

    /// Order `q = (p-1)/2` of the subgroup generated by `g`.
    pub fn subgroup_order(&self) -> BigUint {
        (&self.p - 1u32) >> 1u32
    }

    /// `value` is a unit of `Z_p` inside the order-`q` subgroup.
    pub fn in_subgroup(&self, value: &BigUint) -> bool {
        !value.is_zero() && value < &self.p && value.modpow(&self.subgroup_order(), &self.p).is_one()
    }

    /// Uniform exponent from `[0, p-2]`.
    pub fn random_exponent<R: Rng + ?Sized>(&self, rng: &mut R) -> BigUint {
        random_below(&self.exponent_modulus(), rng)
    }

    /// Short stable identifier of this key, used in canonical ciphertext strings.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        for value in [&self.p, &self.g, &self.h] {
            let bytes = value.to_bytes_be();
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(&bytes);
        }
        hasher.update(self.block_bits.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn to_json(&self) -> AnyResult<String> {
        serde_json::to_string_pretty(self).context("failed to serialize public key")
    }

    pub fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read public key from {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse public key in {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> AnyResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("failed to write public key to {}", path.display()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("p", &biguint_to_hex(&self.p))
            .field("g", &biguint_to_hex(&self.g))
            .field("h", &biguint_to_hex(&self.h))
            .field("block_bits", &self.block_bits)
            .finish()
    }
}

/// Requester-only key material. Never leaves the requester node.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKey {
    #[serde(with = "crate::crypto_serde::biguint")]
    pub p: BigUint,
    #[serde(with = "crate::crypto_serde::biguint")]
    pub g: BigUint,
    #[serde(with = "crate::crypto_serde::biguint")]
    x: BigUint,
}

impl PrivateKey {
    pub(crate) fn secret_exponent(&self) -> &BigUint {
        &self.x
    }

    /// Whether this key decrypts ciphertexts made under `pk`.
    pub fn matches(&self, pk: &PublicKey) -> bool {
        self.p == pk.p && self.g == pk.g && self.g.modpow(&self.x, &self.p) == pk.h
    }

    /// Serialized key held in a buffer that is wiped on drop.
    pub fn export(&self) -> AnyResult<Zeroizing<String>> {
        serde_json::to_string(self)
            .map(Zeroizing::new)
            .context("failed to serialize private key")
    }

    pub fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let raw = Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read private key from {}", path.display()))?,
        );
        serde_json::from_str(raw.as_str())
            .with_context(|| format!("failed to parse private key in {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> AnyResult<()> {
        let path = path.as_ref();
        let exported = self.export()?;
        std::fs::write(path, exported.as_bytes())
            .with_context(|| format!("failed to write private key to {}", path.display()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("p", &biguint_to_hex(&self.p))
            .field("g", &biguint_to_hex(&self.g))
            .field("x", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh key pair over a safe-prime group of `params.bits` bits.
///
/// # Arguments
/// * `params` - Key size, primality confidence and the bound on prime candidates
/// * `rng` - Source of randomness for the prime search, generator and secret
pub fn generate_keypair<R: Rng + ?Sized>(
    params: &KeyGenParams,
    rng: &mut R,
) -> Result<(PublicKey, PrivateKey), ElGamalError> {
    let p = generate_safe_prime(params.bits, params.rounds(), params.max_attempts, rng)?;
    let g = find_generator(&p, rng)?;

    // x uniform in [1, (p-1)/2]
    let half: BigUint = (&p - 1u32) >> 1u32;
    let x = random_below(&half, rng) + BigUint::one();
    let h = g.modpow(&x, &p);

    tracing::info!(target: LOG_TARGET, bits = params.bits, "generated ElGamal key pair");

    let public = PublicKey {
        p: p.clone(),
        g: g.clone(),
        h,
        block_bits: params.bits,
    };
    let private = PrivateKey { p, g, x };
    Ok((public, private))
}
