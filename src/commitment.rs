use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto_serde::parse_digest32;
use crate::elgamal::Ciphertext;

const DOMAIN_COMMITMENT: &[u8] = b"legit_crowd/commitment/v1";

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_be_bytes());
}

fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    write_len(hasher, bytes.len());
    hasher.update(bytes);
}

/// SHA-256 binding over the canonical string form of a ciphertext list.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Commitment(#[serde(with = "crate::crypto_serde::digest32")] [u8; 32]);

impl Commitment {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn compute(ciphertexts: &[Ciphertext]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_COMMITMENT);
        write_len(&mut hasher, ciphertexts.len());
        for ciphertext in ciphertexts {
            write_bytes(&mut hasher, ciphertext.to_string().as_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Whether `ciphertexts` hash to this commitment.
    pub fn matches(&self, ciphertexts: &[Ciphertext]) -> bool {
        Self::compute(ciphertexts) == *self
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 32]> for Commitment {
    fn from(bytes: [u8; 32]) -> Self {
        Commitment::new(bytes)
    }
}

impl FromStr for Commitment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_digest32(s).map(Commitment)
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", &self.to_hex()[..16])
    }
}
