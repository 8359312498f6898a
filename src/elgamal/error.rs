use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ElGamalError {
    #[error("no safe prime of {bits} bits found after {attempts} attempts")]
    KeyGeneration { bits: u64, attempts: usize },

    #[error("no group generator found after {0} attempts")]
    GeneratorNotFound(usize),

    #[error("key size of {0} bits is too small")]
    KeySizeTooSmall(u64),

    #[error("ciphertexts were produced under different public keys")]
    KeyMismatch,

    #[error("private key does not belong to the ciphertext's public key")]
    PrivateKeyMismatch,

    #[error("plaintext must lie in [1, p-1]")]
    MessageOutOfRange,

    #[error("ciphertext component is not a unit modulo p")]
    MalformedCiphertext,

    #[error("ciphertext component lies outside the prime-order subgroup")]
    OutsideSubgroup,

    #[error("block lists differ in length: expected {expected}, got {actual}")]
    BlockCountMismatch { expected: usize, actual: usize },

    #[error("block value does not fit the encoding block size")]
    BlockOverflow,

    #[error("payload padding marker missing")]
    MalformedPadding,
}
