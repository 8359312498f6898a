//! Byte payload packing into group elements.
//!
//! A payload gets a `0x01` marker and zero padding up to a whole number of blocks. Each block is
//! read little-endian and shifted up by one so no block maps to 0.

use num_bigint::BigUint;
use num_traits::Zero;

use super::error::ElGamalError;

const PADDING_MARKER: u8 = 0x01;

/// Number of blocks a payload of `len` bytes occupies.
pub fn block_count(len: usize, block_bytes: usize) -> usize {
    (len + 1).div_ceil(block_bytes)
}

pub fn encode_blocks(payload: &[u8], block_bytes: usize) -> Result<Vec<BigUint>, ElGamalError> {
    if block_bytes == 0 {
        return Err(ElGamalError::BlockOverflow);
    }
    let mut padded = Vec::with_capacity(block_count(payload.len(), block_bytes) * block_bytes);
    padded.extend_from_slice(payload);
    padded.push(PADDING_MARKER);
    let remainder = padded.len() % block_bytes;
    if remainder != 0 {
        padded.resize(padded.len() + block_bytes - remainder, 0);
    }

    Ok(padded
        .chunks(block_bytes)
        .map(|chunk| BigUint::from_bytes_le(chunk) + 1u32)
        .collect())
}

pub fn decode_blocks(blocks: &[BigUint], block_bytes: usize) -> Result<Vec<u8>, ElGamalError> {
    let mut bytes = Vec::with_capacity(blocks.len() * block_bytes);
    for block in blocks {
        if block.is_zero() {
            return Err(ElGamalError::BlockOverflow);
        }
        let value = block - 1u32;
        let mut chunk = if value.is_zero() {
            Vec::new()
        } else {
            value.to_bytes_le()
        };
        if chunk.len() > block_bytes {
            return Err(ElGamalError::BlockOverflow);
        }
        chunk.resize(block_bytes, 0);
        bytes.extend_from_slice(&chunk);
    }

    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    match bytes.pop() {
        Some(PADDING_MARKER) => Ok(bytes),
        _ => Err(ElGamalError::MalformedPadding),
    }
}
