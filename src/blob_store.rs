use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::elgamal::{Ciphertext, PublicKey};
use crate::ledger::ContentPointer;

const LOG_TARGET: &str = "legit_crowd::blob_store";

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob {0} not found")]
    NotFound(ContentPointer),

    #[error("blob {pointer} is not a ciphertext list: {reason}")]
    Malformed {
        pointer: ContentPointer,
        reason: String,
    },

    #[error("blob {0} holds ciphertexts under a different public key")]
    ForeignKey(ContentPointer),

    #[error("blob store transport error: {0}")]
    Transport(String),
}

/// Content-addressed storage for published ciphertext lists.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentPointer, BlobStoreError>;

    async fn get(&self, pointer: &ContentPointer) -> Result<Vec<u8>, BlobStoreError>;
}

pub fn content_address(bytes: &[u8]) -> ContentPointer {
    ContentPointer::new(hex::encode(Sha256::digest(bytes)))
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: DashMap<ContentPointer, Arc<[u8]>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes under an arbitrary pointer, bypassing content addressing.
    ///
    /// Models a store that serves substituted content.
    pub fn insert_raw(&self, pointer: ContentPointer, bytes: Vec<u8>) {
        self.blobs.insert(pointer, Arc::from(bytes));
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentPointer, BlobStoreError> {
        let pointer = content_address(&bytes);
        self.blobs
            .entry(pointer.clone())
            .or_insert_with(|| Arc::from(bytes));
        Ok(pointer)
    }

    async fn get(&self, pointer: &ContentPointer) -> Result<Vec<u8>, BlobStoreError> {
        self.blobs
            .get(pointer)
            .map(|blob| blob.to_vec())
            .ok_or_else(|| BlobStoreError::NotFound(pointer.clone()))
    }
}

/// Upload a ciphertext list as JSON.
pub async fn put_ciphertexts(
    store: &dyn BlobStore,
    ciphertexts: &[Ciphertext],
) -> Result<ContentPointer, BlobStoreError> {
    let bytes = serde_json::to_vec(ciphertexts).map_err(|err| BlobStoreError::Transport(err.to_string()))?;
    let pointer = store.put(bytes).await?;
    tracing::debug!(target: LOG_TARGET, %pointer, blocks = ciphertexts.len(), "uploaded ciphertexts");
    Ok(pointer)
}

/// Download a ciphertext list and check it was produced under `expected_pk`.
pub async fn fetch_ciphertexts(
    store: &dyn BlobStore,
    pointer: &ContentPointer,
    expected_pk: &Arc<PublicKey>,
) -> Result<Vec<Ciphertext>, BlobStoreError> {
    let bytes = store.get(pointer).await?;
    let ciphertexts: Vec<Ciphertext> =
        serde_json::from_slice(&bytes).map_err(|err| BlobStoreError::Malformed {
            pointer: pointer.clone(),
            reason: err.to_string(),
        })?;
    if ciphertexts.is_empty() {
        return Err(BlobStoreError::Malformed {
            pointer: pointer.clone(),
            reason: "empty ciphertext list".into(),
        });
    }
    let mut normalized = Vec::with_capacity(ciphertexts.len());
    for ciphertext in ciphertexts {
        if *ciphertext.pk != **expected_pk {
            return Err(BlobStoreError::ForeignKey(pointer.clone()));
        }
        ciphertext.validate().map_err(|err| BlobStoreError::Malformed {
            pointer: pointer.clone(),
            reason: err.to_string(),
        })?;
        // share one key allocation across the list
        normalized.push(Ciphertext::new(ciphertext.cm, ciphertext.cr, Arc::clone(expected_pk)));
    }
    Ok(normalized)
}
