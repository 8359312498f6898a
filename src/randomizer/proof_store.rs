use std::time::Duration;

use dashmap::DashMap;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::LOG_TARGET;
use crate::commitment::Commitment;
use crate::ledger::SubtaskId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProofStoreConfig {
    /// How long an exponent stays provable after its subtask completed.
    #[serde(with = "crate::crypto_serde::duration_ms")]
    pub retention: Duration,
    pub capacity: usize,
}

impl ProofStoreConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl Default for ProofStoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(600),
            capacity: 4096,
        }
    }
}

#[derive(Clone, Debug)]
struct StoredExponent {
    subtask_id: SubtaskId,
    alpha_prime: BigUint,
    inserted_at: Instant,
    completed_at: Option<Instant>,
}

/// `commitment -> alpha_prime` for every ciphertext this node published.
///
/// Written by the re-encryption step and read by proof sessions. A session never removes an
/// entry; entries leave through the retention window, capacity eviction, or [`ProofStore::remove`]
/// when the write announcing them never landed.
#[derive(Debug)]
pub struct ProofStore {
    entries: DashMap<Commitment, StoredExponent>,
    config: ProofStoreConfig,
}

impl ProofStore {
    pub fn new(config: ProofStoreConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn insert(&self, commitment: Commitment, subtask_id: SubtaskId, alpha_prime: BigUint) {
        if !self.entries.contains_key(&commitment) && self.entries.len() >= self.config.capacity.max(1) {
            self.evict_one();
        }
        self.entries.insert(
            commitment,
            StoredExponent {
                subtask_id,
                alpha_prime,
                inserted_at: Instant::now(),
                completed_at: None,
            },
        );
    }

    pub fn get(&self, commitment: &Commitment) -> Option<BigUint> {
        self.entries.get(commitment).map(|entry| entry.alpha_prime.clone())
    }

    pub fn remove(&self, commitment: &Commitment) -> Option<BigUint> {
        self.entries.remove(commitment).map(|(_, entry)| entry.alpha_prime)
    }

    pub fn contains(&self, commitment: &Commitment) -> bool {
        self.entries.contains_key(commitment)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start the retention window for every entry of `subtask_id`.
    pub fn mark_subtask_completed(&self, subtask_id: SubtaskId) -> usize {
        let now = Instant::now();
        let mut marked = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.subtask_id == subtask_id && entry.completed_at.is_none() {
                entry.completed_at = Some(now);
                marked += 1;
            }
        }
        marked
    }

    /// Drop entries whose retention window has elapsed at `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let retention = self.config.retention;
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry.completed_at {
            Some(completed) => now.saturating_duration_since(completed) < retention,
            None => true,
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(target: LOG_TARGET, removed, remaining = self.entries.len(), "swept proof store");
        }
        removed
    }

    /// Oldest completed entry first, then the oldest entry overall.
    fn evict_one(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| (entry.completed_at.is_none(), entry.completed_at, entry.inserted_at))
            .map(|entry| (*entry.key(), entry.subtask_id));
        if let Some((commitment, subtask_id)) = victim {
            self.entries.remove(&commitment);
            debug!(
                target: LOG_TARGET,
                %commitment,
                subtask_id,
                "proof store at capacity; evicted entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commitment(tag: u8) -> Commitment {
        Commitment::new([tag; 32])
    }

    #[tokio::test]
    async fn lookups_return_stored_exponent() {
        let store = ProofStore::new(ProofStoreConfig::default());
        store.insert(commitment(1), 7, BigUint::from(99u32));
        assert_eq!(store.get(&commitment(1)), Some(BigUint::from(99u32)));
        assert_eq!(store.get(&commitment(2)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_honours_retention_after_completion() {
        let store = ProofStore::new(ProofStoreConfig::default().with_retention(Duration::from_secs(10)));
        store.insert(commitment(1), 1, BigUint::from(1u32));
        store.insert(commitment(2), 2, BigUint::from(2u32));
        assert_eq!(store.mark_subtask_completed(1), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.sweep(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.sweep(Instant::now()), 1);
        assert!(!store.contains(&commitment(1)));
        // still active
        assert!(store.contains(&commitment(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_completed_entries_first() {
        let store = ProofStore::new(ProofStoreConfig::default().with_capacity(2));
        store.insert(commitment(1), 1, BigUint::from(1u32));
        tokio::time::advance(Duration::from_millis(1)).await;
        store.insert(commitment(2), 2, BigUint::from(2u32));
        store.mark_subtask_completed(2);

        store.insert(commitment(3), 3, BigUint::from(3u32));
        assert_eq!(store.len(), 2);
        assert!(store.contains(&commitment(1)));
        assert!(!store.contains(&commitment(2)));

        tokio::time::advance(Duration::from_millis(1)).await;
        store.insert(commitment(4), 4, BigUint::from(4u32));
        assert!(!store.contains(&commitment(1)));
        assert!(store.contains(&commitment(3)));
        assert!(store.contains(&commitment(4)));
    }
}
