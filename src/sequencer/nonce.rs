use tokio::sync::{Mutex, MutexGuard};

use crate::ledger::Nonce;

/// Locally tracked next sequence number of one account.
///
/// The submission path holds the guard from nonce assignment until the ledger accepted the
/// write, so assignment and increment never interleave with another submission.
#[derive(Debug)]
pub struct NonceTracker {
    next: Mutex<Nonce>,
}

impl NonceTracker {
    pub fn new(start: Nonce) -> Self {
        Self {
            next: Mutex::new(start),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Nonce> {
        self.next.lock().await
    }

    pub async fn peek(&self) -> Nonce {
        *self.next.lock().await
    }
}
