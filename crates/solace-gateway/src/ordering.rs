//! Per-key ordering: async locks keyed by id, and FIFO turns keyed by id.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Maps larger than this drop their idle entries on the next access.
const PRUNE_AT: usize = 256;

/// One async mutex per key.
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<AsyncMutex<()>>>,
}

impl<K: Eq + Hash> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self { locks: DashMap::new() }
    }
}

impl<K: Eq + Hash> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        if self.locks.len() >= PRUNE_AT {
            // Held or awaited locks have a clone outstanding
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        let lock = self.locks.entry(key).or_default().clone();
        lock.lock_owned().await
    }
}

/// Issues turns per key in call order. A turn's `wait` returns once the turn
/// issued before it on the same key has been dropped.
pub struct TurnQueue<K: Eq + Hash> {
    tails: DashMap<K, oneshot::Receiver<()>>,
}

impl<K: Eq + Hash> Default for TurnQueue<K> {
    fn default() -> Self {
        Self { tails: DashMap::new() }
    }
}

impl<K: Eq + Hash> TurnQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, key: K) -> Turn {
        let (done, tail) = oneshot::channel();
        if self.tails.len() >= PRUNE_AT {
            self.tails
                .retain(|_, rx| matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        }
        let prev = self.tails.insert(key, tail);
        Turn { prev, _done: done }
    }
}

/// Dropping the turn lets the next one on its key proceed.
pub struct Turn {
    prev: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl Turn {
    pub async fn wait(&mut self) {
        if let Some(prev) = self.prev.take() {
            // Only the drop of the sender matters
            let _ = prev.await;
        }
    }
}
