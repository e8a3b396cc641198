//! Per-key delayed commits for rapidly edited values.
//!
//! Every `push` replaces the pending value for its key and restarts that key's quiet
//! period. Only the latest value is committed, once no newer push arrives within the
//! delay. `flush` commits everything still pending and is called on shutdown.
//!
//! Commits for one key are serialized behind a per-key lock. Callers that write the
//! same value directly take that lock too, so they never race an in-flight commit.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

pub type CommitFn<K, V> = Arc<dyn Fn(K, V) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Pending<V> {
    seq: u64,
    value: V,
}

struct Inner<K, V> {
    next_seq: u64,
    pending: HashMap<K, Pending<V>>,
    locks: HashMap<K, Arc<tokio::sync::Mutex<()>>>,
}

pub struct Debouncer<K, V> {
    delay: Duration,
    inner: Arc<Mutex<Inner<K, V>>>,
    commit: CommitFn<K, V>,
}

impl<K, V> Clone for Debouncer<K, V> {
    fn clone(&self) -> Self {
        Self {
            delay: self.delay,
            inner: self.inner.clone(),
            commit: self.commit.clone(),
        }
    }
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(delay: Duration, commit: CommitFn<K, V>) -> Self {
        Self {
            delay,
            inner: Arc::new(Mutex::new(Inner {
                next_seq: 0,
                pending: HashMap::new(),
                locks: HashMap::new(),
            })),
            commit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        // A poisoned map is still consistent: every mutation is a single insert or remove.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, key: K, value: V) {
        let seq = {
            let mut inner = self.lock();
            inner.next_seq += 1;
            let seq = inner.next_seq;
            inner.pending.insert(key.clone(), Pending { seq, value });
            seq
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            let _guard = this.lock_key(&key).await;
            let value = {
                let mut inner = this.lock();
                // Superseded by a newer push or already taken.
                if inner.pending.get(&key).map(|p| p.seq) != Some(seq) {
                    return;
                }
                inner.pending.remove(&key).map(|p| p.value)
            };
            if let Some(value) = value {
                this.commit_one(key, value).await;
            }
        });
    }

    /// Wait for any in-flight commit of `key` and hold off new ones until the guard drops.
    pub async fn lock_key(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = self.lock().locks.entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// The latest uncommitted value for `key`.
    pub fn pending(&self, key: &K) -> Option<V> {
        self.lock().pending.get(key).map(|p| p.value.clone())
    }

    /// Remove and return the pending value so the caller can commit it itself.
    pub fn take(&self, key: &K) -> Option<V> {
        self.lock().pending.remove(key).map(|p| p.value)
    }

    /// Commit every pending value now. Returns how many were committed.
    pub async fn flush(&self) -> usize {
        let keys: Vec<K> = self.lock().pending.keys().cloned().collect();
        let mut count = 0;
        for key in keys {
            let _guard = self.lock_key(&key).await;
            if let Some(value) = self.take(&key) {
                self.commit_one(key, value).await;
                count += 1;
            }
        }
        if count > 0 {
            debug!(count, "flushed pending edits");
        }
        count
    }

    async fn commit_one(&self, key: K, value: V) {
        if let Err(e) = (self.commit)(key.clone(), value).await {
            warn!(key = ?key, error = %format!("{e:#}"), "failed to commit debounced edit");
        }
    }
}
