//! In-Memory Remote Store
//!
//! A process-local [`RemoteStore`] used in tests and single-node
//! deployments. Expiry is lazy: a key past its deadline is dropped on the
//! next read that touches it. Every trait call counts as one round trip on
//! the operation counter, which lets tests assert that fast paths perform
//! zero remote calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{RemoteStore, StoreOp};
use crate::error::Result;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// In-memory remote store with TTL and conditional-set semantics
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    ops: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of round trips performed so far
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) keys
    pub fn live_len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, stored| !stored.is_expired());
        entries.len()
    }

    fn record_op(&self) {
        self.ops.fetch_add(1, Ordering::SeqCst);
    }

    fn deadline(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }

    fn read_live(entries: &mut HashMap<String, StoredValue>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(stored) if stored.is_expired() => {
                entries.remove(key);
                None
            }
            Some(stored) => Some(stored.value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.record_op();
        let mut entries = self.entries.lock();
        Ok(Self::read_live(&mut entries, key))
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        self.record_op();
        let mut entries = self.entries.lock();
        Ok(keys
            .iter()
            .map(|key| Self::read_live(&mut entries, key))
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.record_op();
        self.entries.lock().insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Self::deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.record_op();
        let mut entries = self.entries.lock();
        if Self::read_live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Self::deadline(Some(ttl)),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.record_op();
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn exec_batch(&self, ops: Vec<StoreOp>) -> Result<()> {
        self.record_op();
        // Single lock acquisition keeps the batch atomic with respect to readers
        let mut entries = self.entries.lock();
        for op in ops {
            match op {
                StoreOp::Set { key, value, ttl } => {
                    entries.insert(
                        key,
                        StoredValue {
                            value,
                            expires_at: Self::deadline(ttl),
                        },
                    );
                }
                StoreOp::Del { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
