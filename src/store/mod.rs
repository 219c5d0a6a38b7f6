//! Remote Store Port
//!
//! Thin interface to the shared key-value store that is the source of truth
//! for preview resources. Local maps are a cache on top of it, never
//! authoritative. The contract mirrors what the cache actually consumes:
//! point reads, multi-key reads, TTL-bound writes (optionally conditional),
//! deletes, and a pipelined batch that commits several keys with a shared
//! TTL in one atomic round trip.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;

pub use memory::InMemoryStore;

// =============================================================================
// Key Namespaces
// =============================================================================

// The app id is wrapped in braces so every key for one application hashes to
// the same cluster slot, which is what makes the pipelined blob+version
// write a single atomic round trip.

/// Key holding the JSON file blob for an application
pub fn resources_key(app_id: &str) -> String {
    format!("preview-resources:{{{app_id}}}")
}

/// Key holding the version stamp for an application
pub fn version_key(app_id: &str) -> String {
    format!("preview-version:{{{app_id}}}")
}

/// Key holding the lifecycle status for an application
pub fn status_key(app_id: &str) -> String {
    format!("preview-status:{{{app_id}}}")
}

/// Key holding the failure message for an application
pub fn error_msg_key(app_id: &str) -> String {
    format!("preview-error-msg:{{{app_id}}}")
}

/// Key holding a mutex token
pub fn lock_key(name: &str) -> String {
    format!("lock:{{{name}}}")
}

// =============================================================================
// Batch Operations
// =============================================================================

/// A single operation inside a pipelined batch
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Set a key, optionally TTL-bound
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    /// Delete a key
    Del { key: String },
}

impl StoreOp {
    pub fn set(key: String, value: String, ttl: Option<Duration>) -> Self {
        StoreOp::Set { key, value, ttl }
    }

    pub fn del(key: String) -> Self {
        StoreOp::Del { key }
    }
}

// =============================================================================
// Port
// =============================================================================

/// Port for the shared remote key-value store.
///
/// Implementations must provide TTL expiry and conditional set semantics;
/// `exec_batch` must apply all operations atomically as one round trip so a
/// reader can never observe a version bump without its file blob.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the value at `key`, or `None` when absent/expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Get several keys in one round trip, preserving order.
    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<String>>>;

    /// Set `key`, overwriting any previous value. `ttl` of `None` persists
    /// the key until explicitly deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Conditional set-if-not-exists with TTL. Returns `true` when the key
    /// was set, `false` when a live value already existed.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key`.
    async fn del(&self, key: &str) -> Result<()>;

    /// Apply every operation atomically as a single pipelined round trip.
    async fn exec_batch(&self, ops: Vec<StoreOp>) -> Result<()>;
}
