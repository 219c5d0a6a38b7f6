//! Preview Resource Cache
//!
//! Distributed resource cache and consistency engine for live application
//! previews. Per-application file sets live in a two-tier cache — an
//! in-process map in front of a shared remote key-value store — with a
//! monotonically advancing version stamp per application, lazy refresh of
//! stale local copies, distributed locks around writers, and
//! memory-pressure eviction coordinated with a live module graph.
//!
//! # Architecture
//!
//! ```text
//! request ──▶ ResourceCache ──▶ RemoteStore (source of truth)
//!                  │  ▲
//!     visited ids  │  │ version poll / refetch
//!                  ▼  │
//!            ModuleGraph    ConsistencySweeper (periodic)
//! ```
//!
//! A request for application `A` checks the local version against the
//! remote version key; on mismatch the full file set is refetched and the
//! local entry replaced. Path resolution stamps every resolved module id
//! with the current version, and those ids are tracked per application so
//! invalidation can unwind exactly what a live module graph ingested.
//! Writers publish blob + version as one pipelined batch under the
//! application's distributed lock; readers are lock-free.
//!
//! # Modules
//!
//! - [`cache`] - Two-tier resource cache, visited tracking, invalidation
//! - [`error`] - Error types
//! - [`graph`] - Module-graph collaborator port
//! - [`lifecycle`] - Per-application build status on the remote store
//! - [`lock`] - Distributed lock with TTL self-healing
//! - [`store`] - Remote store port and in-memory adapter
//! - [`sweeper`] - Periodic consistency and memory-pressure sweep
//! - [`walker`] - Filesystem iteration for the upload path

pub mod cache;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod lock;
pub mod store;
pub mod sweeper;
pub mod walker;

// Re-export commonly used types
pub use cache::{CacheConfig, ResourceCache, ResourceSet};
pub use error::{Error, Result};
pub use graph::{ModuleGraph, NoopModuleGraph};
pub use lifecycle::{AppLifecycle, AppStatus};
pub use lock::{DistributedLock, LockConfig, LockGuard};
pub use store::{InMemoryStore, RemoteStore, StoreOp};
pub use sweeper::{ConsistencySweeper, MemoryProbe, ProcessMemoryProbe, SweeperConfig};
