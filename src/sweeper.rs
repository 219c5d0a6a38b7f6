//! Consistency Sweeper
//!
//! Minute-granularity background reconciliation: checks process resident
//! memory against soft/hard bounds and evicts visited application keys
//! under pressure, then revalidates every locally cached application's
//! version against the remote store. The sweep must never die: expected
//! expiries are swallowed, everything else is logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::cache::ResourceCache;

/// Soft resident-memory bound (~4 GiB): evict half of the visited keys
pub const SOFT_MEMORY_BOUND: u64 = 4_194_304_000;
/// Hard resident-memory bound (~6 GiB): evict everything
pub const HARD_MEMORY_BOUND: u64 = 6_640_000_000;

// =============================================================================
// Memory Probe
// =============================================================================

/// Port for reading process resident memory, overridable in tests
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> u64;
}

/// Probe backed by the operating system's view of this process
#[derive(Debug, Default)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&self) -> u64 {
        memory_stats::memory_stats()
            .map(|usage| usage.physical_mem as u64)
            .unwrap_or(0)
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the consistency sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweeps
    pub interval: Duration,
    /// Above this resident size, half of the visited keys are evicted
    pub soft_memory_bound: u64,
    /// At or above this resident size, every visited key is evicted
    pub hard_memory_bound: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            soft_memory_bound: SOFT_MEMORY_BOUND,
            hard_memory_bound: HARD_MEMORY_BOUND,
        }
    }
}

// =============================================================================
// Sweeper
// =============================================================================

/// Periodic background reconciliation and memory-pressure eviction
pub struct ConsistencySweeper {
    cache: Arc<ResourceCache>,
    probe: Arc<dyn MemoryProbe>,
    config: SweeperConfig,
    running: AtomicBool,
}

impl ConsistencySweeper {
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self::with_config(cache, SweeperConfig::default(), Arc::new(ProcessMemoryProbe))
    }

    pub fn with_config(
        cache: Arc<ResourceCache>,
        config: SweeperConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            cache,
            probe,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the periodic sweep loop
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    /// Run one sweep. A sweep already in flight makes this a no-op; the
    /// re-entrancy guard is released on every exit path.
    pub async fn sweep(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("preview: consistency and memory sweep running");

        self.memory_usage_check();
        self.revalidate_cached_resources().await;

        self.running.store(false, Ordering::SeqCst);
    }

    /// Evict visited application keys when resident memory crosses the
    /// configured bounds: nothing below soft, every key at/above hard,
    /// ceil(n/2) oldest-first in between.
    fn memory_usage_check(&self) {
        let rss = self.probe.resident_bytes();
        if rss < self.config.soft_memory_bound {
            return;
        }

        warn!(
            "preview: memory over size, current: {}MB",
            rss / 1024 / 1024
        );
        let at_hard_bound = rss >= self.config.hard_memory_bound;

        let keys = self.cache.visited_app_ids_oldest_first();
        let count = if at_hard_bound {
            keys.len()
        } else {
            keys.len().div_ceil(2)
        };

        warn!("preview: start destroying visited module graphs: {count}");
        for key in keys.into_iter().take(count) {
            self.cache.invalidate_app_resources_by_key(&key);
        }
    }

    /// Revalidate every locally cached application against the remote
    /// version key. `ResourceNotFound` is the expected expiry outcome and
    /// swallowed; anything else is logged and the sweep continues.
    async fn revalidate_cached_resources(&self) {
        let app_ids = self.cache.cached_app_ids();
        let results = futures::future::join_all(
            app_ids
                .iter()
                .map(|app_id| self.cache.use_latest_app_resource(app_id)),
        )
        .await;

        for (app_id, result) in app_ids.iter().zip(results) {
            match result {
                Ok(_) => {}
                Err(err) if err.is_resource_not_found() => {}
                Err(err) => {
                    error!(
                        "preview: failed to check remote file consistency for {app_id}: {err}"
                    );
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
