//! Preview Resource Cache Integration Tests
//!
//! End-to-end flows across the cache, lock, walker and sweeper:
//! - Upload round trip and incremental merge through the remote store
//! - Staleness detection, refresh, and partial invalidation
//! - Memory-pressure eviction at the soft and hard bounds
//! - Distributed lock mutual exclusion

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use assert_matches::assert_matches;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use preview_cache::store::{resources_key, version_key};
use preview_cache::{
    CacheConfig, ConsistencySweeper, DistributedLock, Error, InMemoryStore, LockConfig,
    MemoryProbe, ModuleGraph, NoopModuleGraph, RemoteStore, ResourceCache, SweeperConfig,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn new_cache(store: &Arc<InMemoryStore>) -> Arc<ResourceCache> {
    init_tracing();
    Arc::new(ResourceCache::new(
        Arc::clone(store) as Arc<dyn RemoteStore>,
        Arc::new(NoopModuleGraph),
    ))
}

/// Module graph stub that refuses to drop a configured set of ids and
/// records every drop request it receives.
#[derive(Default)]
struct StubGraph {
    refuse: HashSet<String>,
    requests: Mutex<Vec<String>>,
}

impl StubGraph {
    fn refusing(ids: &[&str]) -> Self {
        Self {
            refuse: ids.iter().map(|id| id.to_string()).collect(),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl ModuleGraph for StubGraph {
    fn invalidate_module(&self, id: &str) -> bool {
        self.requests.lock().unwrap().push(id.to_string());
        !self.refuse.contains(id)
    }
}

struct FixedProbe(u64);

impl MemoryProbe for FixedProbe {
    fn resident_bytes(&self) -> u64 {
        self.0
    }
}

// =============================================================================
// Upload Round Trip
// =============================================================================

mod upload_tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/index.ts", b"export const x = 1;");
        write(dir.path(), "src/app/index.tsx", b"render();");
        write(dir.path(), "node_modules/dep/index.js", b"ignored");
        write(dir.path(), "tsconfig.json", b"{}");
        let png: &[u8] = &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a];
        write(dir.path(), "assets/logo.png", png);

        let store = Arc::new(InMemoryStore::new());
        let cache = new_cache(&store);

        let version = cache
            .write_to_remote("app-1", dir.path(), false)
            .await
            .unwrap();
        let fetched = cache.fetch_resource_or_throw("app-1").await.unwrap();
        assert_eq!(fetched, version);

        // Exactly the non-excluded files, text raw and assets base64
        assert_eq!(
            cache.try_load_resource("app-1", "/src/index.ts").unwrap(),
            "export const x = 1;"
        );
        assert_eq!(
            cache
                .try_load_resource("app-1", "/src/app/index.tsx")
                .unwrap(),
            "render();"
        );
        let encoded = cache
            .try_load_resource("app-1", "/assets/logo.png")
            .unwrap();
        assert_eq!(BASE64.decode(&encoded).unwrap(), png);

        assert_matches!(
            cache.try_load_resource("app-1", "/tsconfig.json"),
            Err(Error::InvalidResource { .. })
        );
        assert_matches!(
            cache.try_load_resource("app-1", "/node_modules/dep/index.js"),
            Err(Error::InvalidResource { .. })
        );
    }

    #[tokio::test]
    async fn test_incremental_merge() {
        let store = Arc::new(InMemoryStore::new());
        let cache = new_cache(&store);

        let dir_a = tempfile::tempdir().unwrap();
        write(dir_a.path(), "a.js", b"1");
        cache
            .write_to_remote("app", dir_a.path(), false)
            .await
            .unwrap();

        // Incremental write of a second tree keeps the first file
        let dir_b = tempfile::tempdir().unwrap();
        write(dir_b.path(), "b.js", b"2");
        cache
            .write_to_remote("app", dir_b.path(), true)
            .await
            .unwrap();

        cache.fetch_resource_or_throw("app").await.unwrap();
        assert_eq!(cache.try_load_resource("app", "/a.js").unwrap(), "1");
        assert_eq!(cache.try_load_resource("app", "/b.js").unwrap(), "2");

        // New entries win on overlap
        let dir_c = tempfile::tempdir().unwrap();
        write(dir_c.path(), "a.js", b"3");
        cache
            .write_to_remote("app", dir_c.path(), true)
            .await
            .unwrap();

        cache.fetch_resource_or_throw("app").await.unwrap();
        assert_eq!(cache.try_load_resource("app", "/a.js").unwrap(), "3");
        assert_eq!(cache.try_load_resource("app", "/b.js").unwrap(), "2");
    }

    #[tokio::test]
    async fn test_full_write_replaces_remote_set() {
        let store = Arc::new(InMemoryStore::new());
        let cache = new_cache(&store);

        let dir_a = tempfile::tempdir().unwrap();
        write(dir_a.path(), "a.js", b"1");
        cache
            .write_to_remote("app", dir_a.path(), false)
            .await
            .unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        write(dir_b.path(), "b.js", b"2");
        cache
            .write_to_remote("app", dir_b.path(), false)
            .await
            .unwrap();

        cache.fetch_resource_or_throw("app").await.unwrap();
        assert_matches!(
            cache.try_load_resource("app", "/a.js"),
            Err(Error::InvalidResource { .. })
        );
        assert_eq!(cache.try_load_resource("app", "/b.js").unwrap(), "2");
    }
}

// =============================================================================
// Consistency Flow
// =============================================================================

mod consistency_tests {
    use super::*;

    #[tokio::test]
    async fn test_version_short_circuit_and_staleness_refresh() {
        let store = Arc::new(InMemoryStore::new());
        let cache = new_cache(&store);

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.js", b"v1");
        let v1 = cache.write_to_remote("app", dir.path(), false).await.unwrap();
        cache.fetch_resource_or_throw("app").await.unwrap();

        // Known-current version: zero remote round trips
        let before = store.op_count();
        let version = cache
            .use_latest_app_resource_if_not_match("app", Some(&v1))
            .await
            .unwrap();
        assert_eq!(version, v1);
        assert_eq!(store.op_count(), before);

        // Writer bumps the remote; stamps are millisecond wall-clock, so
        // give the clock a tick
        tokio::time::sleep(Duration::from_millis(5)).await;
        write(dir.path(), "a.js", b"v2");
        let v2 = cache.write_to_remote("app", dir.path(), false).await.unwrap();
        assert_ne!(v1, v2);

        // A fresh request carries the new version; the stale local copy
        // triggers exactly one version poll and one refetch
        let before = store.op_count();
        let version = cache
            .use_latest_app_resource_if_not_match("app", Some(&v2))
            .await
            .unwrap();
        assert_eq!(version, v2);
        assert_eq!(store.op_count(), before + 2);
        assert_eq!(cache.cached_version("app").unwrap(), v2);
        assert_eq!(cache.try_load_resource("app", "/a.js").unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_resolved_ids_are_version_stamped() {
        let store = Arc::new(InMemoryStore::new());
        let cache = new_cache(&store);

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x.ts", b"a");
        let v1 = cache.write_to_remote("app", dir.path(), false).await.unwrap();
        cache.fetch_resource_or_throw("app").await.unwrap();

        let first = cache.try_resolve_memoized_file("app", "/x", false).unwrap();
        assert_eq!(first, format!("/x.ts?h={v1}&appId=app"));

        tokio::time::sleep(Duration::from_millis(5)).await;
        let v2 = cache.write_to_remote("app", dir.path(), false).await.unwrap();
        cache.use_latest_app_resource("app").await.unwrap();

        let second = cache.try_resolve_memoized_file("app", "/x", false).unwrap();
        assert_eq!(second, format!("/x.ts?h={v2}&appId=app"));
        assert_ne!(first, second);
    }
}

// =============================================================================
// Invalidation Bridge
// =============================================================================

mod invalidation_tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_invalidation_keeps_resource_set() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(ResourceCache::new(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            Arc::new(StubGraph::refusing(&["/b.ts?h=1&appId=app"])),
        ));

        store
            .set(
                &resources_key("app"),
                r#"{"/a.ts": "a", "/b.ts": "b", "/c.ts": "c"}"#,
                None,
            )
            .await
            .unwrap();
        store.set(&version_key("app"), "1", None).await.unwrap();
        cache.fetch_resource_or_throw("app").await.unwrap();

        for file in ["/a", "/b", "/c"] {
            cache.try_resolve_memoized_file("app", file, false).unwrap();
        }
        assert_eq!(cache.visited_ids("app").len(), 3);

        // One of three ids is still in active use
        let reclaimed = cache.invalidate_app_resources_by_key("app");
        assert!(!reclaimed);
        assert!(cache.has_local_resources("app"));
        assert_eq!(cache.visited_ids("app"), vec!["/b.ts?h=1&appId=app"]);

        // Once the graph lets go, reclaim completes
        let permissive = Arc::new(ResourceCache::new(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            Arc::new(NoopModuleGraph),
        ));
        permissive.fetch_resource_or_throw("app").await.unwrap();
        permissive
            .try_resolve_memoized_file("app", "/b", false)
            .unwrap();
        assert!(permissive.invalidate_app_resources_by_key("app"));
        assert!(!permissive.has_local_resources("app"));
    }

    #[tokio::test]
    async fn test_invalidation_requires_visited_entries() {
        let store = Arc::new(InMemoryStore::new());
        let graph = Arc::new(StubGraph::default());
        let cache = Arc::new(ResourceCache::new(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            Arc::clone(&graph) as Arc<dyn ModuleGraph>,
        ));

        store
            .set(&resources_key("app"), r#"{"/a.ts": "a"}"#, None)
            .await
            .unwrap();
        store.set(&version_key("app"), "1", None).await.unwrap();
        cache.fetch_resource_or_throw("app").await.unwrap();

        // Cached files but zero visited ids: nothing to unwind
        assert!(!cache.invalidate_app_resources_by_key("app"));
        assert!(cache.has_local_resources("app"));
        assert!(graph.requests.lock().unwrap().is_empty());
    }
}

// =============================================================================
// Sweeper
// =============================================================================

mod sweeper_tests {
    use super::*;

    async fn populate(cache: &Arc<ResourceCache>, store: &Arc<InMemoryStore>, apps: &[&str]) {
        for app in apps {
            store
                .set(&resources_key(app), &format!("{{\"/{app}.ts\": \"x\"}}"), None)
                .await
                .unwrap();
            store.set(&version_key(app), "1", None).await.unwrap();
            cache.fetch_resource_or_throw(app).await.unwrap();
            cache
                .try_resolve_memoized_file(app, &format!("/{app}"), false)
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_soft_bound_evicts_ceil_half() {
        let store = Arc::new(InMemoryStore::new());
        let cache = new_cache(&store);
        populate(&cache, &store, &["a", "b", "c", "d", "e"]).await;

        let sweeper = ConsistencySweeper::with_config(
            Arc::clone(&cache),
            SweeperConfig::default(),
            Arc::new(FixedProbe(preview_cache::sweeper::SOFT_MEMORY_BOUND + 1)),
        );
        sweeper.sweep().await;

        // ceil(5/2) == 3 oldest evicted, deterministic insertion order
        assert_eq!(cache.visited_app_ids_oldest_first(), vec!["d", "e"]);
    }

    #[tokio::test]
    async fn test_hard_bound_evicts_all() {
        let store = Arc::new(InMemoryStore::new());
        let cache = new_cache(&store);
        populate(&cache, &store, &["a", "b", "c"]).await;

        let sweeper = ConsistencySweeper::with_config(
            Arc::clone(&cache),
            SweeperConfig::default(),
            Arc::new(FixedProbe(preview_cache::sweeper::HARD_MEMORY_BOUND)),
        );
        sweeper.sweep().await;

        assert!(cache.visited_app_ids_oldest_first().is_empty());
        assert!(cache.cached_app_ids().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_sweeper_revalidates() {
        let store = Arc::new(InMemoryStore::new());
        let cache = new_cache(&store);
        populate(&cache, &store, &["a"]).await;

        // Remote moves ahead
        store.set(&version_key("a"), "2", None).await.unwrap();

        let sweeper = Arc::new(ConsistencySweeper::with_config(
            Arc::clone(&cache),
            SweeperConfig {
                interval: Duration::from_millis(20),
                ..SweeperConfig::default()
            },
            Arc::new(FixedProbe(0)),
        ));
        let handle = Arc::clone(&sweeper).spawn();

        tokio::time::sleep(Duration::from_millis(80)).await;
        handle.abort();

        assert_eq!(cache.cached_version("a").unwrap(), "2");
    }
}

// =============================================================================
// Distributed Lock
// =============================================================================

mod lock_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_acquires_are_serialized() {
        let store = Arc::new(InMemoryStore::new());
        let lock = DistributedLock::with_config(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            LockConfig {
                timeout: Duration::from_secs(30),
                retry_delay: Duration::from_millis(2),
                max_retries: 500,
            },
        );

        let in_section = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let in_section = Arc::clone(&in_section);
            handles.push(tokio::spawn(async move {
                let guard = lock.acquire("upload:app").await.unwrap();
                // Never two holders inside the section at once
                assert!(!in_section.swap(true, Ordering::SeqCst));
                tokio::time::sleep(Duration::from_millis(3)).await;
                in_section.store(false, Ordering::SeqCst);
                guard.release().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_acquire_leaves_no_remote_mutation() {
        let store = Arc::new(InMemoryStore::new());

        // Hold the application's write lock so write_to_remote cannot enter
        let lock = DistributedLock::new(Arc::clone(&store) as Arc<dyn RemoteStore>);
        let guard = lock.acquire(&resources_key("app")).await.unwrap();

        // Contending cache gives up fast
        let cache = ResourceCache::with_config(
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            Arc::new(NoopModuleGraph),
            CacheConfig {
                lock: LockConfig {
                    timeout: Duration::from_secs(30),
                    retry_delay: Duration::from_millis(2),
                    max_retries: 2,
                },
                ..CacheConfig::default()
            },
        );

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.js", b"1");

        let err = cache
            .write_to_remote("app", dir.path(), false)
            .await
            .unwrap_err();
        assert_matches!(err, Error::LockAcquisitionExceeded { .. });

        // No blob or version was written while the lock was contended
        assert!(store.get(&resources_key("app")).await.unwrap().is_none());
        assert!(store.get(&version_key("app")).await.unwrap().is_none());

        guard.release().await;
    }
}
