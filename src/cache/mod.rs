//! Resource Cache
//!
//! Two-tier cache for preview application file sets: an in-process map in
//! front of the shared remote store. The remote store is the source of
//! truth; local entries are tagged with the version stamp they were fetched
//! at and replaced wholesale whenever that stamp stops matching the remote
//! version key.
//!
//! Consistency model: a writer commits the file blob and the version stamp
//! in one pipelined batch, so a reader that observes a new version is
//! guaranteed the matching blob is already committed. Reads are lock-free
//! and tolerate seeing a version "in the past" relative to an update that
//! is still mid-lock; version comparison is equality-only, last writer
//! wins.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveTime, Utc};
use parking_lot::RwLock;
use tracing::{error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::graph::ModuleGraph;
use crate::lock::{DistributedLock, LockConfig};
use crate::store::{resources_key, version_key, RemoteStore, StoreOp};
use crate::walker;

mod visited;

use visited::VisitedSets;

/// Module resolution order for code imports. More specific candidates come
/// first; directory-index fallbacks last.
pub const CODE_EXTENSIONS: &[&str] = &[".tsx", ".ts", ".js"];
/// Resolution order for style imports
pub const STYLE_EXTENSIONS: &[&str] = &[".css", ".less", ".scss", ".sass"];

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the resource cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Applications exempted from daily TTL rotation
    pub persistent_apps: HashSet<String>,
    /// TTL applied to persistent applications
    pub persistent_ttl: Duration,
    /// Lock behavior for the write path
    pub lock: LockConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistent_apps: HashSet::new(),
            persistent_ttl: Duration::from_secs(365 * 24 * 60 * 60),
            lock: LockConfig::default(),
        }
    }
}

// =============================================================================
// Resource Set
// =============================================================================

/// One application's locally cached file tree, tagged with the version it
/// was fetched at. Always replaced wholesale on refresh, never merged into.
#[derive(Debug, Clone)]
pub struct ResourceSet {
    files: HashMap<String, String>,
    version: String,
}

impl ResourceSet {
    /// Version stamp the set was fetched at
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Exact-path lookup
    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

// =============================================================================
// Cache
// =============================================================================

/// The two-tier resource cache. Owns both in-process maps; constructed once
/// per process and shared by `Arc` with the request layer and the sweeper.
pub struct ResourceCache {
    store: Arc<dyn RemoteStore>,
    graph: Arc<dyn ModuleGraph>,
    lock: DistributedLock,
    config: CacheConfig,
    resources: RwLock<HashMap<String, ResourceSet>>,
    visited: RwLock<VisitedSets>,
}

impl ResourceCache {
    pub fn new(store: Arc<dyn RemoteStore>, graph: Arc<dyn ModuleGraph>) -> Self {
        Self::with_config(store, graph, CacheConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn RemoteStore>,
        graph: Arc<dyn ModuleGraph>,
        config: CacheConfig,
    ) -> Self {
        Self {
            lock: DistributedLock::with_config(Arc::clone(&store), config.lock.clone()),
            store,
            graph,
            config,
            resources: RwLock::new(HashMap::new()),
            visited: RwLock::new(VisitedSets::default()),
        }
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Walk `root_dir`, classify and read its files, and publish the set to
    /// the remote store under the application's distributed lock. With
    /// `incremental` the new files are merged over whatever is currently
    /// stored (new entries win); otherwise the set fully replaces the old.
    /// Blob and version stamp are committed as one atomic batch sharing a
    /// TTL. Returns the minted version stamp.
    #[instrument(skip(self, root_dir))]
    pub async fn write_to_remote(
        &self,
        app_id: &str,
        root_dir: &Path,
        incremental: bool,
    ) -> Result<String> {
        let started = Instant::now();
        info!("preview: start copying app {app_id} resources to remote");

        let version = Utc::now().timestamp_millis().to_string();
        let files = walker::collect_files(root_dir).await?;

        let guard = self.lock.acquire(&resources_key(app_id)).await?;
        let published = self.publish(app_id, files, incremental, &version).await;
        guard.release().await;

        match published {
            Ok(()) => {
                info!(
                    "preview: wrote app {app_id} resources to remote in {:?}",
                    started.elapsed()
                );
                Ok(version)
            }
            Err(err) => {
                error!("preview: writing app {app_id} resources to remote failed: {err}");
                Err(err)
            }
        }
    }

    async fn publish(
        &self,
        app_id: &str,
        mut files: BTreeMap<String, String>,
        incremental: bool,
        version: &str,
    ) -> Result<()> {
        if incremental {
            files = self.merge_resource(app_id, files).await;
        }

        let blob = serde_json::to_string(&files)?;
        let ttl = self.ttl_for(app_id);

        // One pipelined round trip: a reader must never observe the version
        // bump without its corresponding blob, or vice versa.
        self.store
            .exec_batch(vec![
                StoreOp::set(resources_key(app_id), blob, Some(ttl)),
                StoreOp::set(version_key(app_id), version.to_string(), Some(ttl)),
            ])
            .await
    }

    /// Merge `files` over the currently stored remote set; new entries win.
    /// Best-effort: on any failure the new files stand alone.
    async fn merge_resource(
        &self,
        app_id: &str,
        files: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        match self.store.get(&resources_key(app_id)).await {
            Ok(Some(blob)) => match serde_json::from_str::<BTreeMap<String, String>>(&blob) {
                Ok(mut merged) => {
                    merged.extend(files);
                    return merged;
                }
                Err(err) => {
                    warn!("preview: stored resource blob for {app_id} is malformed: {err}");
                }
            },
            Ok(None) => {}
            Err(err) => {
                error!("preview: failed to merge resource {app_id}: {err}");
            }
        }
        files
    }

    fn ttl_for(&self, app_id: &str) -> Duration {
        if self.config.persistent_apps.contains(app_id) {
            self.config.persistent_ttl
        } else {
            // Everything else rotates daily to bound remote storage growth
            duration_until_end_of_day()
        }
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Fetch blob + version from the remote store and replace the local
    /// entry wholesale. Missing blob or version fails with
    /// `ResourceNotFound`; a blob that is not a JSON string map fails with
    /// `MalformedRecord`. Returns the fetched version stamp.
    #[instrument(skip(self))]
    pub async fn fetch_resource_or_throw(&self, app_id: &str) -> Result<String> {
        let started = Instant::now();
        let rkey = resources_key(app_id);
        let vkey = version_key(app_id);

        let values = match self.store.mget(&[&rkey, &vkey]).await {
            Ok(values) => values,
            Err(err) => {
                error!("preview: can not fetch resource for {app_id}: {err}");
                return Err(Error::ResourceNotFound {
                    app_id: app_id.to_string(),
                });
            }
        };

        let mut values = values.into_iter();
        let blob = values.next().flatten();
        let version = values.next().flatten();

        let (Some(blob), Some(version)) = (blob, version) else {
            // Expired or never uploaded
            return Err(Error::ResourceNotFound {
                app_id: app_id.to_string(),
            });
        };

        let files: HashMap<String, String> =
            serde_json::from_str(&blob).map_err(|err| Error::MalformedRecord {
                key: rkey,
                reason: err.to_string(),
            })?;

        self.resources.write().insert(
            app_id.to_string(),
            ResourceSet {
                files,
                version: version.clone(),
            },
        );

        info!(
            "preview: fetched app {app_id} resources to local in {:?}",
            started.elapsed()
        );
        Ok(version)
    }

    /// Load the content of `file` from the local resource set. The set must
    /// already exist; query and hash suffixes are stripped before lookup.
    pub fn try_load_resource(&self, app_id: &str, file: &str) -> Result<String> {
        let resources = self.resources.read();
        let set = resources
            .get(app_id)
            .ok_or_else(|| Error::ResourceFileNotFound {
                app_id: app_id.to_string(),
                file: file.to_string(),
            })?;

        let pure = clean_url(file);
        match set.get(pure) {
            Some(content) => Ok(content.to_string()),
            None => Err(Error::InvalidResource {
                app_id: app_id.to_string(),
                file: pure.to_string(),
                version: Some(set.version.clone()),
            }),
        }
    }

    /// Resolve `try_file` against the local resource set using module
    /// resolution order: the exact path, then each extension, then
    /// `/index` + each extension. The first present candidate wins. The
    /// resolved id carries the current version and application id as a
    /// query string, so module ids naturally change when content does, and
    /// is recorded in the application's visited set.
    pub fn try_resolve_memoized_file(
        &self,
        app_id: &str,
        try_file: &str,
        is_css: bool,
    ) -> Result<String> {
        let resolved = {
            let resources = self.resources.read();
            let set = resources
                .get(app_id)
                .ok_or_else(|| Error::ResourceFileNotFound {
                    app_id: app_id.to_string(),
                    file: try_file.to_string(),
                })?;

            let exts = if is_css { STYLE_EXTENSIONS } else { CODE_EXTENSIONS };
            let hit = candidate_paths(try_file, exts)
                .into_iter()
                .find(|candidate| set.files.contains_key(candidate))
                .ok_or_else(|| Error::InvalidResource {
                    app_id: app_id.to_string(),
                    file: try_file.to_string(),
                    version: Some(set.version.clone()),
                })?;

            format!("{hit}?h={}&appId={app_id}", set.version)
        };

        // Recorded again on every resolution: dynamic imports can re-enter
        self.visited.write().record(app_id, resolved.clone());
        Ok(resolved)
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Lock-free fast path: when the caller's known version already equals
    /// the locally cached one, return without touching the remote store.
    /// Otherwise fall through to the refresh path.
    pub async fn use_latest_app_resource_if_not_match(
        &self,
        app_id: &str,
        known_version: Option<&str>,
    ) -> Result<String> {
        if let Some(known) = known_version {
            let matches = self
                .resources
                .read()
                .get(app_id)
                .is_some_and(|set| set.version == known);
            if matches {
                return Ok(known.to_string());
            }
        }

        self.use_latest_app_resource(app_id).await
    }

    /// Refresh path: poll only the cheap version key. Absent version means
    /// the remote entry expired — invalidate and fail with
    /// `ResourceNotFound`. A missing local entry or a version mismatch
    /// invalidates and refetches the full blob. A match is a no-op.
    pub async fn use_latest_app_resource(&self, app_id: &str) -> Result<String> {
        let version = self.store.get(&version_key(app_id)).await?;

        let Some(version) = version else {
            self.invalidate_app_resources_by_key(app_id);
            return Err(Error::ResourceNotFound {
                app_id: app_id.to_string(),
            });
        };

        // Equality only: a concurrent writer may publish a stamp "older"
        // than one already observed and it is adopted all the same
        let matches = self
            .resources
            .read()
            .get(app_id)
            .is_some_and(|set| set.version == version);

        if !matches {
            info!(
                "preview: version mismatch detected between local files and remote \
                 for resource {app_id}"
            );
            self.invalidate_app_resources_by_key(app_id);
            self.fetch_resource_or_throw(app_id).await?;
        }

        Ok(version)
    }

    // =========================================================================
    // Invalidation Bridge
    // =========================================================================

    /// Invalidate the application's cached resources, coordinating with the
    /// live module graph. Proceeds only when both a resource set and a
    /// visited set exist — an application nothing downstream references has
    /// nothing to unwind. Each visited id is offered to the graph; only
    /// confirmed drops leave the visited set. Returns `true` when the entry
    /// was fully reclaimed; a partial drop keeps the resource set alive and
    /// only warns, which is expected under load.
    pub fn invalidate_app_resources_by_key(&self, app_id: &str) -> bool {
        let has_resources = self.resources.read().contains_key(app_id);
        let mut visited = self.visited.write();
        if !has_resources || !visited.contains_app(app_id) {
            return false;
        }

        let started = Instant::now();
        // O(len(visited)) with O(1) graph drops, instead of scanning the
        // whole module graph per id
        for id in visited.ids(app_id) {
            if self.graph.invalidate_module(&id) {
                visited.remove_id(app_id, &id);
            }
        }

        if visited.is_drained(app_id) {
            visited.remove_app(app_id);
            self.resources.write().remove(app_id);
            info!(
                "preview: invalidated app resource {app_id} in {:?}",
                started.elapsed()
            );
            true
        } else {
            warn!("preview: can not clear module graph for resource {app_id}");
            false
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Version stamp of the local entry, if any
    pub fn cached_version(&self, app_id: &str) -> Option<String> {
        self.resources
            .read()
            .get(app_id)
            .map(|set| set.version.clone())
    }

    pub fn has_local_resources(&self, app_id: &str) -> bool {
        self.resources.read().contains_key(app_id)
    }

    /// Application ids with a local resource set
    pub fn cached_app_ids(&self) -> Vec<String> {
        self.resources.read().keys().cloned().collect()
    }

    /// Application ids with visited entries, oldest first. Eviction order.
    pub fn visited_app_ids_oldest_first(&self) -> Vec<String> {
        self.visited.read().app_ids_oldest_first()
    }

    /// Visited ids recorded for an application
    pub fn visited_ids(&self, app_id: &str) -> Vec<String> {
        self.visited.read().ids(app_id)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Strip `#hash` and `?query` suffixes from a request path
pub fn clean_url(url: &str) -> &str {
    let no_hash = url.split('#').next().unwrap_or(url);
    no_hash.split('?').next().unwrap_or(no_hash)
}

fn candidate_paths(try_file: &str, exts: &[&str]) -> Vec<String> {
    let mut candidates = Vec::with_capacity(1 + exts.len() * 2);
    candidates.push(try_file.to_string());
    for ext in exts {
        candidates.push(format!("{try_file}{ext}"));
    }
    for ext in exts {
        candidates.push(format!("{try_file}/index{ext}"));
    }
    candidates
}

/// TTL that expires remote entries at local midnight
fn duration_until_end_of_day() -> Duration {
    let now = Local::now().naive_local();
    let tomorrow = now
        .date()
        .succ_opt()
        .unwrap_or(now.date())
        .and_time(NaiveTime::MIN);
    (tomorrow - now)
        .to_std()
        .unwrap_or(Duration::from_secs(60))
}

// =============================================================================
// Tests
// =============================================================================
