//! Application Lifecycle
//!
//! Tracks preview application status on the remote store so concurrent
//! upload pipelines do not build the same application twice. Status moves
//! idle → pending → idle/failed; the pending marker is TTL-bound so a
//! crashed builder cannot wedge an application forever.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::lock::DistributedLock;
use crate::store::{error_msg_key, status_key, RemoteStore, StoreOp};

/// TTL on the pending marker; bounds how long a dead builder blocks retries
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Preview application build status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Idle,
    Pending,
    Failed,
}

impl AppStatus {
    fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Idle => "idle",
            AppStatus::Pending => "pending",
            AppStatus::Failed => "failed",
        }
    }

    /// Absent or unknown markers read as idle
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("pending") => AppStatus::Pending,
            Some("failed") => AppStatus::Failed,
            _ => AppStatus::Idle,
        }
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Remote-store-backed lifecycle tracker
pub struct AppLifecycle {
    store: Arc<dyn RemoteStore>,
    lock: DistributedLock,
}

impl AppLifecycle {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            lock: DistributedLock::new(Arc::clone(&store)),
            store,
        }
    }

    /// Try to move the application into pending. Returns `false` when
    /// another process already holds it pending. The previous failure
    /// message is cleared and the pending marker written in one batch,
    /// under the application's lock.
    pub async fn begin_pending(&self, app_id: &str) -> Result<bool> {
        let guard = self.lock.acquire(&format!("preview-{app_id}")).await?;
        let result = self.try_begin(app_id).await;
        guard.release().await;
        result
    }

    async fn try_begin(&self, app_id: &str) -> Result<bool> {
        let status = self.store.get(&status_key(app_id)).await?;
        if AppStatus::parse(status.as_deref()) == AppStatus::Pending {
            // Another process is already building this application
            return Ok(false);
        }

        self.store
            .exec_batch(vec![
                StoreOp::del(error_msg_key(app_id)),
                StoreOp::set(
                    status_key(app_id),
                    AppStatus::Pending.as_str().to_string(),
                    Some(PENDING_TIMEOUT),
                ),
            ])
            .await?;
        Ok(true)
    }

    /// Mark the application idle after a successful build
    pub async fn mark_idle(&self, app_id: &str) -> Result<()> {
        self.store
            .set(&status_key(app_id), AppStatus::Idle.as_str(), None)
            .await
    }

    /// Mark the application failed, recording the failure message
    pub async fn mark_failed(&self, app_id: &str, message: &str) -> Result<()> {
        self.store
            .exec_batch(vec![
                StoreOp::set(
                    status_key(app_id),
                    AppStatus::Failed.as_str().to_string(),
                    None,
                ),
                StoreOp::set(error_msg_key(app_id), message.to_string(), None),
            ])
            .await
    }

    /// Current status; the failure message is only read for failed apps
    pub async fn status(&self, app_id: &str) -> Result<(AppStatus, Option<String>)> {
        let status = AppStatus::parse(self.store.get(&status_key(app_id)).await?.as_deref());

        if status == AppStatus::Failed {
            let message = self.store.get(&error_msg_key(app_id)).await?;
            return Ok((status, message));
        }
        Ok((status, None))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn lifecycle() -> AppLifecycle {
        AppLifecycle::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_absent_status_reads_idle() {
        let lifecycle = lifecycle();
        assert_eq!(
            lifecycle.status("app").await.unwrap(),
            (AppStatus::Idle, None)
        );
    }

    #[tokio::test]
    async fn test_begin_pending_is_exclusive() {
        let lifecycle = lifecycle();

        assert!(lifecycle.begin_pending("app").await.unwrap());
        assert!(!lifecycle.begin_pending("app").await.unwrap());
        assert_eq!(
            lifecycle.status("app").await.unwrap(),
            (AppStatus::Pending, None)
        );
    }

    #[tokio::test]
    async fn test_idle_releases_pending() {
        let lifecycle = lifecycle();

        assert!(lifecycle.begin_pending("app").await.unwrap());
        lifecycle.mark_idle("app").await.unwrap();
        assert!(lifecycle.begin_pending("app").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_status_carries_message() {
        let lifecycle = lifecycle();

        lifecycle.begin_pending("app").await.unwrap();
        lifecycle.mark_failed("app", "tsc exited 2").await.unwrap();

        let (status, message) = lifecycle.status("app").await.unwrap();
        assert_eq!(status, AppStatus::Failed);
        assert_eq!(message.as_deref(), Some("tsc exited 2"));
    }

    #[tokio::test]
    async fn test_pending_clears_previous_failure() {
        let lifecycle = lifecycle();

        lifecycle.mark_failed("app", "boom").await.unwrap();
        assert!(lifecycle.begin_pending("app").await.unwrap());
        lifecycle.mark_failed("app", "later").await.unwrap();

        let (_, message) = lifecycle.status("app").await.unwrap();
        assert_eq!(message.as_deref(), Some("later"));
    }
}
