//! Error types for the preview resource cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the preview resource cache
#[derive(Error, Debug)]
pub enum Error {
    /// The remote store holds no current blob+version for the application.
    /// Recoverable by re-upload; surfaced to callers as "resource expired".
    #[error("resources for app {app_id} do not exist on the remote store")]
    ResourceNotFound { app_id: String },

    /// No local resource set exists for the application. The caller skipped
    /// the fetch step; this is a contract violation upstream, never retried.
    #[error("no local resource set for app {app_id} while accessing {file}")]
    ResourceFileNotFound { app_id: String, file: String },

    /// A resource set exists but the requested path did not resolve
    #[error("invalid resource {file} for app {app_id} (cached version: {version:?})")]
    InvalidResource {
        app_id: String,
        file: String,
        version: Option<String>,
    },

    /// The distributed lock could not be obtained after bounded retries
    #[error("failed to acquire lock {name} after {retries} attempts")]
    LockAcquisitionExceeded { name: String, retries: u32 },

    /// A remote payload did not match its expected schema
    #[error("malformed record at key {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    /// Remote store transport failure
    #[error("remote store error: {0}")]
    Store(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for the benign "resource expired" outcome the sweeper swallows.
    pub fn is_resource_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }
}
