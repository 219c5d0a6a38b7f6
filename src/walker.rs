//! Filesystem Walker
//!
//! Recursively collects the uploadable file set of an application root.
//! VCS metadata, dependency directories, lockfiles and generated docs are
//! skipped; known asset files are read as bytes and base64-encoded, every
//! other file is read as UTF-8 text. Keys are root-relative paths with a
//! leading slash, matching the paths the module server requests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::info;

use crate::error::Result;

/// Root-level directories that never ship to the remote store
const EXCLUDED_DIRS: &[&str] = &[".git", "node_modules", "static", "metadata", "i18n"];

/// File suffixes excluded at any depth
const IGNORED_SUFFIXES: &[&str] = &[
    ".MD",
    ".d.ts",
    ".json",
    ".html",
    ".gitkeep",
    ".gitignore",
    "yarn.lock",
    "webpack-overrides.js",
];

/// Extensions stored base64-encoded instead of as text
const KNOWN_ASSET_EXTENSIONS: &[&str] = &[
    // images
    "png", "jpg", "jpeg", "jfif", "pjpeg", "pjp", "gif", "svg", "ico", "webp", "avif",
    // media
    "mp4", "webm", "ogg", "mp3", "wav", "flac", "aac",
    // fonts
    "woff", "woff2", "eot", "ttf", "otf",
    // other
    "webmanifest", "pdf", "txt",
];

/// True when the path carries a known asset extension
pub fn is_asset_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            KNOWN_ASSET_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn is_ignored_file(path: &Path) -> bool {
    let Some(name) = path.to_str() else {
        return true;
    };
    IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn is_excluded_root_dir(name: &str) -> bool {
    EXCLUDED_DIRS.contains(&name)
}

/// Walk `root` depth-unbounded and return path → content for every
/// non-excluded file. Asset files are base64-encoded.
pub async fn collect_files(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    // Iterative traversal; directories below the root recurse unconditionally
    let mut pending: Vec<(PathBuf, usize)> = vec![(root.to_path_buf(), 0)];

    while let Some((dir, depth)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                let name = entry.file_name();
                if depth == 0 && name.to_str().is_some_and(is_excluded_root_dir) {
                    continue;
                }
                pending.push((path, depth + 1));
                continue;
            }

            if is_ignored_file(&path) {
                continue;
            }

            let key = relative_key(root, &path);
            if is_asset_path(&path) {
                info!("preview: customer asset found: {}", path.display());
                let bytes = tokio::fs::read(&path).await?;
                files.insert(key, BASE64.encode(bytes));
            } else {
                files.insert(key, tokio::fs::read_to_string(&path).await?);
            }
        }
    }

    Ok(files)
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    format!("/{}", relative.display())
}

// =============================================================================
// Tests
// =============================================================================
