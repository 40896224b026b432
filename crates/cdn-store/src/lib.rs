// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persistence abstractions for build artifacts ([`FsStore`]) and
//! per-fingerprint metadata ([`MetaStore`]).
//!
//! Built as async-trait-over-`tokio::fs` because the rest of the pipeline
//! (installer, registry, bundler) is already async and a synchronous disk
//! write would block a worker. Two disk-backed implementations are provided
//! plus an in-memory double of each for
//! tests that should not touch the filesystem.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use cdn_core::ModuleMeta;
use cdn_error::{CdnError, ErrorKind};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Content-addressed blob storage for finished build artifacts (`FS` in
/// spec terms).
#[async_trait]
pub trait FsStore: Send + Sync {
    /// `true` if a blob is already stored at `path`.
    async fn exists(&self, path: &str) -> Result<bool, CdnError>;

    /// Read the full contents of the blob at `path`.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, CdnError>;

    /// Write `data` to `path`, creating any intermediate directories.
    /// Overwrites if the path already exists.
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), CdnError>;
}

/// Per-fingerprint metadata keyed by the build ID (`DB` in spec terms).
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Fetch the metadata stored for `build_id`.
    ///
    /// # Errors
    ///
    /// Returns `PackageNotFound` if no entry exists — callers branch on
    /// this to decide whether a build is needed.
    async fn get(&self, build_id: &str) -> Result<ModuleMeta, CdnError>;

    /// Store `meta` under `build_id`, overwriting any prior entry.
    /// Metadata in this system is logically append-only per fingerprint
    /// (the same fingerprint always produces the same artifact), so this
    /// is idempotent in practice even though the trait allows overwrite.
    async fn put(&self, build_id: &str, meta: &ModuleMeta) -> Result<(), CdnError>;
}

// ---------------------------------------------------------------------------
// Local-disk implementations
// ---------------------------------------------------------------------------

/// [`FsStore`] rooted at a local directory.
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    /// Construct a store rooted at `root`, which need not exist yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl FsStore for LocalFsStore {
    async fn exists(&self, path: &str) -> Result<bool, CdnError> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await.unwrap_or(false))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, CdnError> {
        let full = self.resolve(path);
        tokio::fs::read(&full)
            .await
            .map_err(|e| CdnError::new(ErrorKind::Fatal, "store", format!("failed to read {path}: {e}")).with_context("path", path))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), CdnError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CdnError::new(ErrorKind::Fatal, "store", format!("failed to create directory for {path}: {e}")))?;
        }
        tokio::fs::write(&full, data)
            .await
            .map_err(|e| CdnError::new(ErrorKind::Fatal, "store", format!("failed to write {path}: {e}")).with_context("path", path))?;
        debug!(target: "cdn.store", path, bytes = data.len(), "wrote artifact");
        Ok(())
    }
}

/// [`MetaStore`] backed by one JSON file per build ID under a local
/// directory.
pub struct LocalMetaStore {
    root: PathBuf,
}

impl LocalMetaStore {
    /// Construct a store rooted at `root`, which need not exist yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, build_id: &str) -> PathBuf {
        self.root.join(format!("{build_id}.json"))
    }
}

#[async_trait]
impl MetaStore for LocalMetaStore {
    async fn get(&self, build_id: &str) -> Result<ModuleMeta, CdnError> {
        let path = self.path_for(build_id);
        let bytes = tokio::fs::read(&path).await.map_err(|_| {
            CdnError::new(ErrorKind::PackageNotFound, "store", format!("no metadata recorded for {build_id}")).with_context("build_id", build_id)
        })?;
        serde_json::from_slice(&bytes).map_err(|e| CdnError::new(ErrorKind::Fatal, "store", format!("corrupt metadata for {build_id}: {e}")))
    }

    async fn put(&self, build_id: &str, meta: &ModuleMeta) -> Result<(), CdnError> {
        let path = self.path_for(build_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| CdnError::new(ErrorKind::Fatal, "store", format!("failed to create metadata directory: {e}")))?;
        }
        let bytes = serde_json::to_vec(meta).map_err(|e| CdnError::new(ErrorKind::Fatal, "store", format!("failed to serialize metadata: {e}")))?;
        tokio::fs::write(&path, bytes).await.map_err(|e| CdnError::new(ErrorKind::Fatal, "store", format!("failed to write metadata for {build_id}: {e}")))?;
        debug!(target: "cdn.store", build_id, "stored build metadata");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory test doubles
// ---------------------------------------------------------------------------

/// In-memory [`FsStore`] for tests.
#[derive(Default)]
pub struct MemoryFsStore {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryFsStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FsStore for MemoryFsStore {
    async fn exists(&self, path: &str) -> Result<bool, CdnError> {
        Ok(self.files.lock().await.contains_key(path))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, CdnError> {
        self.files
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| CdnError::new(ErrorKind::Fatal, "store", format!("no such artifact: {path}")))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), CdnError> {
        self.files.lock().await.insert(path.to_string(), data.to_vec());
        Ok(())
    }
}

/// In-memory [`MetaStore`] for tests.
#[derive(Default)]
pub struct MemoryMetaStore {
    entries: Arc<Mutex<BTreeMap<String, ModuleMeta>>>,
}

impl MemoryMetaStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, build_id: &str) -> Result<ModuleMeta, CdnError> {
        self.entries
            .lock()
            .await
            .get(build_id)
            .cloned()
            .ok_or_else(|| CdnError::new(ErrorKind::PackageNotFound, "store", format!("no metadata recorded for {build_id}")))
    }

    async fn put(&self, build_id: &str, meta: &ModuleMeta) -> Result<(), CdnError> {
        self.entries.lock().await.insert(build_id.to_string(), meta.clone());
        Ok(())
    }
}

/// Convenience: does `path` already exist in `store`? Mirrors the
/// orchestrator's "skip the whole pipeline if already built" fast path.
pub async fn already_built(fs: &dyn FsStore, meta: &dyn MetaStore, build_id: &str, artifact_path: &str) -> Result<bool, CdnError> {
    if !fs.exists(artifact_path).await? {
        return Ok(false);
    }
    match meta.get(build_id).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind == ErrorKind::PackageNotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_fs_store_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = LocalFsStore::new(dir.path());
        assert!(!store.exists("pkg@1.0.0/es2022/pkg.mjs").await.unwrap());
        store.write_file("pkg@1.0.0/es2022/pkg.mjs", b"export {};").await.unwrap();
        assert!(store.exists("pkg@1.0.0/es2022/pkg.mjs").await.unwrap());
        assert_eq!(store.read_file("pkg@1.0.0/es2022/pkg.mjs").await.unwrap(), b"export {};");
    }

    #[tokio::test]
    async fn local_fs_store_read_of_missing_path_is_fatal_not_panic() {
        let dir = TempDir::new().unwrap();
        let store = LocalFsStore::new(dir.path());
        let err = store.read_file("nope.js").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn local_meta_store_get_of_unknown_id_is_package_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalMetaStore::new(dir.path());
        let err = store.get("abc123").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PackageNotFound);
    }

    #[tokio::test]
    async fn local_meta_store_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = LocalMetaStore::new(dir.path());
        let meta = ModuleMeta { exports: vec!["a".to_string()], export_default: true, cjs: false, types_only: false, package_css: false, dts: String::new() };
        store.put("abc123", &meta).await.unwrap();
        let round_tripped = store.get("abc123").await.unwrap();
        assert_eq!(round_tripped, meta);
    }

    #[tokio::test]
    async fn memory_stores_round_trip_without_touching_disk() {
        let fs = MemoryFsStore::new();
        let meta_store = MemoryMetaStore::new();
        fs.write_file("a.js", b"1").await.unwrap();
        assert!(fs.exists("a.js").await.unwrap());
        let meta = ModuleMeta::default();
        meta_store.put("abc", &meta).await.unwrap();
        assert_eq!(meta_store.get("abc").await.unwrap(), meta);
    }

    #[tokio::test]
    async fn already_built_is_false_when_artifact_missing() {
        let fs = MemoryFsStore::new();
        let meta_store = MemoryMetaStore::new();
        assert!(!already_built(&fs, &meta_store, "abc", "a.js").await.unwrap());
    }

    #[tokio::test]
    async fn already_built_is_false_when_artifact_present_but_meta_missing() {
        let fs = MemoryFsStore::new();
        let meta_store = MemoryMetaStore::new();
        fs.write_file("a.js", b"1").await.unwrap();
        assert!(!already_built(&fs, &meta_store, "abc", "a.js").await.unwrap());
    }

    #[tokio::test]
    async fn already_built_is_true_when_both_present() {
        let fs = MemoryFsStore::new();
        let meta_store = MemoryMetaStore::new();
        fs.write_file("a.js", b"1").await.unwrap();
        meta_store.put("abc", &ModuleMeta::default()).await.unwrap();
        assert!(already_built(&fs, &meta_store, "abc", "a.js").await.unwrap());
    }
}
