//! Artifact resolution: content-addressed local cache backed by remote
//! storage, with integrity verification on every path that hands bytes out.
//!
//! Disk layout follows the DVC object-store convention: an artifact with
//! sha256 `b507...` lives at `{cache_dir}/b5/07...`. Writes go through a
//! temp file plus rename so a crash mid-write never leaves a partial entry
//! visible to future resolves.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FetchError, ResolveError};
use crate::remote::RemoteStore;
use crate::resilience::{retry_async, RetryConfig};

/// Immutable pointer to a deployable model: identifier, expected content
/// hash, and remote object path. Superseded, never mutated, on redeploy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelVersion {
    pub id: String,
    pub hash: String,
    pub remote_path: String,
}

impl ModelVersion {
    pub fn new(id: impl Into<String>, hash: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self { id: id.into(), hash: hash.into(), remote_path: remote_path.into() }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct ArtifactResolver {
    store: ArtifactStore,
    remote: Arc<dyn RemoteStore>,
    retry: RetryConfig,
}

impl ArtifactResolver {
    pub fn new(cache_dir: PathBuf, remote: Arc<dyn RemoteStore>, retry: RetryConfig) -> Self {
        Self { store: ArtifactStore { root: cache_dir }, remote, retry }
    }

    /// Returns verified artifact bytes for `version`, from the local cache
    /// when possible, otherwise fetched remotely with bounded retry of
    /// transient failures. A hash mismatch after fetch is fatal for the
    /// version; mismatched bytes are never cached or returned.
    pub async fn resolve(&self, version: &ModelVersion) -> Result<Vec<u8>, ResolveError> {
        if let Some(bytes) = self.store.read_verified(&version.hash).await? {
            debug!(version = %version.id, "artifact cache hit");
            return Ok(bytes);
        }

        let remote = Arc::clone(&self.remote);
        let bytes = retry_async(&self.retry, FetchError::is_transient, |attempt| {
            let remote = Arc::clone(&remote);
            let path = version.remote_path.clone();
            async move {
                if attempt > 0 {
                    debug!(attempt, path = %path, "retrying artifact fetch");
                }
                remote.fetch(&path).await
            }
        })
        .await?;

        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(&version.hash) {
            return Err(ResolveError::Integrity { expected: version.hash.clone(), actual });
        }

        // Cache write failure is not fatal: the verified bytes are still good.
        if let Err(e) = self.store.write_atomic(&version.hash, &bytes).await {
            warn!(version = %version.id, error = %e, "artifact cache write failed");
        }
        Ok(bytes)
    }
}

struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    fn entry_path(&self, hash: &str) -> Option<PathBuf> {
        if hash.len() < 3 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let h = hash.to_ascii_lowercase();
        Some(self.root.join(&h[..2]).join(&h[2..]))
    }

    /// Reads a cached entry and re-verifies its hash. A corrupted entry is
    /// removed and reported as a miss so the caller falls back to fetch.
    async fn read_verified(&self, hash: &str) -> Result<Option<Vec<u8>>, ResolveError> {
        let Some(path) = self.entry_path(hash) else { return Ok(None) };
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if sha256_hex(&bytes).eq_ignore_ascii_case(hash) {
            Ok(Some(bytes))
        } else {
            warn!(%hash, "cached artifact failed re-verification, discarding");
            let _ = tokio::fs::remove_file(&path).await;
            Ok(None)
        }
    }

    async fn write_atomic(&self, hash: &str, bytes: &[u8]) -> Result<(), ResolveError> {
        let Some(final_path) = self.entry_path(hash) else { return Ok(()) };
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_dir = self.root.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let tmp = tmp_dir.join(Uuid::new_v4().to_string());
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &final_path).await?;
        Ok(())
    }
}
