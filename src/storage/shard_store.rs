//! Content-addressed shard fetch + persistent cache.
//!
//! Shards are fetched once over HTTP, hash-verified against the manifest's
//! declared SHA-256, and persisted to a local cache directory so subsequent
//! loads skip the network entirely: async `tokio::fs`, a two-level sharded
//! directory layout, and a fetch step that mirrors a disk engine's
//! write-then-read round trip.

use std::path::{Path, PathBuf};

use futures::stream::{self, TryStreamExt};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use super::manifest::{Manifest, ManifestError, ShardEntry};

/// Shard fetches that run concurrently inside one `ensure_manifest_cached`
/// call, bounding the disk/network fan-out.
const MAX_CONCURRENT_FETCHES: usize = 4;

#[derive(Error, Debug)]
pub enum ShardStoreError {
    #[error("manifest invalid: {0}")]
    Manifest(#[from] ManifestError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch of shard {shard_id} from {url} failed: {message}")]
    Fetch {
        shard_id: String,
        url: String,
        message: String,
    },

    #[error("shard {shard_id} hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        shard_id: String,
        expected: String,
        actual: String,
    },

    #[error("unknown shard id: {0}")]
    UnknownShard(String),
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Fetches and caches shard files, keyed by their content hash.
pub struct ShardStore {
    cache_dir: PathBuf,
    client: reqwest::Client,
}

impl ShardStore {
    pub async fn new(cache_dir: PathBuf) -> Result<Self, ShardStoreError> {
        fs::create_dir_all(&cache_dir).await?;
        Ok(Self {
            cache_dir,
            client: reqwest::Client::new(),
        })
    }

    /// Two-level sharded directory path (hex-prefix fan-out), so a cache
    /// with thousands of shards doesn't overflow one directory.
    fn cache_path(&self, shard: &ShardEntry) -> PathBuf {
        let prefix = &shard.sha256[..2.min(shard.sha256.len())];
        self.cache_dir.join(prefix).join(format!("{}.shard", shard.id))
    }

    /// Ensure every shard named by the manifest is present in the local
    /// cache and hash-verified, fetching any that are missing.
    pub async fn ensure_manifest_cached(&self, manifest: &Manifest) -> Result<(), ShardStoreError> {
        manifest.validate()?;
        stream::iter(manifest.shards.iter().map(Ok))
            .try_for_each_concurrent(MAX_CONCURRENT_FETCHES, |shard| async move {
                self.ensure_shard_cached(shard).await.map(|_| ())
            })
            .await
    }

    async fn ensure_shard_cached(&self, shard: &ShardEntry) -> Result<PathBuf, ShardStoreError> {
        let path = self.cache_path(shard);
        if path.exists() {
            debug!(shard_id = %shard.id, "shard cache hit");
            return Ok(path);
        }

        // A hash mismatch gets one re-fetch (the byte corruption may be a
        // one-off transport glitch); a second mismatch is fatal.
        let bytes = match self.fetch_and_verify(shard).await {
            Err(ShardStoreError::HashMismatch { .. }) => {
                warn!(shard_id = %shard.id, "hash mismatch, re-fetching once");
                self.fetch_and_verify(shard).await?
            }
            other => other?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &bytes).await?;
        debug!(shard_id = %shard.id, bytes = bytes.len(), path = %path.display(), "shard cached");

        Ok(path)
    }

    /// Fetch one shard over HTTP and verify it against its declared hash.
    /// Does not write to the cache; `ensure_shard_cached` owns that and the
    /// retry-once-on-mismatch policy.
    async fn fetch_and_verify(&self, shard: &ShardEntry) -> Result<Vec<u8>, ShardStoreError> {
        info!(shard_id = %shard.id, url = %shard.url, "fetching shard");
        let bytes = self
            .client
            .get(&shard.url)
            .send()
            .await
            .map_err(|e| ShardStoreError::Fetch {
                shard_id: shard.id.clone(),
                url: shard.url.clone(),
                message: e.to_string(),
            })?
            .bytes()
            .await
            .map_err(|e| ShardStoreError::Fetch {
                shard_id: shard.id.clone(),
                url: shard.url.clone(),
                message: e.to_string(),
            })?;

        let actual = sha256_hex(&bytes);
        if actual != shard.sha256 {
            warn!(shard_id = %shard.id, expected = %shard.sha256, actual = %actual, "shard hash mismatch");
            return Err(ShardStoreError::HashMismatch {
                shard_id: shard.id.clone(),
                expected: shard.sha256.clone(),
                actual,
            });
        }

        Ok(bytes.to_vec())
    }

    /// Read the raw bytes for one tensor's range out of its cached shard.
    /// Assumes `ensure_manifest_cached` has already run for this manifest.
    pub async fn read_tensor_bytes(
        &self,
        manifest: &Manifest,
        tensor_name: &str,
    ) -> Result<Vec<u8>, ShardStoreError> {
        let tensor = manifest
            .tensor(tensor_name)
            .ok_or_else(|| ShardStoreError::UnknownShard(tensor_name.to_string()))?;
        let shard = manifest
            .shard(&tensor.shard_id)
            .ok_or_else(|| ShardStoreError::UnknownShard(tensor.shard_id.clone()))?;

        let path = self.cache_path(shard);
        let full = fs::read(&path).await?;
        let start = tensor.byte_offset as usize;
        let end = start + tensor.byte_length as usize;
        Ok(full[start..end].to_vec())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
