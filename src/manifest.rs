//! Generation manifests.
//!
//! A manifest names the complete file set of one published generation. It is
//! written once, with a create-only put, and never modified. The encoded form
//! is the JSON body followed by a `#sha256=` footer over the body bytes, so a
//! truncated or damaged object is detected before anything trusts it.

use std::{collections::BTreeMap, sync::Arc};

use blob_store::{BlobStorage, PutCondition, VersionToken};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    error::{DirectoryError, Result},
    naming::{manifest_key, parse_manifest_key, MANIFEST_PREFIX},
};

pub const FORMAT_VERSION: u32 = 1;

const FOOTER_PREFIX: &[u8] = b"\n#sha256=";

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Where the content of one logical file lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub object_key: String,
    pub size: u64,
    pub sha256: String,
    pub token: VersionToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: u64,
    pub parent_generation: Option<u64>,
    pub holder: String,
    pub lease_id: String,
    pub created_at_ms: u64,
    pub files: BTreeMap<String, FileRef>,
}

impl Manifest {
    /// State of an index nothing was ever published to.
    pub fn empty() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            generation: 0,
            parent_generation: None,
            holder: String::new(),
            lease_id: String::new(),
            created_at_ms: 0,
            files: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> String {
        manifest_key(self.generation)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut body =
            serde_json::to_vec(self).map_err(|e| DirectoryError::corrupt(self.key(), e.to_string()))?;
        let digest = sha256_hex(&body);
        body.extend_from_slice(FOOTER_PREFIX);
        body.extend_from_slice(digest.as_bytes());
        body.push(b'\n');
        Ok(Bytes::from(body))
    }

    /// Decodes the manifest stored under `key`, checking the footer digest,
    /// the format version and that the body belongs to `generation`.
    pub fn decode(key: &str, generation: u64, bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| DirectoryError::corrupt(key, reason);
        let split = bytes
            .windows(FOOTER_PREFIX.len())
            .rposition(|window| window == FOOTER_PREFIX)
            .ok_or_else(|| corrupt("missing checksum footer".to_string()))?;
        let (body, footer) = bytes.split_at(split);
        let digest = footer[FOOTER_PREFIX.len()..]
            .strip_suffix(b"\n")
            .ok_or_else(|| corrupt("truncated checksum footer".to_string()))?;
        if digest != sha256_hex(body).as_bytes() {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        let manifest: Manifest =
            serde_json::from_slice(body).map_err(|e| corrupt(format!("malformed body: {}", e)))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unknown format version {}",
                manifest.format_version
            )));
        }
        if manifest.generation != generation {
            return Err(corrupt(format!(
                "body is generation {} but key is generation {}",
                manifest.generation, generation
            )));
        }
        Ok(manifest)
    }

    pub fn get(&self, name: &str) -> Option<&FileRef> {
        self.files.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Object keys this generation needs.
    pub fn object_keys(&self) -> impl Iterator<Item = &str> {
        self.files.values().map(|file| file.object_key.as_str())
    }
}

/// A manifest object found in the store.
#[derive(Debug, Clone)]
pub struct ManifestListing {
    pub generation: u64,
    pub key: String,
    pub size: u64,
    pub last_modified_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestStatus {
    Valid { files: usize },
    Corrupt { reason: String },
}

#[derive(Debug, Clone)]
pub struct GenerationInfo {
    pub listing: ManifestListing,
    pub status: ManifestStatus,
}

/// Reads and publishes manifests under `manifests/`.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    storage: BlobStorage,
    metrics: Arc<metrics::directory::Metrics>,
}

impl ManifestStore {
    pub fn new(storage: BlobStorage, metrics: Arc<metrics::directory::Metrics>) -> Self {
        Self { storage, metrics }
    }

    /// Manifest objects ordered by generation. Keys that do not parse as a
    /// generation are ignored.
    pub async fn list(&self) -> Result<Vec<ManifestListing>> {
        let mut listings: Vec<ManifestListing> = self
            .storage
            .list(MANIFEST_PREFIX)
            .await?
            .into_iter()
            .filter_map(|object| {
                let generation = parse_manifest_key(&object.key)?;
                Some(ManifestListing {
                    generation,
                    key: object.key,
                    size: object.size,
                    last_modified_ms: object.last_modified_ms,
                })
            })
            .collect();
        listings.sort_by_key(|listing| listing.generation);
        Ok(listings)
    }

    pub async fn load(&self, generation: u64) -> Result<Manifest> {
        let key = manifest_key(generation);
        let (bytes, _) = self.storage.get(&key, None).await?;
        Manifest::decode(&key, generation, &bytes)
    }

    /// Highest generation that decodes and passes its integrity checks.
    /// Corrupt and vanished manifests are skipped.
    pub async fn resolve_latest(&self) -> Result<Option<Manifest>> {
        let listings = self.list().await?;
        for listing in listings.iter().rev() {
            match self.load(listing.generation).await {
                Ok(manifest) => {
                    debug!(generation = manifest.generation, "resolved latest generation");
                    return Ok(Some(manifest));
                }
                Err(DirectoryError::NotFound(_)) => {
                    debug!(key = listing.key, "manifest vanished after listing");
                }
                Err(err @ DirectoryError::Corrupt { .. }) => {
                    self.metrics.corrupt_manifests.add(1, &[]);
                    warn!(key = listing.key, error = %err, "skipping corrupt manifest");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Every listed manifest with its decode status.
    pub async fn inspect(&self) -> Result<Vec<GenerationInfo>> {
        let mut infos = Vec::new();
        for listing in self.list().await? {
            let status = match self.load(listing.generation).await {
                Ok(manifest) => ManifestStatus::Valid {
                    files: manifest.files.len(),
                },
                Err(DirectoryError::NotFound(_)) => continue,
                Err(DirectoryError::Corrupt { reason, .. }) => ManifestStatus::Corrupt { reason },
                Err(err) => return Err(err),
            };
            infos.push(GenerationInfo { listing, status });
        }
        Ok(infos)
    }

    /// Publishes with a create-only put. Fails with
    /// [`DirectoryError::Conflict`] if the generation already exists.
    pub async fn publish(&self, manifest: &Manifest) -> Result<VersionToken> {
        let body = manifest.encode()?;
        let token = self
            .storage
            .put(&manifest.key(), body, PutCondition::Create)
            .await?;
        Ok(token)
    }

    pub async fn delete(&self, generation: u64) -> Result<()> {
        Ok(self.storage.delete(&manifest_key(generation)).await?)
    }
}
