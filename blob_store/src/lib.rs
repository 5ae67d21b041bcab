mod error;
mod retry;

use std::{env, fmt, sync::Arc};

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey, DynamoCommit, S3ConditionalPut},
    memory::InMemory,
    parse_url,
    parse_url_opts,
    path::{Path, PathPart},
    GetOptions,
    MultipartUpload,
    ObjectMeta,
    ObjectStore,
    ObjectStoreScheme,
    PutMode,
    PutOptions,
    PutPayload,
    PutPayloadMut,
    UpdateVersion,
};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

pub use crate::{
    error::{BlobError, BlobResult},
    retry::{retry_with_backoff, Backoff, RetryPolicy},
};

/// Parts kept in flight while a multipart upload is being written.
const MULTIPART_MAX_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    /// Store URL, e.g. `file:///var/lib/index`, `s3://bucket/prefix` or
    /// `memory:///`.
    pub path: Option<String>,
    /// DynamoDB table used to implement conditional puts on S3. When absent
    /// S3 conditional requests (ETag match) are used.
    pub dynamodb_table: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: Some(format!("file://{}", path)),
            dynamodb_table: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn in_memory() -> Self {
        BlobStorageConfig {
            path: Some("memory:///".to_string()),
            dynamodb_table: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = format!(
            "file://{}",
            env::current_dir()
                .unwrap_or_else(|_| std::path::PathBuf::from("."))
                .join("blobdir_storage/blobs")
                .to_string_lossy()
        );
        BlobStorageConfig {
            path: Some(blob_store_path),
            dynamodb_table: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Opaque version of a stored object as reported by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken {
    pub e_tag: Option<String>,
    pub version: Option<String>,
}

impl VersionToken {
    pub fn new(e_tag: Option<String>, version: Option<String>) -> Self {
        Self { e_tag, version }
    }

    /// Two tokens match when their ETags are equal, or, for stores that only
    /// report versions, when their versions are equal. Tokens carrying
    /// neither never match.
    pub fn matches(&self, other: &VersionToken) -> bool {
        match (&self.e_tag, &other.e_tag) {
            (Some(a), Some(b)) => a == b,
            _ => match (&self.version, &other.version) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            e_tag: meta.e_tag.clone(),
            version: meta.version.clone(),
        }
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.e_tag, &self.version) {
            (Some(e_tag), _) => write!(f, "{}", e_tag),
            (None, Some(version)) => write!(f, "v:{}", version),
            (None, None) => write!(f, "-"),
        }
    }
}

/// Precondition attached to a put.
#[derive(Debug, Clone)]
pub enum PutCondition {
    /// Unconditionally replace the object.
    Overwrite,
    /// Fail with [`BlobError::Conflict`] if the object already exists.
    Create,
    /// Fail with [`BlobError::Conflict`] unless the object's current version
    /// matches.
    Match(VersionToken),
}

impl From<PutCondition> for PutMode {
    fn from(condition: PutCondition) -> Self {
        match condition {
            PutCondition::Overwrite => PutMode::Overwrite,
            PutCondition::Create => PutMode::Create,
            PutCondition::Match(token) => PutMode::Update(UpdateVersion {
                e_tag: token.e_tag,
                version: token.version,
            }),
        }
    }
}

/// Listing entry, keyed relative to the storage root.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub token: VersionToken,
    pub last_modified_ms: u64,
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    retry: RetryPolicy,
    metrics: Arc<metrics::blob_storage::Metrics>,
}

impl fmt::Debug for BlobStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStorage")
            .field("object_store", &self.object_store.to_string())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> BlobResult<Self> {
        let url = config.path.clone().ok_or_else(|| BlobError::InvalidPath {
            key: String::new(),
            reason: "blob storage path is not configured".to_string(),
        })?;
        let (object_store, path) = Self::build_object_store(&url, config.dynamodb_table)?;
        info!(%url, "using blob store");
        Ok(Self::from_object_store(Arc::from(object_store), path, config.retry))
    }

    /// Wraps an already constructed store, rooted at `path`.
    pub fn from_object_store(
        object_store: Arc<dyn ObjectStore>,
        path: Path,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            object_store,
            path,
            retry,
            metrics: Arc::new(metrics::blob_storage::Metrics::new()),
        }
    }

    /// Fresh in-process store, used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self::from_object_store(
            Arc::new(InMemory::new()),
            Path::default(),
            RetryPolicy::default(),
        )
    }

    pub fn build_object_store(
        url_str: &str,
        ddb_table: Option<String>,
    ) -> BlobResult<(Box<dyn ObjectStore>, Path)> {
        let invalid = |reason: String| BlobError::InvalidPath {
            key: url_str.to_string(),
            reason,
        };
        let url = url_str
            .parse::<Url>()
            .map_err(|e| invalid(e.to_string()))?;
        let (scheme, _) = ObjectStoreScheme::parse(&url).map_err(|e| invalid(e.to_string()))?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // inject AWS environment variables to prioritize keys over instance metadata
                // credentials.
                let opts: Vec<(AmazonS3ConfigKey, String)> = std::env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        if let (Some(key), Some(value)) = (os_key.to_str(), os_value.to_str()) {
                            if key.starts_with("AWS_") {
                                if let Ok(config_key) = key.to_ascii_lowercase().parse() {
                                    return Some((config_key, String::from(value)));
                                }
                            }
                        }
                        None
                    })
                    .collect();

                let mut s3_builder = AmazonS3Builder::new().with_url(url_str);
                for (key, value) in opts.iter() {
                    s3_builder = s3_builder.with_config(*key, value.clone());
                }
                let conditional_put = match ddb_table {
                    Some(table) => S3ConditionalPut::Dynamo(DynamoCommit::new(table)),
                    None => S3ConditionalPut::ETagMatch,
                };
                let s3 = s3_builder
                    .with_conditional_put(conditional_put)
                    .build()
                    .map_err(|e| invalid(e.to_string()))?;
                let (_, path) = parse_url_opts(&url, opts).map_err(|e| invalid(e.to_string()))?;
                Ok((Box::new(s3), path))
            }
            _ => parse_url(&url).map_err(|e| invalid(e.to_string())),
        }
    }

    pub fn get_object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    pub fn get_path(&self) -> Path {
        self.path.clone()
    }

    /// Same store, rooted one level deeper at `prefix`.
    pub fn scoped(&self, prefix: &str) -> Self {
        Self {
            object_store: self.object_store.clone(),
            path: self.object_path(prefix),
            retry: self.retry.clone(),
            metrics: self.metrics.clone(),
        }
    }

    fn object_path(&self, key: &str) -> Path {
        let parts: Vec<PathPart<'_>> = self
            .path
            .parts()
            .chain(key.split('/').filter(|p| !p.is_empty()).map(PathPart::from))
            .collect();
        Path::from_iter(parts)
    }

    fn relative_key(&self, location: &Path) -> String {
        let location = location.as_ref();
        let root = self.path.as_ref();
        if root.is_empty() {
            return location.to_string();
        }
        location
            .strip_prefix(root)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(location)
            .to_string()
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, key: &str, f: F) -> BlobResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = BlobResult<T>>,
    {
        let labels = [KeyValue::new("op", operation)];
        let _timer = metrics::Timer::start_with_labels(&self.metrics.operations, &labels);
        let description = format!("{operation} {key}");
        let result = retry_with_backoff(
            self.retry.max_retries,
            self.retry.backoff(),
            &description,
            f,
            BlobError::is_transient,
            |_| self.metrics.retries.add(1, &labels),
        )
        .await;
        if let Err(err) = &result {
            // misses and lost races are expected outcomes, not store failures
            if !err.is_not_found() && !err.is_conflict() {
                self.metrics.errors.add(1, &labels);
            }
        }
        result
    }

    /// Reads a whole object. With `expected`, the read is pinned to that
    /// version: by ETag match when the token has one, failing with
    /// [`BlobError::Conflict`] if the object was replaced, otherwise by the
    /// store's version id.
    pub async fn get(
        &self,
        key: &str,
        expected: Option<&VersionToken>,
    ) -> BlobResult<(Bytes, VersionToken)> {
        let path = &self.object_path(key);
        let store = &self.object_store;
        let (bytes, token) = self
            .with_retry("get", key, || async move {
                let if_match = expected.and_then(|t| t.e_tag.clone());
                let version = match if_match {
                    Some(_) => None,
                    None => expected.and_then(|t| t.version.clone()),
                };
                let options = GetOptions {
                    if_match,
                    version,
                    ..Default::default()
                };
                let result = store
                    .get_opts(path, options)
                    .await
                    .map_err(|e| BlobError::from_object_store(key, e))?;
                let token = VersionToken::from_meta(&result.meta);
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| BlobError::from_object_store(key, e))?;
                Ok((bytes, token))
            })
            .await?;
        self.metrics.bytes_downloaded.add(bytes.len() as u64, &[]);
        Ok((bytes, token))
    }

    pub async fn head(&self, key: &str) -> BlobResult<ObjectInfo> {
        let path = &self.object_path(key);
        let store = &self.object_store;
        let meta = self
            .with_retry("head", key, || async move {
                store
                    .head(path)
                    .await
                    .map_err(|e| BlobError::from_object_store(key, e))
            })
            .await?;
        Ok(self.object_info(&meta))
    }

    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        condition: PutCondition,
    ) -> BlobResult<VersionToken> {
        let path = &self.object_path(key);
        let store = &self.object_store;
        let data = &data;
        let condition = &condition;
        let result = self
            .with_retry("put", key, || async move {
                let options = PutOptions {
                    mode: condition.clone().into(),
                    ..Default::default()
                };
                store
                    .put_opts(path, PutPayload::from(data.clone()), options)
                    .await
                    .map_err(|e| BlobError::from_object_store(key, e))
            })
            .await?;
        self.metrics.bytes_uploaded.add(data.len() as u64, &[]);
        debug!(key, size = data.len(), "put object");
        Ok(VersionToken::new(result.e_tag, result.version))
    }

    /// Starts a multipart upload. Parts are written in order and the object
    /// only becomes visible once [`MultipartWriter::finish`] succeeds.
    pub async fn multipart_writer(&self, key: &str, part_size: usize) -> BlobResult<MultipartWriter> {
        let path = &self.object_path(key);
        let store = &self.object_store;
        let upload = self
            .with_retry("put_multipart", key, || async move {
                store
                    .put_multipart(path)
                    .await
                    .map_err(|e| BlobError::from_object_store(key, e))
            })
            .await?;
        Ok(MultipartWriter {
            key: key.to_string(),
            upload,
            buffer: PutPayloadMut::new(),
            part_size,
            parts: JoinSet::new(),
            bytes_written: 0,
            metrics: self.metrics.clone(),
        })
    }

    /// Deletes an object. Deleting an absent object succeeds.
    pub async fn delete(&self, key: &str) -> BlobResult<()> {
        let path = &self.object_path(key);
        let store = &self.object_store;
        let result = self
            .with_retry("delete", key, || async move {
                store
                    .delete(path)
                    .await
                    .map_err(|e| BlobError::from_object_store(key, e))
            })
            .await;
        match result {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Lists every object under `prefix`, sorted by key.
    pub async fn list(&self, prefix: &str) -> BlobResult<Vec<ObjectInfo>> {
        let path = &self.object_path(prefix);
        let store = &self.object_store;
        let metas: Vec<ObjectMeta> = self
            .with_retry("list", prefix, || async move {
                store
                    .list(Some(path))
                    .try_collect::<Vec<ObjectMeta>>()
                    .await
                    .map_err(|e| BlobError::from_object_store(prefix, e))
            })
            .await?;
        let mut objects: Vec<ObjectInfo> = metas.iter().map(|m| self.object_info(m)).collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn object_info(&self, meta: &ObjectMeta) -> ObjectInfo {
        ObjectInfo {
            key: self.relative_key(&meta.location),
            size: meta.size as u64,
            token: VersionToken::from_meta(meta),
            last_modified_ms: meta.last_modified.timestamp_millis().max(0) as u64,
        }
    }
}

/// Ordered chunked upload of one object. A failed upload is aborted so the
/// store does not keep its parts.
pub struct MultipartWriter {
    key: String,
    upload: Box<dyn MultipartUpload>,
    buffer: PutPayloadMut,
    part_size: usize,
    parts: JoinSet<object_store::Result<()>>,
    bytes_written: u64,
    metrics: Arc<metrics::blob_storage::Metrics>,
}

impl MultipartWriter {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn write(&mut self, mut data: &[u8]) -> BlobResult<()> {
        self.wait_for_parts(MULTIPART_MAX_CONCURRENCY)
            .await
            .map_err(|e| BlobError::from_object_store(&self.key, e))?;
        self.bytes_written += data.len() as u64;
        while !data.is_empty() {
            let room = self.part_size - self.buffer.content_length();
            let (head, rest) = data.split_at(data.len().min(room));
            self.buffer.extend_from_slice(head);
            if self.buffer.content_length() == self.part_size {
                self.start_part();
            }
            data = rest;
        }
        Ok(())
    }

    /// Uploads the last part and completes the object.
    pub async fn finish(mut self) -> BlobResult<VersionToken> {
        if !self.buffer.is_empty() {
            self.start_part();
        }
        let result = match self.wait_for_parts(0).await {
            Ok(()) => self.upload.complete().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(result) => {
                self.metrics.bytes_uploaded.add(self.bytes_written, &[]);
                debug!(key = self.key, size = self.bytes_written, "completed multipart upload");
                Ok(VersionToken::new(result.e_tag, result.version))
            }
            Err(err) => {
                let err = BlobError::from_object_store(&self.key, err);
                if let Err(abort_err) = self.abort_upload().await {
                    warn!(key = self.key, error = %abort_err, "failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    pub async fn abort(mut self) -> BlobResult<()> {
        self.abort_upload()
            .await
            .map_err(|e| BlobError::from_object_store(&self.key, e))
    }

    fn start_part(&mut self) {
        let part = std::mem::take(&mut self.buffer).freeze();
        self.parts.spawn(self.upload.put_part(part));
    }

    /// Waits until fewer than `max_in_flight` parts are uploading, failing on
    /// the first part that did not make it.
    async fn wait_for_parts(&mut self, max_in_flight: usize) -> object_store::Result<()> {
        while !self.parts.is_empty() && self.parts.len() >= max_in_flight {
            if let Some(joined) = self.parts.join_next().await {
                joined.map_err(|source| object_store::Error::JoinError { source })??;
            }
        }
        Ok(())
    }

    async fn abort_upload(&mut self) -> object_store::Result<()> {
        self.parts.shutdown().await;
        self.upload.abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list_delete() -> BlobResult<()> {
        let storage = BlobStorage::in_memory();
        let token = storage
            .put("data/a/1", Bytes::from_static(b"hello"), PutCondition::Create)
            .await?;
        storage
            .put("data/b/1", Bytes::from_static(b"world!"), PutCondition::Create)
            .await?;

        let (bytes, read_token) = storage.get("data/a/1", None).await?;
        assert_eq!(bytes.as_ref(), b"hello");
        assert!(read_token.matches(&token));

        let listed = storage.list("data").await?;
        let keys: Vec<&str> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["data/a/1", "data/b/1"]);
        assert_eq!(listed[1].size, 6);

        storage.delete("data/a/1").await?;
        storage.delete("data/a/1").await?;
        assert!(storage.get("data/a/1", None).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_conditional_puts() -> BlobResult<()> {
        let storage = BlobStorage::in_memory();
        let first = storage
            .put("write.lock", Bytes::from_static(b"a"), PutCondition::Create)
            .await?;
        let err = storage
            .put("write.lock", Bytes::from_static(b"b"), PutCondition::Create)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let second = storage
            .put(
                "write.lock",
                Bytes::from_static(b"c"),
                PutCondition::Match(first.clone()),
            )
            .await?;
        assert!(!second.matches(&first));

        // stale token loses
        let err = storage
            .put("write.lock", Bytes::from_static(b"d"), PutCondition::Match(first))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let (bytes, _) = storage.get("write.lock", Some(&second)).await?;
        assert_eq!(bytes.as_ref(), b"c");
        Ok(())
    }

    #[tokio::test]
    async fn test_rooted_storage_keys_are_relative() -> BlobResult<()> {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let storage = BlobStorage::from_object_store(
            store.clone(),
            Path::from("indexes/catalog"),
            RetryPolicy::default(),
        );
        storage
            .put("manifests/1", Bytes::from_static(b"m"), PutCondition::Overwrite)
            .await?;

        let listed = storage.list("manifests").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "manifests/1");

        let raw = store
            .head(&Path::from("indexes/catalog/manifests/1"))
            .await
            .unwrap();
        assert_eq!(raw.size, 1);

        let scoped = storage.scoped("manifests");
        let listed = scoped.list("").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "1");
        Ok(())
    }

    #[tokio::test]
    async fn test_multipart_upload() -> BlobResult<()> {
        let storage = BlobStorage::in_memory();
        let mut writer = storage.multipart_writer("data/big/1", 5 * 1024 * 1024).await?;
        let chunk = vec![7u8; 1024 * 1024];
        for _ in 0..6 {
            writer.write(&chunk).await?;
        }
        assert_eq!(writer.bytes_written(), 6 * 1024 * 1024);
        writer.finish().await?;

        let (bytes, _) = storage.get("data/big/1", None).await?;
        assert_eq!(bytes.len(), 6 * 1024 * 1024);
        assert!(bytes.iter().all(|b| *b == 7));
        Ok(())
    }

    #[tokio::test]
    async fn test_local_filesystem_store() -> BlobResult<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = BlobStorageConfig::new(temp_dir.path().to_str().unwrap());
        let storage = BlobStorage::new(config)?;
        storage
            .put("data/f/1", Bytes::from_static(b"on disk"), PutCondition::Create)
            .await?;
        let (bytes, _) = storage.get("data/f/1", None).await?;
        assert_eq!(bytes.as_ref(), b"on disk");
        assert!(storage
            .put("data/f/1", Bytes::from_static(b"again"), PutCondition::Create)
            .await
            .unwrap_err()
            .is_conflict());
        Ok(())
    }
}
