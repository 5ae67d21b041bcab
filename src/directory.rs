//! The directory surface an index engine works against.
//!
//! [`BlobDirectory`] is the entry point. Readers get a [`ReaderSession`]
//! pinned to one published generation; the single writer gets a
//! [`WriterSession`] holding the write lease, a working file set and the
//! commit path. File content is read through the local cache and written
//! through pinned cache blocks that are uploaded when the output is closed.

use std::{
    collections::{BTreeMap, HashSet},
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};

use async_trait::async_trait;
use blob_store::{BlobStorage, MultipartWriter, PutCondition, VersionToken};
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheStats, LocalCache, WriteBlock},
    commit::CommitCoordinator,
    config::DirectoryConfig,
    error::{DirectoryError, Result},
    gc::{GarbageCollector, GcReport, ProtectedKeys},
    lock::{DistributedLock, LeaseKeeper, LockStatus},
    manifest::{sha256_hex, FileRef, GenerationInfo, Manifest, ManifestStore},
    naming::{data_key, validate_name},
    utils::{Clock, SystemClock},
};

/// Reads of a fetched object whose checksum does not match its manifest.
const FETCH_ATTEMPTS: u32 = 2;

/// Read surface shared by readers and the writer.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Generation the file set was resolved from. 0 for an empty index.
    fn generation(&self) -> u64;

    async fn list_all(&self) -> Result<Vec<String>>;

    async fn file_exists(&self, name: &str) -> Result<bool>;

    async fn file_length(&self, name: &str) -> Result<u64>;

    async fn open_input(&self, name: &str) -> Result<IndexInput>;
}

/// One logical file as seen through a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub size: u64,
    pub token: VersionToken,
    pub object_key: String,
    pub cached: bool,
}

struct Shared {
    config: DirectoryConfig,
    storage: BlobStorage,
    manifests: ManifestStore,
    cache: Arc<LocalCache>,
    clock: Arc<dyn Clock>,
    metrics: Arc<metrics::directory::Metrics>,
}

impl Shared {
    async fn latest(&self) -> Result<Arc<Manifest>> {
        let manifest = self
            .manifests
            .resolve_latest()
            .await?
            .unwrap_or_else(Manifest::empty);
        Ok(Arc::new(manifest))
    }

    fn entry(&self, name: &str, file: &FileRef) -> DirectoryEntry {
        DirectoryEntry {
            name: name.to_string(),
            size: file.size,
            token: file.token.clone(),
            object_key: file.object_key.clone(),
            cached: self.cache.contains(&file.object_key, &file.token),
        }
    }

    async fn read_file(&self, name: &str, file: &FileRef) -> Result<Bytes> {
        if self.config.cache.verify_on_open {
            let current = self.storage.head(&file.object_key).await.map_err(|e| {
                if e.is_not_found() {
                    DirectoryError::NotFound(name.to_string())
                } else {
                    e.into()
                }
            })?;
            if !current.token.matches(&file.token) {
                warn!(
                    name,
                    object_key = file.object_key,
                    "stored version differs from the manifest"
                );
                self.cache.invalidate(&file.object_key);
            }
        }
        if let Some(data) = self.cache.get(&file.object_key, &file.token) {
            return Ok(data);
        }
        self.fetch(name, file).await
    }

    async fn fetch(&self, name: &str, file: &FileRef) -> Result<Bytes> {
        for attempt in 1..=FETCH_ATTEMPTS {
            let (data, _) = self
                .storage
                .get(&file.object_key, None)
                .await
                .map_err(|e| {
                    if e.is_not_found() {
                        DirectoryError::NotFound(name.to_string())
                    } else {
                        e.into()
                    }
                })?;
            if data.len() as u64 == file.size && sha256_hex(&data) == file.sha256 {
                self.cache
                    .insert(&file.object_key, file.token.clone(), data.clone());
                return Ok(data);
            }
            warn!(
                name,
                object_key = file.object_key,
                attempt,
                "fetched content does not match the manifest checksum"
            );
        }
        Err(DirectoryError::corrupt(
            &file.object_key,
            "content does not match the manifest checksum",
        ))
    }

    fn lock(&self, holder: &str) -> DistributedLock {
        DistributedLock::new(
            self.storage.clone(),
            holder,
            &self.config.lock,
            self.clock.clone(),
            self.metrics.clone(),
        )
    }
}

fn lookup<'a>(files: &'a BTreeMap<String, FileRef>, name: &str) -> Result<&'a FileRef> {
    validate_name(name)?;
    files
        .get(name)
        .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
}

/// Blob-backed index directory. Cheap to clone.
#[derive(Clone)]
pub struct BlobDirectory {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for BlobDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobDirectory")
            .field("storage", &self.shared.storage)
            .field("cache", &self.shared.cache)
            .finish()
    }
}

impl BlobDirectory {
    pub fn new(config: DirectoryConfig) -> Result<Self> {
        config.validate()?;
        let storage = BlobStorage::new(config.blob_storage.clone())?;
        Ok(Self::with_storage(storage, config, Arc::new(SystemClock)))
    }

    /// Builds a directory over an existing store. The configured namespace
    /// is applied on top of `storage`'s root.
    pub fn with_storage(storage: BlobStorage, config: DirectoryConfig, clock: Arc<dyn Clock>) -> Self {
        let storage = match &config.namespace {
            Some(namespace) => storage.scoped(namespace),
            None => storage,
        };
        let metrics = Arc::new(metrics::directory::Metrics::new());
        let cache = Arc::new(LocalCache::new(config.cache.max_bytes, metrics.clone()));
        Self {
            shared: Arc::new(Shared {
                manifests: ManifestStore::new(storage.clone(), metrics.clone()),
                storage,
                cache,
                clock,
                metrics,
                config,
            }),
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.shared.config
    }

    pub fn storage(&self) -> &BlobStorage {
        &self.shared.storage
    }

    /// Generation currently published, resolved from the store.
    pub async fn current_generation(&self) -> Result<u64> {
        Ok(self.shared.latest().await?.generation)
    }

    /// Names at the latest generation, in order.
    pub async fn list(&self) -> Result<Vec<String>> {
        let manifest = self.shared.latest().await?;
        Ok(manifest.names().map(str::to_string).collect())
    }

    pub async fn open(&self, name: &str) -> Result<IndexInput> {
        self.open_reader().await?.open_input(name).await
    }

    pub async fn length(&self, name: &str) -> Result<u64> {
        let manifest = self.shared.latest().await?;
        Ok(lookup(&manifest.files, name)?.size)
    }

    pub async fn file_exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let manifest = self.shared.latest().await?;
        Ok(manifest.files.contains_key(name))
    }

    pub async fn entries(&self) -> Result<Vec<DirectoryEntry>> {
        let manifest = self.shared.latest().await?;
        Ok(manifest
            .files
            .iter()
            .map(|(name, file)| self.shared.entry(name, file))
            .collect())
    }

    /// Session pinned to the latest generation.
    pub async fn open_reader(&self) -> Result<ReaderSession> {
        let manifest = self.shared.latest().await?;
        debug!(generation = manifest.generation, "opened reader");
        Ok(ReaderSession {
            shared: self.shared.clone(),
            manifest,
        })
    }

    /// Acquires the write lease for `holder` and opens the single writer
    /// session, based on the latest generation.
    #[tracing::instrument(skip(self))]
    pub async fn open_writer(&self, holder: &str) -> Result<WriterSession> {
        let shared = &self.shared;
        let lock = Arc::new(shared.lock(holder));
        let lock_config = &shared.config.lock;
        let lease = if lock_config.acquire_timeout.is_zero() {
            lock.acquire().await?
        } else {
            lock.acquire_with_timeout(lock_config.acquire_timeout, lock_config.poll_interval)
                .await?
        };

        let base = match shared.latest().await {
            Ok(base) => base,
            Err(err) => {
                lock.release().await?;
                return Err(err);
            }
        };

        let keeper = lock_config
            .auto_renew
            .then(|| LeaseKeeper::spawn(lock.clone(), lock_config.renew_interval));
        let (committed_tx, committed_rx) = watch::channel(base.generation);
        let pending = ProtectedKeys::default();
        let background_gc = shared.config.gc.background.then(|| {
            let collector = GarbageCollector::new(
                shared.storage.clone(),
                lock.clone(),
                shared.clock.clone(),
                shared.config.gc.grace_period,
                shared.metrics.clone(),
            );
            let (shutdown_tx, shutdown_rx) = watch::channel(());
            let interval = shared.config.gc.interval;
            let protected = pending.clone();
            let handle = tokio::spawn(async move {
                collector
                    .start(committed_rx, shutdown_rx, interval, protected)
                    .await
            });
            (shutdown_tx, handle)
        });
        let coordinator = CommitCoordinator::new(
            shared.manifests.clone(),
            lock.clone(),
            shared.clock.clone(),
            shared.config.commit.max_retries,
            committed_tx,
            shared.metrics.clone(),
        );

        info!(
            holder,
            lease_id = lease.lease_id,
            base_generation = base.generation,
            "opened writer"
        );
        Ok(WriterSession {
            state: Arc::new(Mutex::new(WriterState {
                files: base.files.clone(),
                base,
                open_outputs: HashSet::new(),
                committing: HashSet::new(),
                next_upload: 0,
                closed: false,
            })),
            shared: shared.clone(),
            lease_id: lease.lease_id,
            lock,
            coordinator,
            commit_lock: tokio::sync::Mutex::new(()),
            pending,
            keeper,
            background_gc,
        })
    }

    /// Every manifest in the store with its validity.
    pub async fn generations(&self) -> Result<Vec<GenerationInfo>> {
        self.shared.manifests.inspect().await
    }

    pub async fn lock_status(&self) -> Result<Option<LockStatus>> {
        DistributedLock::inspect(&self.shared.storage, self.shared.clock.as_ref()).await
    }

    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.lock_status().await?.is_some_and(|status| status.active))
    }

    /// Forcibly removes the write lease.
    pub async fn break_lock(&self) -> Result<bool> {
        DistributedLock::break_lock(&self.shared.storage).await
    }

    /// One collection pass under a short-lived lease of its own. Fails with
    /// [`DirectoryError::LockHeld`] while a writer is active; writers use
    /// [`WriterSession::collect_garbage`].
    pub async fn collect_garbage(
        &self,
        protected: &HashSet<String>,
        dry_run: bool,
    ) -> Result<GcReport> {
        let shared = &self.shared;
        let lock = Arc::new(shared.lock(&shared.config.holder_id()));
        lock.acquire().await?;
        let report = GarbageCollector::new(
            shared.storage.clone(),
            lock.clone(),
            shared.clock.clone(),
            shared.config.gc.grace_period,
            shared.metrics.clone(),
        )
        .with_dry_run(dry_run)
        .run_once(protected)
        .await;
        lock.release().await?;
        report
    }

    /// Drops cached content; returns the number of entries dropped.
    pub fn clear_cache(&self) -> usize {
        let dropped = self.shared.cache.clear();
        info!(dropped, "cleared cache");
        dropped
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }
}

/// Read-only view of one published generation.
#[derive(Clone)]
pub struct ReaderSession {
    shared: Arc<Shared>,
    manifest: Arc<Manifest>,
}

impl std::fmt::Debug for ReaderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderSession")
            .field("generation", &self.manifest.generation)
            .finish_non_exhaustive()
    }
}

impl ReaderSession {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn entries(&self) -> Vec<DirectoryEntry> {
        self.manifest
            .files
            .iter()
            .map(|(name, file)| self.shared.entry(name, file))
            .collect()
    }

    /// A session on the latest generation if it moved past this one.
    pub async fn reopen_if_changed(&self) -> Result<Option<ReaderSession>> {
        let latest = self.shared.latest().await?;
        if latest.generation <= self.manifest.generation {
            return Ok(None);
        }
        debug!(
            from = self.manifest.generation,
            to = latest.generation,
            "reopened reader"
        );
        Ok(Some(ReaderSession {
            shared: self.shared.clone(),
            manifest: latest,
        }))
    }
}

#[async_trait]
impl Directory for ReaderSession {
    fn generation(&self) -> u64 {
        self.manifest.generation
    }

    async fn list_all(&self) -> Result<Vec<String>> {
        Ok(self.manifest.names().map(str::to_string).collect())
    }

    async fn file_exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self.manifest.files.contains_key(name))
    }

    async fn file_length(&self, name: &str) -> Result<u64> {
        Ok(lookup(&self.manifest.files, name)?.size)
    }

    async fn open_input(&self, name: &str) -> Result<IndexInput> {
        let file = lookup(&self.manifest.files, name)?;
        let data = self.shared.read_file(name, file).await?;
        Ok(IndexInput::new(name, data))
    }
}

struct WriterState {
    /// Last generation this writer published or started from.
    base: Arc<Manifest>,
    /// Working file set: what the next commit publishes.
    files: BTreeMap<String, FileRef>,
    open_outputs: HashSet<String>,
    /// Object keys of the commit in flight. They must stay in the store even
    /// if the working set drops them meanwhile.
    committing: HashSet<String>,
    next_upload: u64,
    closed: bool,
}

impl WriterState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DirectoryError::Closed("writer session"));
        }
        Ok(())
    }

    /// Whether an object dropped from the working set can be deleted right
    /// away. Keys of the commit in flight are left to the collector.
    fn deletable(&self, object_key: &str) -> bool {
        !self.committing.contains(object_key)
    }
}

/// The single writer. Holds the write lease until closed.
///
/// Dropping a session without [`WriterSession::close`] stops lease renewal
/// and leaves the lease to expire.
pub struct WriterSession {
    shared: Arc<Shared>,
    lock: Arc<DistributedLock>,
    lease_id: String,
    coordinator: CommitCoordinator,
    /// Serializes commits of this session.
    commit_lock: tokio::sync::Mutex<()>,
    state: Arc<Mutex<WriterState>>,
    /// Uploaded objects not yet referenced by a published manifest.
    pending: ProtectedKeys,
    keeper: Option<LeaseKeeper>,
    background_gc: Option<(watch::Sender<()>, JoinHandle<()>)>,
}

impl std::fmt::Debug for WriterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterSession")
            .field("lock", &self.lock)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl WriterSession {
    pub fn holder(&self) -> &str {
        self.lock.holder()
    }

    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    /// Object keys uploaded by this session and not yet published.
    pub fn pending_objects(&self) -> HashSet<String> {
        self.pending.lock().clone()
    }

    /// Starts a new file. Content stays in a pinned cache block (or streams
    /// through a multipart upload once large) until [`IndexOutput::close`].
    pub fn create_output(&self, name: &str) -> Result<IndexOutput> {
        validate_name(name)?;
        let lease = self.lock.ensure_held()?;
        let mut state = self.state.lock();
        state.ensure_open()?;
        if !state.open_outputs.insert(name.to_string()) {
            return Err(DirectoryError::AlreadyOpen(name.to_string()));
        }
        state.next_upload += 1;
        let upload_id = format!("{}-{}", lease.lease_id, state.next_upload);
        let object_key = data_key(name, state.base.generation + 1, &upload_id);
        drop(state);

        self.shared.metrics.open_outputs.add(1, &[]);
        debug!(name, object_key, "created output");
        Ok(IndexOutput {
            name: name.to_string(),
            object_key,
            block: Some(self.shared.cache.begin_write(name)),
            multipart: None,
            hasher: Sha256::new(),
            written: 0,
            shared: self.shared.clone(),
            lock: self.lock.clone(),
            writer: self.state.clone(),
            pending: self.pending.clone(),
            finished: false,
        })
    }

    /// Removes `name` from the working set. Objects never published are
    /// deleted right away, published ones are left to the collector.
    pub async fn delete_file(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.lock.ensure_held()?;
        let (removed, deletable) = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            if state.open_outputs.contains(name) {
                return Err(DirectoryError::AlreadyOpen(name.to_string()));
            }
            let removed = state
                .files
                .remove(name)
                .ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;
            let deletable = state.deletable(&removed.object_key);
            (removed, deletable)
        };
        self.discard_if_unpublished(&removed.object_key, deletable)
            .await
    }

    /// Repoints `from` to `to` in the working set. No object is copied.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        validate_name(from)?;
        validate_name(to)?;
        self.lock.ensure_held()?;
        let replaced = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            for name in [from, to] {
                if state.open_outputs.contains(name) {
                    return Err(DirectoryError::AlreadyOpen(name.to_string()));
                }
            }
            let file = state
                .files
                .remove(from)
                .ok_or_else(|| DirectoryError::NotFound(from.to_string()))?;
            let replaced = state.files.insert(to.to_string(), file);
            replaced.map(|replaced| {
                let deletable = state.deletable(&replaced.object_key);
                (replaced, deletable)
            })
        };
        debug!(from, to, "renamed");
        if let Some((replaced, deletable)) = replaced {
            self.discard_if_unpublished(&replaced.object_key, deletable)
                .await?;
        }
        Ok(())
    }

    /// Checks that every name is sealed and its content is in the store.
    pub async fn sync(&self, names: &[&str]) -> Result<()> {
        self.lock.ensure_held()?;
        let mut to_check = Vec::new();
        {
            let state = self.state.lock();
            state.ensure_open()?;
            for name in names {
                validate_name(name)?;
                if state.open_outputs.contains(*name) {
                    return Err(DirectoryError::AlreadyOpen(name.to_string()));
                }
                let file = lookup(&state.files, name)?;
                if self.pending.lock().contains(&file.object_key) {
                    to_check.push(file.object_key.clone());
                }
            }
        }
        for key in to_check {
            self.shared.storage.head(&key).await?;
        }
        Ok(())
    }

    /// Publishes the working set as the next generation.
    #[tracing::instrument(skip(self), fields(holder = self.lock.holder()))]
    pub async fn commit(&self) -> Result<Manifest> {
        let _commit = self.commit_lock.lock().await;
        let (base_generation, files) = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            if let Some(name) = state
                .open_outputs
                .iter()
                .find(|name| state.files.contains_key(*name))
            {
                return Err(DirectoryError::AlreadyOpen(name.clone()));
            }
            let files = state.files.clone();
            state.committing = files.values().map(|f| f.object_key.clone()).collect();
            (state.base.generation, files)
        };

        let result = self.coordinator.commit(base_generation, files).await;
        let mut state = self.state.lock();
        state.committing.clear();
        let manifest = result?;
        {
            let mut pending = self.pending.lock();
            for key in manifest.object_keys() {
                pending.remove(key);
            }
        }
        state.base = Arc::new(manifest.clone());
        Ok(manifest)
    }

    /// One collection pass under this writer's lease, protecting its
    /// unpublished uploads.
    pub async fn collect_garbage(&self, dry_run: bool) -> Result<GcReport> {
        self.state.lock().ensure_open()?;
        GarbageCollector::new(
            self.shared.storage.clone(),
            self.lock.clone(),
            self.shared.clock.clone(),
            self.shared.config.gc.grace_period,
            self.shared.metrics.clone(),
        )
        .with_dry_run(dry_run)
        .run_once(&self.pending_objects())
        .await
    }

    /// Drops uncommitted work, deleting its uploads, and releases the lease.
    pub async fn abort(mut self) -> Result<()> {
        let files = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            state.closed = true;
            std::mem::take(&mut state.files)
        };
        let pending: Vec<String> = self.pending.lock().drain().collect();
        info!(discarded = pending.len(), working_files = files.len(), "aborting writer");
        for key in pending {
            if let Err(err) = self.shared.storage.delete(&key).await {
                warn!(key, error = %err, "failed to delete unpublished upload");
            }
        }
        self.shutdown().await
    }

    /// Releases the lease. Uncommitted work is abandoned to the collector.
    pub async fn close(mut self) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            state.closed = true;
        }
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(keeper) = self.keeper.take() {
            keeper.stop().await;
        }
        if let Some((shutdown_tx, handle)) = self.background_gc.take() {
            shutdown_tx.send_replace(());
            let _ = handle.await;
        }
        self.lock.release().await
    }

    /// Keys of the commit in flight stay pending until it settles.
    async fn discard_if_unpublished(&self, object_key: &str, deletable: bool) -> Result<()> {
        if !deletable {
            return Ok(());
        }
        let unpublished = self.pending.lock().remove(object_key);
        if unpublished {
            debug!(object_key, "deleting unpublished upload");
            self.shared.storage.delete(object_key).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for WriterSession {
    fn generation(&self) -> u64 {
        self.state.lock().base.generation
    }

    async fn list_all(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().files.keys().cloned().collect())
    }

    async fn file_exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self.state.lock().files.contains_key(name))
    }

    async fn file_length(&self, name: &str) -> Result<u64> {
        Ok(lookup(&self.state.lock().files, name)?.size)
    }

    async fn open_input(&self, name: &str) -> Result<IndexInput> {
        let file = lookup(&self.state.lock().files, name)?.clone();
        let data = self.shared.read_file(name, &file).await?;
        Ok(IndexInput::new(name, data))
    }
}

/// A file being written. Nothing is visible to readers until a commit
/// publishes it.
pub struct IndexOutput {
    name: String,
    object_key: String,
    block: Option<WriteBlock>,
    multipart: Option<MultipartWriter>,
    hasher: Sha256,
    written: u64,
    shared: Arc<Shared>,
    lock: Arc<DistributedLock>,
    writer: Arc<Mutex<WriterState>>,
    pending: ProtectedKeys,
    finished: bool,
}

impl std::fmt::Debug for IndexOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexOutput")
            .field("name", &self.name)
            .field("object_key", &self.object_key)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl IndexOutput {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_pointer(&self) -> u64 {
        self.written
    }

    /// Hex SHA-256 of everything written so far.
    pub fn checksum(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let block = self
            .block
            .as_mut()
            .ok_or(DirectoryError::Closed("output"))?;
        block.extend(data);
        self.hasher.update(data);
        self.written += data.len() as u64;

        let cache_config = &self.shared.config.cache;
        if self.multipart.is_none() && block.len() >= cache_config.multipart_threshold {
            self.lock.ensure_held()?;
            debug!(
                name = self.name,
                object_key = self.object_key,
                "switching to multipart upload"
            );
            self.multipart = Some(
                self.shared
                    .storage
                    .multipart_writer(&self.object_key, cache_config.part_size)
                    .await?,
            );
        }
        if let Some(multipart) = self.multipart.as_mut() {
            while block.len() >= cache_config.part_size {
                let part = block.take_front(cache_config.part_size);
                if let Err(err) = multipart.write(&part).await {
                    if let Some(multipart) = self.multipart.take() {
                        abort_upload(multipart, &self.object_key).await;
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Seals the file and makes its content durable in the store.
    pub async fn close(mut self) -> Result<FileRef> {
        self.lock.ensure_held()?;
        let block = self.block.take().ok_or(DirectoryError::Closed("output"))?;
        let data = block.seal();
        let token = match self.multipart.take() {
            Some(mut multipart) => {
                if let Err(err) = multipart.write(&data).await {
                    abort_upload(multipart, &self.object_key).await;
                    return Err(err.into());
                }
                // aborts the upload itself on failure
                multipart.finish().await?
            }
            None => {
                let token = self
                    .shared
                    .storage
                    .put(&self.object_key, data.clone(), PutCondition::Create)
                    .await?;
                self.shared
                    .cache
                    .insert(&self.object_key, token.clone(), data);
                token
            }
        };
        let file = FileRef {
            object_key: self.object_key.clone(),
            size: self.written,
            sha256: self.checksum(),
            token,
        };

        self.pending.lock().insert(file.object_key.clone());
        let replaced = {
            let mut state = self.writer.lock();
            state.open_outputs.remove(&self.name);
            let replaced = state.files.insert(self.name.clone(), file.clone());
            replaced.filter(|replaced| state.deletable(&replaced.object_key))
        };
        self.finished = true;
        self.shared.metrics.open_outputs.add(-1, &[]);
        debug!(name = self.name, size = file.size, "sealed output");

        if let Some(replaced) = replaced {
            if self.pending.lock().remove(&replaced.object_key) {
                self.shared.storage.delete(&replaced.object_key).await?;
            }
        }
        Ok(file)
    }

    /// Discards the output without publishing anything.
    pub async fn abort(mut self) -> Result<()> {
        self.block.take();
        if let Some(multipart) = self.multipart.take() {
            abort_upload(multipart, &self.object_key).await;
        }
        self.finish_unsealed();
        Ok(())
    }

    fn finish_unsealed(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.writer.lock().open_outputs.remove(&self.name);
        self.shared.metrics.open_outputs.add(-1, &[]);
    }
}

async fn abort_upload(multipart: MultipartWriter, object_key: &str) {
    if let Err(err) = multipart.abort().await {
        warn!(object_key, error = %err, "failed to abort multipart upload");
    }
}

impl Drop for IndexOutput {
    fn drop(&mut self) {
        if !self.finished {
            debug!(name = self.name, "output dropped without close");
            self.finish_unsealed();
        }
    }
}

/// Read view over one file's content.
///
/// Clones and slices share the underlying buffer; each keeps its own
/// position.
#[derive(Debug, Clone)]
pub struct IndexInput {
    name: Arc<str>,
    data: Bytes,
    position: usize,
}

impl IndexInput {
    pub fn new(name: &str, data: Bytes) -> Self {
        Self {
            name: Arc::from(name),
            data,
            position: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> u64 {
        self.position as u64
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Reads `len` bytes at `offset` without moving the position.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let range = self.range(offset, len as u64)?;
        Ok(self.data.slice(range))
    }

    /// A new input over `len` bytes starting at `offset`.
    pub fn slice(&self, offset: u64, len: u64) -> Result<IndexInput> {
        let range = self.range(offset, len)?;
        Ok(IndexInput {
            name: self.name.clone(),
            data: self.data.slice(range),
            position: 0,
        })
    }

    fn range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(offset as usize..end as usize),
            _ => Err(DirectoryError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "read past end of {}: offset {} len {} file length {}",
                    self.name,
                    offset,
                    len,
                    self.len()
                ),
            ))),
        }
    }
}

impl Read for IndexInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.position.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

impl Seek for IndexInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset as i128),
            SeekFrom::End(delta) => Some(self.data.len() as i128 + delta as i128),
            SeekFrom::Current(delta) => Some(self.position as i128 + delta as i128),
        };
        match target {
            Some(target) if target >= 0 && target <= self.data.len() as i128 => {
                self.position = target as usize;
                Ok(target as u64)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek outside of {}", self.name),
            )),
        }
    }
}
