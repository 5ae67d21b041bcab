use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use blob_store::{BlobStorage, BlobStorageConfig, RetryPolicy};
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use object_store::{
    memory::InMemory,
    path::Path,
    GetOptions,
    GetResult,
    ListResult,
    MultipartUpload,
    ObjectMeta,
    ObjectStore,
    PutMultipartOpts,
    PutOptions,
    PutPayload,
    PutResult,
    UploadPart,
};
use parking_lot::Mutex;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{config::DirectoryConfig, directory::BlobDirectory, utils::ManualClock};

pub fn test_config() -> DirectoryConfig {
    DirectoryConfig {
        blob_storage: BlobStorageConfig::in_memory(),
        holder_id: Some("test-process".to_string()),
        ..Default::default()
    }
}

/// Retries that do not slow tests down.
pub fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        initial_delay_ms: 1,
        max_delay_ms: 2,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer().with_filter(env_filter)),
    );
}

/// A directory over a private in-memory store, with a clock that starts at
/// the current wall time and only moves when advanced.
pub struct TestDirectory {
    pub directory: BlobDirectory,
    pub storage: BlobStorage,
    pub clock: ManualClock,
    _temp_dir: Option<tempfile::TempDir>,
}

impl TestDirectory {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: DirectoryConfig) -> Self {
        Self::build(BlobStorage::in_memory(), config, None)
    }

    /// Same, over a store whose failures the test controls.
    pub fn with_flaky_store(config: DirectoryConfig) -> (Self, FlakyStore) {
        let store = FlakyStore::new();
        let storage = store.storage(fast_retries());
        (Self::build(storage, config, None), store)
    }

    /// Same, over a local filesystem store in a temporary directory.
    pub fn on_local_filesystem() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let storage_config = BlobStorageConfig::new(&temp_dir.path().to_string_lossy());
        let config = DirectoryConfig {
            blob_storage: storage_config.clone(),
            ..test_config()
        };
        let storage = BlobStorage::new(storage_config)?;
        Ok(Self::build(storage, config, Some(temp_dir)))
    }

    fn build(storage: BlobStorage, config: DirectoryConfig, temp_dir: Option<tempfile::TempDir>) -> Self {
        init_tracing();
        let clock = ManualClock::default();
        let directory = BlobDirectory::with_storage(storage.clone(), config, Arc::new(clock.clone()));
        Self {
            directory,
            storage,
            clock,
            _temp_dir: temp_dir,
        }
    }

    /// A second handle on the same store, as another process would open it:
    /// separate cache, same clock.
    pub fn reopen(&self) -> BlobDirectory {
        BlobDirectory::with_storage(
            self.storage.clone(),
            self.directory.config().clone(),
            Arc::new(self.clock.clone()),
        )
    }
}

/// Given the location of a put about to happen, optionally returns another
/// object to write straight into the wrapped store.
pub type PutHook = Box<dyn FnMut(&Path) -> Option<(Path, Bytes)> + Send>;

#[derive(Default)]
struct Faults {
    fail_next: usize,
    unavailable: bool,
    fail_parts: bool,
    put_delay: Option<(String, Duration)>,
    before_put: Option<PutHook>,
    after_put: Option<PutHook>,
    failed_calls: usize,
    aborted_uploads: usize,
    last_get: Option<GetOptions>,
}

/// In-memory store that fails, stalls or races puts on request.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: Arc<InMemory>,
    faults: Arc<Mutex<Faults>>,
}

impl fmt::Debug for FlakyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlakyStore").finish_non_exhaustive()
    }
}

impl fmt::Display for FlakyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlakyStore({})", self.inner)
    }
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(&self, retry: RetryPolicy) -> BlobStorage {
        BlobStorage::from_object_store(Arc::new(self.clone()), Path::default(), retry)
    }

    /// The next `calls` store calls fail with a transient error.
    pub fn fail_next(&self, calls: usize) {
        self.faults.lock().fail_next = calls;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Multipart parts fail to upload.
    pub fn fail_parts(&self, fail: bool) {
        self.faults.lock().fail_parts = fail;
    }

    /// Puts under `prefix` wait `delay` before reaching the store.
    pub fn delay_puts(&self, prefix: &str, delay: Duration) {
        self.faults.lock().put_delay = Some((prefix.to_string(), delay));
    }

    pub fn before_put(&self, hook: impl FnMut(&Path) -> Option<(Path, Bytes)> + Send + 'static) {
        self.faults.lock().before_put = Some(Box::new(hook));
    }

    pub fn after_put(&self, hook: impl FnMut(&Path) -> Option<(Path, Bytes)> + Send + 'static) {
        self.faults.lock().after_put = Some(Box::new(hook));
    }

    pub fn failed_calls(&self) -> usize {
        self.faults.lock().failed_calls
    }

    pub fn aborted_uploads(&self) -> usize {
        self.faults.lock().aborted_uploads
    }

    pub fn last_get(&self) -> Option<GetOptions> {
        self.faults.lock().last_get.clone()
    }

    fn check(&self, location: &Path) -> object_store::Result<()> {
        let mut faults = self.faults.lock();
        if !faults.unavailable && faults.fail_next == 0 {
            return Ok(());
        }
        faults.fail_next = faults.fail_next.saturating_sub(1);
        faults.failed_calls += 1;
        Err(object_store::Error::Generic {
            store: "flaky",
            source: format!("injected failure on {}", location).into(),
        })
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.check(location)?;
        let (delay, competing) = {
            let mut faults = self.faults.lock();
            let delay = faults
                .put_delay
                .as_ref()
                .filter(|(prefix, _)| location.as_ref().starts_with(prefix.as_str()))
                .map(|(_, delay)| *delay);
            let competing = faults.before_put.as_mut().and_then(|hook| hook(location));
            (delay, competing)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((path, bytes)) = competing {
            self.inner.put(&path, bytes.into()).await?;
        }
        let result = self.inner.put_opts(location, payload, opts).await?;
        let competing = self
            .faults
            .lock()
            .after_put
            .as_mut()
            .and_then(|hook| hook(location));
        if let Some((path, bytes)) = competing {
            self.inner.put(&path, bytes.into()).await?;
        }
        Ok(result)
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.check(location)?;
        let inner = self.inner.put_multipart_opts(location, opts).await?;
        Ok(Box::new(FlakyUpload {
            inner,
            faults: self.faults.clone(),
        }))
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> object_store::Result<GetResult> {
        self.check(location)?;
        self.faults.lock().last_get = Some(options.clone());
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.check(location)?;
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        let root = Path::default();
        if let Err(err) = self.check(prefix.unwrap_or(&root)) {
            return futures::stream::once(async move { Err(err) }).boxed();
        }
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        let root = Path::default();
        self.check(prefix.unwrap_or(&root))?;
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.check(to)?;
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.check(to)?;
        self.inner.copy_if_not_exists(from, to).await
    }
}

struct FlakyUpload {
    inner: Box<dyn MultipartUpload>,
    faults: Arc<Mutex<Faults>>,
}

impl fmt::Debug for FlakyUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlakyUpload")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MultipartUpload for FlakyUpload {
    fn put_part(&mut self, data: PutPayload) -> UploadPart {
        if self.faults.lock().fail_parts {
            return Box::pin(async {
                Err(object_store::Error::Generic {
                    store: "flaky",
                    source: "injected part failure".into(),
                })
            });
        }
        self.inner.put_part(data)
    }

    async fn complete(&mut self) -> object_store::Result<PutResult> {
        self.inner.complete().await
    }

    async fn abort(&mut self) -> object_store::Result<()> {
        self.faults.lock().aborted_uploads += 1;
        self.inner.abort().await
    }
}
