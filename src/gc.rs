use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};

use blob_store::BlobStorage;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DirectoryError, Result},
    lock::DistributedLock,
    manifest::{Manifest, ManifestListing, ManifestStore},
    naming::{parse_data_key, DATA_PREFIX},
    utils::Clock,
};

/// Object keys a writer uploaded but has not published yet.
pub type ProtectedKeys = Arc<Mutex<HashSet<String>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub retained_generations: Vec<u64>,
    pub deleted_manifests: Vec<String>,
    pub deleted_objects: Vec<String>,
    /// Unreferenced objects kept because they are protected or too young.
    pub deferred_objects: usize,
    pub dry_run: bool,
}

/// Mark and sweep over manifests and data objects. Keeps no state between
/// runs: everything it needs is listed from the store.
pub struct GarbageCollector {
    storage: BlobStorage,
    manifests: ManifestStore,
    lock: Arc<DistributedLock>,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
    dry_run: bool,
    metrics: Arc<metrics::directory::Metrics>,
}

impl GarbageCollector {
    pub fn new(
        storage: BlobStorage,
        lock: Arc<DistributedLock>,
        clock: Arc<dyn Clock>,
        grace_period: Duration,
        metrics: Arc<metrics::directory::Metrics>,
    ) -> Self {
        Self {
            manifests: ManifestStore::new(storage.clone(), metrics.clone()),
            storage,
            lock,
            clock,
            grace_period,
            dry_run: false,
            metrics,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run_once(&self, protected: &HashSet<String>) -> Result<GcReport> {
        self.lock.ensure_held()?;
        let now = self.clock.now_ms();
        let grace = self.grace_period.as_millis() as u64;
        let expired = |last_modified_ms: u64| now >= last_modified_ms.saturating_add(grace);
        let mut report = GcReport {
            dry_run: self.dry_run,
            ..Default::default()
        };

        let mut valid: Vec<(ManifestListing, Manifest)> = Vec::new();
        let mut corrupt: Vec<ManifestListing> = Vec::new();
        for listing in self.manifests.list().await? {
            match self.manifests.load(listing.generation).await {
                Ok(manifest) => valid.push((listing, manifest)),
                Err(DirectoryError::NotFound(_)) => {}
                Err(DirectoryError::Corrupt { reason, .. }) => {
                    debug!(key = listing.key, reason, "found corrupt manifest");
                    corrupt.push(listing);
                }
                Err(err) => return Err(err),
            }
        }

        // A generation stays readable until its successor is older than the
        // grace period. The latest valid generation is always kept.
        let mut referenced: HashSet<String> = HashSet::new();
        let mut doomed_manifests: BTreeSet<String> = BTreeSet::new();
        for (i, (listing, manifest)) in valid.iter().enumerate() {
            let keep = match valid.get(i + 1) {
                None => true,
                Some((successor, _)) => !expired(successor.last_modified_ms),
            };
            if keep {
                report.retained_generations.push(manifest.generation);
                referenced.extend(manifest.object_keys().map(str::to_string));
            } else {
                doomed_manifests.insert(listing.key.clone());
            }
        }
        doomed_manifests.extend(
            corrupt
                .iter()
                .filter(|listing| expired(listing.last_modified_ms))
                .map(|listing| listing.key.clone()),
        );

        // manifests first, so no listed manifest ever points at a deleted object
        self.lock.ensure_held()?;
        for key in doomed_manifests {
            self.delete(&key, "manifest").await?;
            report.deleted_manifests.push(key);
        }

        self.lock.ensure_held()?;
        for object in self.storage.list(DATA_PREFIX).await? {
            if parse_data_key(&object.key).is_none() || referenced.contains(&object.key) {
                continue;
            }
            if protected.contains(&object.key) || !expired(object.last_modified_ms) {
                report.deferred_objects += 1;
                continue;
            }
            self.delete(&object.key, "data").await?;
            report.deleted_objects.push(object.key);
        }

        info!(
            retained = ?report.retained_generations,
            deleted_manifests = report.deleted_manifests.len(),
            deleted_objects = report.deleted_objects.len(),
            deferred_objects = report.deferred_objects,
            dry_run = self.dry_run,
            "garbage collection finished"
        );
        Ok(report)
    }

    async fn delete(&self, key: &str, kind: &'static str) -> Result<()> {
        if self.dry_run {
            debug!(key, "would delete");
            return Ok(());
        }
        debug!(key, "deleting");
        self.storage.delete(key).await?;
        self.metrics
            .gc_deleted_objects
            .add(1, &[KeyValue::new("kind", kind)]);
        Ok(())
    }

    /// Runs after every commit notification and at least every `interval`
    /// until shutdown, or until the lease is lost.
    pub async fn start(
        &self,
        mut committed_rx: watch::Receiver<u64>,
        mut shutdown_rx: watch::Receiver<()>,
        interval: Duration,
        protected: ProtectedKeys,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("garbage collector shutting down");
                    return;
                }
                changed = committed_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    committed_rx.borrow_and_update();
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let protected = protected.lock().clone();
            match self.run_once(&protected).await {
                Ok(_) => {}
                Err(err) if err.is_lease_lost() => {
                    warn!(error = %err, "stopping garbage collector");
                    return;
                }
                Err(err) => error!(error = %err, "garbage collection failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use blob_store::PutCondition;
    use bytes::Bytes;

    use super::*;
    use crate::{
        config::LockConfig,
        manifest::{sha256_hex, FileRef},
        naming::{data_key, manifest_key},
        utils::{get_epoch_time_in_ms, ManualClock},
    };

    const GRACE: Duration = Duration::from_secs(600);

    struct Fixture {
        storage: BlobStorage,
        clock: ManualClock,
        lock: Arc<DistributedLock>,
        metrics: Arc<metrics::directory::Metrics>,
    }

    impl Fixture {
        async fn new() -> Result<Self> {
            let storage = BlobStorage::in_memory();
            // object timestamps come from the wall clock
            let clock = ManualClock::new(get_epoch_time_in_ms());
            let metrics = Arc::new(metrics::directory::Metrics::new());
            let config = LockConfig {
                lease_duration: Duration::from_secs(3600),
                ..Default::default()
            };
            let lock = Arc::new(DistributedLock::new(
                storage.clone(),
                "writer-a",
                &config,
                Arc::new(clock.clone()),
                metrics.clone(),
            ));
            lock.acquire().await?;
            Ok(Self {
                storage,
                clock,
                lock,
                metrics,
            })
        }

        fn collector(&self) -> GarbageCollector {
            GarbageCollector::new(
                self.storage.clone(),
                self.lock.clone(),
                Arc::new(self.clock.clone()),
                GRACE,
                self.metrics.clone(),
            )
        }

        async fn upload(&self, name: &str, generation: u64) -> Result<(String, FileRef)> {
            let key = data_key(name, generation, "lease");
            let token = self
                .storage
                .put(&key, Bytes::from_static(b"data"), PutCondition::Create)
                .await?;
            Ok((
                name.to_string(),
                FileRef {
                    object_key: key,
                    size: 4,
                    sha256: sha256_hex(b"data"),
                    token,
                },
            ))
        }

        async fn publish(&self, generation: u64, files: Vec<(String, FileRef)>) -> Result<()> {
            let manifest = Manifest {
                generation,
                files: files.into_iter().collect(),
                ..Manifest::empty()
            };
            ManifestStore::new(self.storage.clone(), self.metrics.clone())
                .publish(&manifest)
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sweeps_superseded_objects_after_grace_period() -> Result<()> {
        let f = Fixture::new().await?;
        let a1 = f.upload("a", 1).await?;
        let b1 = f.upload("b", 1).await?;
        f.publish(1, vec![a1.clone(), b1.clone()]).await?;
        let a2 = f.upload("a", 2).await?;
        f.publish(2, vec![a2.clone(), b1.clone()]).await?;
        let (_, orphan) = f.upload("c", 2).await?;
        let (_, pending) = f.upload("d", 3).await?;
        let protected: HashSet<String> = [pending.object_key.clone()].into();

        let report = f.collector().run_once(&protected).await?;
        assert_eq!(report.retained_generations, vec![1, 2]);
        assert!(report.deleted_manifests.is_empty());
        assert!(report.deleted_objects.is_empty());
        assert_eq!(report.deferred_objects, 2);

        f.clock.advance(GRACE + Duration::from_secs(1));
        let report = f.collector().run_once(&protected).await?;
        assert_eq!(report.retained_generations, vec![2]);
        assert_eq!(report.deleted_manifests, vec![manifest_key(1)]);
        let mut deleted = report.deleted_objects.clone();
        deleted.sort();
        let mut expected = vec![a1.1.object_key.clone(), orphan.object_key.clone()];
        expected.sort();
        assert_eq!(deleted, expected);

        let remaining: Vec<String> = f
            .storage
            .list(DATA_PREFIX)
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert!(remaining.contains(&a2.1.object_key));
        assert!(remaining.contains(&b1.1.object_key));
        assert!(remaining.contains(&pending.object_key));
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() -> Result<()> {
        let f = Fixture::new().await?;
        let a1 = f.upload("a", 1).await?;
        f.publish(1, vec![a1.clone()]).await?;
        let a2 = f.upload("a", 2).await?;
        f.publish(2, vec![a2]).await?;
        f.clock.advance(GRACE * 2);

        let report = f
            .collector()
            .with_dry_run(true)
            .run_once(&HashSet::new())
            .await?;
        assert!(report.dry_run);
        assert_eq!(report.deleted_objects, vec![a1.1.object_key.clone()]);
        assert!(f.storage.head(&a1.1.object_key).await.is_ok());
        assert!(f.storage.head(&manifest_key(1)).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_manifests_are_removed_but_never_trusted() -> Result<()> {
        let f = Fixture::new().await?;
        let a1 = f.upload("a", 1).await?;
        f.publish(1, vec![a1.clone()]).await?;
        f.storage
            .put(
                &manifest_key(2),
                Bytes::from_static(b"{\"truncated"),
                PutCondition::Create,
            )
            .await?;

        let report = f.collector().run_once(&HashSet::new()).await?;
        assert!(report.deleted_manifests.is_empty());

        f.clock.advance(GRACE * 2);
        let report = f.collector().run_once(&HashSet::new()).await?;
        assert_eq!(report.retained_generations, vec![1]);
        assert_eq!(report.deleted_manifests, vec![manifest_key(2)]);
        assert!(report.deleted_objects.is_empty());
        assert!(f.storage.head(&a1.1.object_key).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_requires_lease() -> Result<()> {
        let f = Fixture::new().await?;
        f.lock.release().await?;
        let err = f.collector().run_once(&HashSet::new()).await.unwrap_err();
        assert!(err.is_lease_lost());
        Ok(())
    }

    #[tokio::test]
    async fn test_background_loop_runs_on_commit() -> Result<()> {
        let f = Fixture::new().await?;
        let a1 = f.upload("a", 1).await?;
        f.publish(1, vec![a1.clone()]).await?;
        let a2 = f.upload("a", 2).await?;
        f.publish(2, vec![a2]).await?;
        f.clock.advance(GRACE * 2);

        let (committed_tx, committed_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let collector = f.collector();
        let handle = tokio::spawn(async move {
            collector
                .start(
                    committed_rx,
                    shutdown_rx,
                    Duration::from_secs(3600),
                    ProtectedKeys::default(),
                )
                .await
        });
        committed_tx.send_replace(2);

        let deleted = tokio::time::timeout(Duration::from_secs(5), async {
            while f.storage.head(&a1.1.object_key).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(deleted.is_ok());

        shutdown_tx.send_replace(());
        handle.await.unwrap();
        Ok(())
    }
}
