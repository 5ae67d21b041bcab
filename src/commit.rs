//! Publishing generations.
//!
//! Data objects are uploaded before a commit starts, under keys no other
//! writer can produce. A commit only adds the manifest for the next
//! generation with a create-only put. Losing that race, or finding a newer
//! valid generation right after publishing, retries with a fresh generation
//! number. Superseded objects are left to the collector, which is
//! notified through a watch channel.

use std::{collections::BTreeMap, sync::Arc};

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    error::{DirectoryError, Result},
    lock::DistributedLock,
    manifest::{FileRef, Manifest, ManifestStore},
    utils::Clock,
};

pub struct CommitCoordinator {
    manifests: ManifestStore,
    lock: Arc<DistributedLock>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    committed_tx: watch::Sender<u64>,
    metrics: Arc<metrics::directory::Metrics>,
}

impl CommitCoordinator {
    pub fn new(
        manifests: ManifestStore,
        lock: Arc<DistributedLock>,
        clock: Arc<dyn Clock>,
        max_retries: u32,
        committed_tx: watch::Sender<u64>,
        metrics: Arc<metrics::directory::Metrics>,
    ) -> Self {
        Self {
            manifests,
            lock,
            clock,
            max_retries,
            committed_tx,
            metrics,
        }
    }

    /// Publishes `files` as the generation following `base_generation`.
    ///
    /// Every referenced object must already be durable. On error nothing was
    /// published and the previous generation stays current.
    pub async fn commit(
        &self,
        base_generation: u64,
        files: BTreeMap<String, FileRef>,
    ) -> Result<Manifest> {
        let metrics = self.metrics.clone();
        metrics::create_timed_future(self.publish(base_generation, files), move |elapsed| {
            metrics.commit_latency.record(elapsed.as_secs_f64(), &[]);
        })
        .await
    }

    async fn publish(
        &self,
        base_generation: u64,
        files: BTreeMap<String, FileRef>,
    ) -> Result<Manifest> {
        let lease = self.lock.renew_if_needed().await?;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let listed = self
                .manifests
                .list()
                .await?
                .last()
                .map(|listing| listing.generation)
                .unwrap_or(0);
            if listed > base_generation {
                warn!(
                    base_generation,
                    listed, "store holds generations newer than the writer's base"
                );
            }
            let manifest = Manifest {
                generation: listed.max(base_generation) + 1,
                parent_generation: (base_generation > 0).then_some(base_generation),
                holder: lease.holder.clone(),
                lease_id: lease.lease_id.clone(),
                created_at_ms: self.clock.now_ms(),
                files: files.clone(),
                ..Manifest::empty()
            };

            // a lease that lapsed while listing must not publish
            self.lock.ensure_held()?;
            match self.manifests.publish(&manifest).await {
                Ok(_) => {
                    if let Some(newer) = self.newer_generation(manifest.generation).await? {
                        self.conflict(
                            attempts,
                            format!(
                                "generation {} was superseded by generation {}",
                                manifest.generation, newer
                            ),
                        )?;
                        continue;
                    }
                    self.metrics.commits.add(1, &[]);
                    info!(
                        generation = manifest.generation,
                        files = manifest.files.len(),
                        attempts,
                        "committed generation"
                    );
                    self.committed_tx.send_replace(manifest.generation);
                    return Ok(manifest);
                }
                Err(DirectoryError::Conflict(_)) => {
                    self.conflict(
                        attempts,
                        format!("generation {} was taken by another writer", manifest.generation),
                    )?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Highest valid generation above `generation`, if another writer got
    /// one in.
    async fn newer_generation(&self, generation: u64) -> Result<Option<u64>> {
        Ok(self
            .manifests
            .resolve_latest()
            .await?
            .map(|latest| latest.generation)
            .filter(|latest| *latest > generation))
    }

    /// Records a lost race. Fails once the retries are used up.
    fn conflict(&self, attempts: u32, reason: String) -> Result<()> {
        self.metrics
            .commit_conflicts
            .add(1, &[KeyValue::new("attempt", attempts as i64)]);
        if attempts > self.max_retries {
            return Err(DirectoryError::CommitFailed { attempts, reason });
        }
        warn!(attempts, reason, "lost a commit race, retrying with a fresh generation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blob_store::{BlobStorage, PutCondition, VersionToken};
    use bytes::Bytes;
    use object_store::path::Path;

    use super::*;
    use crate::{
        config::LockConfig,
        manifest::sha256_hex,
        naming::{manifest_key, MANIFEST_PREFIX},
        testing::{fast_retries, FlakyStore},
        utils::ManualClock,
    };

    fn is_manifest(location: &Path) -> bool {
        location.as_ref().starts_with(MANIFEST_PREFIX)
    }

    struct Fixture {
        storage: BlobStorage,
        clock: ManualClock,
        lock: Arc<DistributedLock>,
        coordinator: CommitCoordinator,
        committed_rx: watch::Receiver<u64>,
    }

    fn fixture(max_retries: u32) -> Fixture {
        fixture_with(BlobStorage::in_memory(), max_retries)
    }

    fn fixture_with(storage: BlobStorage, max_retries: u32) -> Fixture {
        let clock = ManualClock::new(1_000_000);
        let metrics = Arc::new(metrics::directory::Metrics::new());
        let lock = Arc::new(DistributedLock::new(
            storage.clone(),
            "writer-a",
            &LockConfig::default(),
            Arc::new(clock.clone()),
            metrics.clone(),
        ));
        let (committed_tx, committed_rx) = watch::channel(0);
        let coordinator = CommitCoordinator::new(
            ManifestStore::new(storage.clone(), metrics.clone()),
            lock.clone(),
            Arc::new(clock.clone()),
            max_retries,
            committed_tx,
            metrics,
        );
        Fixture {
            storage,
            clock,
            lock,
            coordinator,
            committed_rx,
        }
    }

    fn files(names: &[&str]) -> BTreeMap<String, FileRef> {
        names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    FileRef {
                        object_key: format!("data/{}/x", name),
                        size: 1,
                        sha256: sha256_hex(b"x"),
                        token: VersionToken::default(),
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_commit_requires_lease() {
        let f = fixture(3);
        let err = f.coordinator.commit(0, files(&["a"])).await.unwrap_err();
        assert!(err.is_lease_lost());
        assert!(f.storage.list("manifests").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commits_are_sequential() -> Result<()> {
        let mut f = fixture(3);
        f.lock.acquire().await?;

        let first = f.coordinator.commit(0, files(&["a", "b"])).await?;
        assert_eq!(first.generation, 1);
        assert_eq!(first.parent_generation, None);
        assert_eq!(*f.committed_rx.borrow_and_update(), 1);

        let second = f.coordinator.commit(1, files(&["a"])).await?;
        assert_eq!(second.generation, 2);
        assert_eq!(second.parent_generation, Some(1));
        assert!(f.committed_rx.has_changed().unwrap());
        Ok(())
    }

    #[tokio::test]
    async fn test_next_generation_skips_taken_ones() -> Result<()> {
        let f = fixture(3);
        f.lock.acquire().await?;
        // a generation that is not in the writer's base but already taken
        f.storage
            .put(&manifest_key(1), Bytes::from_static(b"zombie"), PutCondition::Create)
            .await?;

        let manifest = f.coordinator.commit(0, files(&["a"])).await?;
        assert_eq!(manifest.generation, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_after_lease_expiry_fails() -> Result<()> {
        let f = fixture(3);
        f.lock.acquire().await?;
        f.clock.advance(Duration::from_secs(120));
        let err = f.coordinator.commit(0, files(&["a"])).await.unwrap_err();
        assert!(err.is_lease_lost());
        assert!(f.storage.list("manifests").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_renews_late_lease() -> Result<()> {
        let f = fixture(3);
        let lease = f.lock.acquire().await?;
        f.clock.advance(Duration::from_secs(40));
        f.coordinator.commit(0, files(&["a"])).await?;
        assert!(f.lock.ensure_held()?.deadline_ms > lease.deadline_ms);
        Ok(())
    }

    #[tokio::test]
    async fn test_lost_races_retry_with_fresh_generation() -> Result<()> {
        let store = FlakyStore::new();
        let f = fixture_with(store.storage(fast_retries()), 3);
        f.lock.acquire().await?;

        // another writer lands each of the next two generations first
        let mut steals = 2;
        store.before_put(move |location| {
            if !is_manifest(location) || steals == 0 {
                return None;
            }
            steals -= 1;
            Some((location.clone(), Bytes::from_static(b"competing")))
        });

        let manifest = f.coordinator.commit(0, files(&["a"])).await?;
        assert_eq!(manifest.generation, 3);
        assert_eq!(f.storage.list("manifests").await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_fails_after_max_retries() -> Result<()> {
        let store = FlakyStore::new();
        let f = fixture_with(store.storage(fast_retries()), 2);
        f.lock.acquire().await?;
        store.before_put(|location| {
            is_manifest(location).then(|| (location.clone(), Bytes::from_static(b"competing")))
        });

        match f.coordinator.commit(0, files(&["a"])).await {
            Err(DirectoryError::CommitFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected CommitFailed, got {:?}", other),
        }
        // none of the stored manifests is ours
        for listing in f.storage.list("manifests").await? {
            let (bytes, _) = f.storage.get(&listing.key, None).await?;
            assert_eq!(bytes.as_ref(), b"competing");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_newer_generation_after_publish_is_a_conflict() -> Result<()> {
        let store = FlakyStore::new();
        let f = fixture_with(store.storage(fast_retries()), 3);
        f.lock.acquire().await?;

        let competing = Manifest {
            generation: 2,
            holder: "writer-b".to_string(),
            ..Manifest::empty()
        };
        let mut newer = Some((Path::from(manifest_key(2)), competing.encode()?));
        store.after_put(move |location| {
            if location.as_ref() == manifest_key(1) {
                newer.take()
            } else {
                None
            }
        });

        let manifest = f.coordinator.commit(0, files(&["a"])).await?;
        assert_eq!(manifest.generation, 3);
        Ok(())
    }
}
