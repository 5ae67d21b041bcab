//! Single-writer lease on a sentinel object.
//!
//! The lease lives in `write.lock` as a small JSON record. Every transition
//! is a conditional write: acquiring an absent sentinel is a create, taking
//! over an expired or released lease, renewing and releasing are updates
//! matching the version the writer last saw. Whoever loses a conditional
//! write does not own the lease.
//!
//! A holder that cannot renew, or whose deadline passed locally, moves to
//! [`LeaseState::Lost`] and every later check fails with
//! [`DirectoryError::LeaseLost`].

use std::{sync::Arc, time::Duration};

use blob_store::{BlobStorage, PutCondition, VersionToken};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::LockConfig,
    error::{DirectoryError, Result},
    naming::LOCK_KEY,
    utils::Clock,
};

/// Content of the sentinel object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub lease_id: String,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(default)]
    pub released: bool,
}

impl LeaseRecord {
    pub fn is_active(&self, now_ms: u64) -> bool {
        !self.released && now_ms < self.expires_at_ms
    }

    fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| DirectoryError::corrupt(LOCK_KEY, e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| DirectoryError::corrupt(LOCK_KEY, e.to_string()))
    }
}

/// Exclusive write ownership as seen by its holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub holder: String,
    pub lease_id: String,
    pub acquired_at_ms: u64,
    pub deadline_ms: u64,
    pub token: VersionToken,
}

#[derive(Debug, Clone, PartialEq, Eq, strum::AsRefStr)]
pub enum LeaseState {
    Unheld,
    Held(LockLease),
    Lost { reason: String },
}

/// Sentinel content as read by an observer.
#[derive(Debug, Clone)]
pub struct LockStatus {
    pub record: LeaseRecord,
    pub token: VersionToken,
    pub active: bool,
}

pub struct DistributedLock {
    storage: BlobStorage,
    holder: String,
    lease_duration: Duration,
    safety_margin: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<LeaseState>,
    metrics: Arc<metrics::directory::Metrics>,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("holder", &self.holder)
            .field("state", &self.state.lock().as_ref())
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    pub fn new(
        storage: BlobStorage,
        holder: impl Into<String>,
        config: &LockConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<metrics::directory::Metrics>,
    ) -> Self {
        Self {
            storage,
            holder: holder.into(),
            lease_duration: config.lease_duration,
            safety_margin: config.safety_margin,
            clock,
            state: Mutex::new(LeaseState::Unheld),
            metrics,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn state(&self) -> LeaseState {
        self.state.lock().clone()
    }

    /// Reads the sentinel without changing it.
    pub async fn inspect(storage: &BlobStorage, clock: &dyn Clock) -> Result<Option<LockStatus>> {
        let Some((record, token)) = read_lease(storage).await? else {
            return Ok(None);
        };
        let active = record.is_active(clock.now_ms());
        Ok(Some(LockStatus {
            record,
            token,
            active,
        }))
    }

    /// Deletes the sentinel whatever its state. Operator recovery only: a
    /// live holder will fail its next renewal.
    pub async fn break_lock(storage: &BlobStorage) -> Result<bool> {
        let existed = read_lease(storage).await?.is_some();
        storage.delete(LOCK_KEY).await?;
        warn!(existed, "write lock broken");
        Ok(existed)
    }

    /// One acquisition attempt. Fails with [`DirectoryError::LockHeld`] while
    /// another holder's lease is valid. A holder whose own lease is inside the
    /// safety margin gets it extended.
    pub async fn acquire(&self) -> Result<LockLease> {
        let held = match &*self.state.lock() {
            LeaseState::Held(lease) => Some(lease.clone()),
            _ => None,
        };
        if let Some(lease) = held {
            let now = self.clock.now_ms();
            if now + (self.safety_margin.as_millis() as u64) < lease.deadline_ms {
                return Ok(lease);
            }
            if now < lease.deadline_ms {
                if let Some((record, _)) = read_lease(&self.storage).await? {
                    if record.lease_id == lease.lease_id && !record.released {
                        return self.extend(lease).await;
                    }
                }
            }
        }

        let now = self.clock.now_ms();
        let record = LeaseRecord {
            holder: self.holder.clone(),
            lease_id: nanoid::nanoid!(),
            acquired_at_ms: now,
            expires_at_ms: now + self.lease_duration.as_millis() as u64,
            released: false,
        };
        let body = record.encode()?;

        let written = match read_lease(&self.storage).await? {
            None => self.storage.put(LOCK_KEY, body, PutCondition::Create).await,
            Some((existing, _)) if existing.is_active(now) => {
                self.metrics.lock_contention.add(1, &[]);
                return Err(DirectoryError::LockHeld {
                    holder: existing.holder,
                    expires_at_ms: existing.expires_at_ms,
                });
            }
            Some((existing, token)) => {
                info!(
                    previous_holder = existing.holder,
                    released = existing.released,
                    "taking over expired write lease"
                );
                self.replace(&token, body).await
            }
        };

        let token = match written {
            Ok(token) => token,
            Err(err) if err.is_conflict() => {
                // another writer won the conditional write
                self.metrics.lock_contention.add(1, &[]);
                let current = read_lease(&self.storage).await?;
                return Err(match current {
                    Some((record, _)) => DirectoryError::LockHeld {
                        holder: record.holder,
                        expires_at_ms: record.expires_at_ms,
                    },
                    None => DirectoryError::LockHeld {
                        holder: "unknown".to_string(),
                        expires_at_ms: now,
                    },
                });
            }
            Err(err) => return Err(err.into()),
        };

        let lease = LockLease {
            holder: record.holder,
            lease_id: record.lease_id,
            acquired_at_ms: record.acquired_at_ms,
            deadline_ms: record.expires_at_ms,
            token,
        };
        *self.state.lock() = LeaseState::Held(lease.clone());
        self.metrics.lock_acquisitions.add(1, &[]);
        info!(
            holder = lease.holder,
            lease_id = lease.lease_id,
            deadline_ms = lease.deadline_ms,
            "acquired write lease"
        );
        Ok(lease)
    }

    /// Polls [`Self::acquire`] until it succeeds or `timeout` elapses.
    pub async fn acquire_with_timeout(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<LockLease> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.acquire().await {
                Err(DirectoryError::LockHeld {
                    holder,
                    expires_at_ms,
                }) => {
                    if tokio::time::Instant::now() + poll_interval > deadline {
                        return Err(DirectoryError::LockHeld {
                            holder,
                            expires_at_ms,
                        });
                    }
                    debug!(holder, expires_at_ms, "write lock busy, waiting");
                    tokio::time::sleep(poll_interval).await;
                }
                other => return other,
            }
        }
    }

    /// Extends the deadline. Any failure means the holder can no longer
    /// assume exclusivity.
    pub async fn renew(&self) -> Result<LockLease> {
        let lease = self.ensure_held()?;
        self.extend(lease).await
    }

    async fn extend(&self, lease: LockLease) -> Result<LockLease> {
        let now = self.clock.now_ms();
        let record = LeaseRecord {
            holder: lease.holder.clone(),
            lease_id: lease.lease_id.clone(),
            acquired_at_ms: lease.acquired_at_ms,
            expires_at_ms: now + self.lease_duration.as_millis() as u64,
            released: false,
        };
        let body = record.encode()?;
        match self.replace(&lease.token, body).await {
            Ok(token) => {
                let renewed = LockLease {
                    deadline_ms: record.expires_at_ms,
                    token,
                    ..lease
                };
                let mut state = self.state.lock();
                // a concurrent release or loss wins over a late renewal
                if matches!(&*state, LeaseState::Held(current) if current.lease_id == renewed.lease_id)
                {
                    *state = LeaseState::Held(renewed.clone());
                }
                debug!(deadline_ms = renewed.deadline_ms, "renewed write lease");
                Ok(renewed)
            }
            Err(err) => Err(self.mark_lost(format!("renewal failed: {}", err))),
        }
    }

    /// Renews when less than half of the lease remains.
    pub async fn renew_if_needed(&self) -> Result<LockLease> {
        let lease = self.ensure_held()?;
        let remaining = lease.deadline_ms.saturating_sub(self.clock.now_ms());
        if remaining < self.lease_duration.as_millis() as u64 / 2 {
            return self.renew().await;
        }
        Ok(lease)
    }

    /// Returns the lease if it is still safe to act on it.
    pub fn ensure_held(&self) -> Result<LockLease> {
        let state = self.state.lock().clone();
        match state {
            LeaseState::Held(lease) => {
                let now = self.clock.now_ms();
                if now + (self.safety_margin.as_millis() as u64) >= lease.deadline_ms {
                    return Err(self.mark_lost("lease deadline passed".to_string()));
                }
                Ok(lease)
            }
            LeaseState::Lost { reason } => Err(DirectoryError::LeaseLost(reason)),
            LeaseState::Unheld => Err(DirectoryError::LeaseLost("lease not held".to_string())),
        }
    }

    /// Gives the lease up so the next writer does not have to wait for it to
    /// expire. Best effort: a failed release just leaves the lease to expire.
    pub async fn release(&self) -> Result<()> {
        let state = std::mem::replace(&mut *self.state.lock(), LeaseState::Unheld);
        let LeaseState::Held(lease) = state else {
            return Ok(());
        };
        let record = LeaseRecord {
            holder: lease.holder.clone(),
            lease_id: lease.lease_id.clone(),
            acquired_at_ms: lease.acquired_at_ms,
            expires_at_ms: self.clock.now_ms(),
            released: true,
        };
        match self.replace(&lease.token, record.encode()?).await {
            Ok(_) => info!(lease_id = lease.lease_id, "released write lease"),
            Err(err) => warn!(
                lease_id = lease.lease_id,
                error = %err,
                "failed to release write lease, it will expire"
            ),
        }
        Ok(())
    }

    fn mark_lost(&self, reason: String) -> DirectoryError {
        let mut state = self.state.lock();
        if matches!(&*state, LeaseState::Held(_)) {
            error!(holder = self.holder, reason, "write lease lost");
            self.metrics.leases_lost.add(1, &[]);
            *state = LeaseState::Lost {
                reason: reason.clone(),
            };
        }
        match &*state {
            LeaseState::Lost { reason } => DirectoryError::LeaseLost(reason.clone()),
            _ => DirectoryError::LeaseLost(reason),
        }
    }

    /// Conditional replace of the sentinel. Stores without compare-and-swap
    /// updates (local filesystem) get a version check followed by delete and
    /// create, which still loses against a concurrent create.
    async fn replace(
        &self,
        token: &VersionToken,
        body: Bytes,
    ) -> std::result::Result<VersionToken, blob_store::BlobError> {
        match self
            .storage
            .put(LOCK_KEY, body.clone(), PutCondition::Match(token.clone()))
            .await
        {
            Err(err) if err.is_unsupported() => {
                let current = self.storage.head(LOCK_KEY).await?;
                if !current.token.matches(token) {
                    return Err(blob_store::BlobError::Conflict {
                        key: LOCK_KEY.to_string(),
                    });
                }
                self.storage.delete(LOCK_KEY).await?;
                self.storage.put(LOCK_KEY, body, PutCondition::Create).await
            }
            other => other,
        }
    }
}

async fn read_lease(storage: &BlobStorage) -> Result<Option<(LeaseRecord, VersionToken)>> {
    match storage.get(LOCK_KEY, None).await {
        Ok((bytes, token)) => match LeaseRecord::decode(&bytes) {
            Ok(record) => Ok(Some((record, token))),
            Err(err) => {
                // unreadable sentinel: treat as expired so the index is not locked forever
                warn!(error = %err, "ignoring unreadable write lock");
                Ok(Some((
                    LeaseRecord {
                        holder: "unknown".to_string(),
                        lease_id: String::new(),
                        acquired_at_ms: 0,
                        expires_at_ms: 0,
                        released: false,
                    },
                    token,
                )))
            }
        },
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Background renewal owned by an active writer. Stops on the first failed
/// renewal, leaving the lock in [`LeaseState::Lost`].
pub struct LeaseKeeper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    pub fn spawn(lock: Arc<DistributedLock>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = lock.renew().await {
                            error!(error = %err, "stopping lease renewal");
                            return;
                        }
                    }
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
