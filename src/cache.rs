//! Local cache of index file content.
//!
//! Sealed files are kept as immutable [`Bytes`] keyed by object key and
//! guarded by the version token recorded when they were fetched or uploaded.
//! Outputs still being written live outside the LRU as pinned
//! [`WriteBlock`]s: they count against the byte budget but can never be
//! evicted.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use blob_store::VersionToken;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::{debug, trace};

struct CacheEntry {
    token: VersionToken,
    data: Bytes,
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    resident_bytes: u64,
    pinned_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub resident_bytes: u64,
    pub pinned_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct LocalCache {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    metrics: Arc<metrics::directory::Metrics>,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("max_bytes", &self.max_bytes)
            .field("stats", &self.stats())
            .finish()
    }
}

impl LocalCache {
    pub fn new(max_bytes: u64, metrics: Arc<metrics::directory::Metrics>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                resident_bytes: 0,
                pinned_bytes: 0,
            }),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            metrics,
        }
    }

    /// Returns the cached content of `object_key` if it was stored under a
    /// token matching `token`. A stale entry is dropped.
    pub fn get(&self, object_key: &str, token: &VersionToken) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let cached = inner
            .entries
            .get(object_key)
            .map(|entry| (token_valid(&entry.token, token), entry.data.clone()));
        match cached {
            Some((true, data)) => {
                drop(inner);
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.metrics.cache_hits.add(1, &[]);
                return Some(data);
            }
            Some((false, _)) => {
                if let Some(entry) = inner.entries.pop(object_key) {
                    inner.resident_bytes -= entry.data.len() as u64;
                }
                debug!(object_key, "evicting stale cache entry");
                self.record_eviction("stale");
            }
            None => {}
        }
        drop(inner);
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.cache_misses.add(1, &[]);
        None
    }

    /// True if a valid entry exists. Does not touch recency.
    pub fn contains(&self, object_key: &str, token: &VersionToken) -> bool {
        self.inner
            .lock()
            .entries
            .peek(object_key)
            .is_some_and(|entry| token_valid(&entry.token, token))
    }

    /// Caches sealed content. Content that cannot fit next to the pinned
    /// write blocks is not retained.
    pub fn insert(&self, object_key: &str, token: VersionToken, data: Bytes) {
        let size = data.len() as u64;
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(object_key) {
            inner.resident_bytes -= old.data.len() as u64;
        }
        if size + inner.pinned_bytes > self.max_bytes {
            trace!(object_key, size, "not caching entry larger than the free budget");
            return;
        }
        inner.resident_bytes += size;
        inner
            .entries
            .put(object_key.to_string(), CacheEntry { token, data });
        self.evict_to_budget(&mut inner, Some(object_key));
    }

    pub fn invalidate(&self, object_key: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.pop(object_key) {
            inner.resident_bytes -= entry.data.len() as u64;
        }
    }

    /// Drops every sealed entry; pinned write blocks are unaffected.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.resident_bytes = 0;
        dropped
    }

    /// Pins a new write buffer for an output being created.
    pub fn begin_write(self: &Arc<Self>, name: &str) -> WriteBlock {
        WriteBlock {
            cache: self.clone(),
            name: name.to_string(),
            buf: BytesMut::new(),
            pinned: 0,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            resident_bytes: inner.resident_bytes,
            pinned_bytes: inner.pinned_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn pin(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.pinned_bytes += bytes;
        self.evict_to_budget(&mut inner, None);
    }

    fn unpin(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.pinned_bytes = inner.pinned_bytes.saturating_sub(bytes);
    }

    fn evict_to_budget(&self, inner: &mut CacheInner, keep: Option<&str>) {
        while inner.resident_bytes + inner.pinned_bytes > self.max_bytes {
            let Some((key, entry)) = inner.entries.pop_lru() else {
                break;
            };
            if keep == Some(key.as_str()) {
                // the entry just inserted is the only one left; keep it
                inner.entries.put(key, entry);
                break;
            }
            inner.resident_bytes -= entry.data.len() as u64;
            trace!(object_key = %key, "evicted cache entry");
            self.record_eviction("capacity");
        }
    }

    fn record_eviction(&self, reason: &'static str) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .cache_evictions
            .add(1, &[KeyValue::new("reason", reason)]);
    }
}

// Stores that report neither an ETag nor a version still hand back the
// token recorded at upload time.
fn token_valid(cached: &VersionToken, expected: &VersionToken) -> bool {
    cached == expected || cached.matches(expected)
}

/// Mutable buffer of an output that is open for write.
pub struct WriteBlock {
    cache: Arc<LocalCache>,
    name: String,
    buf: BytesMut,
    pinned: u64,
}

impl WriteBlock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let len = data.len() as u64;
        self.pinned += len;
        self.cache.pin(len);
    }

    /// Removes the first `len` buffered bytes, e.g. once they were handed to
    /// a multipart upload.
    pub fn take_front(&mut self, len: usize) -> Bytes {
        let len = len.min(self.buf.len());
        let chunk = self.buf.split_to(len).freeze();
        self.release(len as u64);
        chunk
    }

    /// Seals the block, returning its remaining content as read-only bytes.
    pub fn seal(mut self) -> Bytes {
        let data = std::mem::take(&mut self.buf).freeze();
        let pinned = self.pinned;
        self.release(pinned);
        data
    }

    fn release(&mut self, len: u64) {
        let len = len.min(self.pinned);
        self.pinned -= len;
        self.cache.unpin(len);
    }
}

impl Drop for WriteBlock {
    fn drop(&mut self) {
        if self.pinned > 0 {
            self.cache.unpin(self.pinned);
            self.pinned = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_bytes: u64) -> Arc<LocalCache> {
        Arc::new(LocalCache::new(
            max_bytes,
            Arc::new(metrics::directory::Metrics::new()),
        ))
    }

    fn token(e_tag: &str) -> VersionToken {
        VersionToken::new(Some(e_tag.to_string()), None)
    }

    #[test]
    fn test_hit_requires_matching_token() {
        let cache = cache(1024);
        cache.insert("data/a/1", token("1"), Bytes::from_static(b"abc"));

        assert_eq!(cache.get("data/a/1", &token("1")).unwrap().as_ref(), b"abc");
        assert!(cache.get("data/a/1", &token("2")).is_none());
        // the stale entry was dropped
        assert!(!cache.contains("data/a/1", &token("1")));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.resident_bytes, 0);
    }

    #[test]
    fn test_lru_eviction_respects_budget() {
        let cache = cache(10);
        cache.insert("a", token("1"), Bytes::from(vec![0u8; 4]));
        cache.insert("b", token("1"), Bytes::from(vec![0u8; 4]));
        // touch a so b becomes least recently used
        assert!(cache.get("a", &token("1")).is_some());
        cache.insert("c", token("1"), Bytes::from(vec![0u8; 4]));

        assert!(cache.contains("a", &token("1")));
        assert!(!cache.contains("b", &token("1")));
        assert!(cache.contains("c", &token("1")));
        assert_eq!(cache.stats().resident_bytes, 8);
    }

    #[test]
    fn test_write_blocks_are_pinned() {
        let cache = cache(10);
        cache.insert("a", token("1"), Bytes::from(vec![0u8; 6]));

        let mut block = cache.begin_write("_0.cfs");
        block.extend(&[1u8; 8]);
        // the unpinned entry made room for the write block
        assert!(!cache.contains("a", &token("1")));
        assert_eq!(cache.stats().pinned_bytes, 8);

        // nothing fits next to the pinned block
        cache.insert("b", token("1"), Bytes::from(vec![0u8; 4]));
        assert!(!cache.contains("b", &token("1")));

        let data = block.seal();
        assert_eq!(data.len(), 8);
        assert_eq!(cache.stats().pinned_bytes, 0);
        cache.insert("b", token("1"), Bytes::from(vec![0u8; 4]));
        assert!(cache.contains("b", &token("1")));
    }

    #[test]
    fn test_take_front_and_drop_release_pins() {
        let cache = cache(100);
        let mut block = cache.begin_write("_1.fdt");
        block.extend(b"0123456789");
        let front = block.take_front(4);
        assert_eq!(front.as_ref(), b"0123");
        assert_eq!(block.len(), 6);
        assert_eq!(cache.stats().pinned_bytes, 6);
        drop(block);
        assert_eq!(cache.stats().pinned_bytes, 0);
    }

    #[test]
    fn test_clear_keeps_pinned_blocks() {
        let cache = cache(100);
        cache.insert("a", token("1"), Bytes::from_static(b"abc"));
        let mut block = cache.begin_write("_2.tim");
        block.extend(b"xyz");
        assert_eq!(cache.clear(), 1);
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.pinned_bytes, 3);
    }
}
