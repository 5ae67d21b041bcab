use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use pin_project_lite::pin_project;

pin_project! {
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct TimedFuture<F, C>
    where
        F: Future,
        C: FnOnce(Duration),
    {
        #[pin]
        inner: F,
        start: Instant,
        callback: Option<C>, // This is an Option because the future might be polled even after completion
    }
}

impl<F, C> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    pub fn new(inner: F, callback: C) -> Self {
        Self {
            inner,
            callback: Some(callback),
            start: Instant::now(),
        }
    }
}

impl<F, C> Future for TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll_result = this.inner.poll(cx);

        if poll_result.is_ready() {
            let elapsed = this.start.elapsed();
            if let Some(callback) = this.callback.take() {
                callback(elapsed);
            }
        }

        poll_result
    }
}

pub fn create_timed_future<F, C>(future: F, callback: C) -> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    TimedFuture::new(future, callback)
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between `start` and drop into the wrapped instrument.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: labels.to_vec(),
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

pub mod blob_storage {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
        pub errors: Counter<u64>,
        pub retries: Counter<u64>,
        pub bytes_uploaded: Counter<u64>,
        pub bytes_downloaded: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blob-storage");

            let operations = meter
                .f64_histogram("blobdir.blob_storage.operation_duration")
                .with_description("Duration of blob storage operations in seconds")
                .build();
            let errors = meter
                .u64_counter("blobdir.blob_storage.errors")
                .with_description("blob storage operations that failed after retries")
                .build();
            let retries = meter
                .u64_counter("blobdir.blob_storage.retries")
                .with_description("blob storage operations retried after a transient error")
                .build();
            let bytes_uploaded = meter
                .u64_counter("blobdir.blob_storage.bytes_uploaded")
                .with_description("number of bytes written to the blob store")
                .build();
            let bytes_downloaded = meter
                .u64_counter("blobdir.blob_storage.bytes_downloaded")
                .with_description("number of bytes read from the blob store")
                .build();

            Metrics {
                operations,
                errors,
                retries,
                bytes_uploaded,
                bytes_downloaded,
            }
        }
    }
}

pub mod directory {
    use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub cache_hits: Counter<u64>,
        pub cache_misses: Counter<u64>,
        pub cache_evictions: Counter<u64>,
        pub open_outputs: UpDownCounter<i64>,
        pub commits: Counter<u64>,
        pub commit_conflicts: Counter<u64>,
        pub commit_latency: Histogram<f64>,
        pub lock_acquisitions: Counter<u64>,
        pub lock_contention: Counter<u64>,
        pub leases_lost: Counter<u64>,
        pub gc_deleted_objects: Counter<u64>,
        pub corrupt_manifests: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blobdir-directory");

            let cache_hits = meter
                .u64_counter("blobdir.cache.hits")
                .with_description("reads served from the local cache")
                .build();
            let cache_misses = meter
                .u64_counter("blobdir.cache.misses")
                .with_description("reads that had to fetch from the blob store")
                .build();
            let cache_evictions = meter
                .u64_counter("blobdir.cache.evictions")
                .with_description("cache blocks evicted, by reason")
                .build();
            let open_outputs = meter
                .i64_up_down_counter("blobdir.outputs.open")
                .with_description("index outputs currently open for write")
                .build();
            let commits = meter
                .u64_counter("blobdir.commits")
                .with_description("generations published")
                .build();
            let commit_conflicts = meter
                .u64_counter("blobdir.commit.conflicts")
                .with_description("manifest conditional writes that lost a race")
                .build();
            let commit_latency = meter
                .f64_histogram("blobdir.commit.latency")
                .with_description("commit latencies in seconds")
                .build();
            let lock_acquisitions = meter
                .u64_counter("blobdir.lock.acquisitions")
                .with_description("write leases acquired")
                .build();
            let lock_contention = meter
                .u64_counter("blobdir.lock.contention")
                .with_description("acquire attempts rejected because another holder owns the lease")
                .build();
            let leases_lost = meter
                .u64_counter("blobdir.lock.leases_lost")
                .with_description("write leases lost through renewal failure or expiry")
                .build();
            let gc_deleted_objects = meter
                .u64_counter("blobdir.gc.deleted_objects")
                .with_description("objects removed by the garbage collector")
                .build();
            let corrupt_manifests = meter
                .u64_counter("blobdir.manifests.corrupt")
                .with_description("manifests skipped during generation resolution")
                .build();

            Metrics {
                cache_hits,
                cache_misses,
                cache_evictions,
                open_outputs,
                commits,
                commit_conflicts,
                commit_latency,
                lock_acquisitions,
                lock_contention,
                leases_lost,
                gc_deleted_objects,
                corrupt_manifests,
            }
        }
    }
}
