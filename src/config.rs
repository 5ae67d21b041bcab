use std::{fmt::Debug, time::Duration};

use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, Result};

const LOCAL_ENV: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub blob_storage: BlobStorageConfig,
    /// Folder inside the blob store holding this index. Several indexes can
    /// share one bucket under different namespaces.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Identity recorded in the write lease. Defaults to `<env>-<pid>`.
    #[serde(default)]
    pub holder_id: Option<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub commit: CommitConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig {
            env: default_env(),
            blob_storage: Default::default(),
            namespace: None,
            holder_id: None,
            cache: Default::default(),
            lock: Default::default(),
            commit: Default::default(),
            gc: Default::default(),
            telemetry: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for cached file content, including outputs being written.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
    /// Outputs growing past this size are streamed to the store as a
    /// multipart upload instead of being held in memory.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: usize,
    #[serde(default = "default_part_size")]
    pub part_size: usize,
    /// Compare the store's current version with the manifest on every open
    /// (one HEAD per open).
    #[serde(default)]
    pub verify_on_open: bool,
}

fn default_cache_max_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_multipart_threshold() -> usize {
    32 * 1024 * 1024
}

fn default_part_size() -> usize {
    8 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_cache_max_bytes(),
            multipart_threshold: default_multipart_threshold(),
            part_size: default_part_size(),
            verify_on_open: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(with = "duration_ms", default = "default_lease_duration")]
    pub lease_duration: Duration,
    #[serde(with = "duration_ms", default = "default_renew_interval")]
    pub renew_interval: Duration,
    /// The holder stops trusting its lease this long before the deadline,
    /// covering clock skew and in-flight requests.
    #[serde(with = "duration_ms", default = "default_safety_margin")]
    pub safety_margin: Duration,
    #[serde(with = "duration_ms", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
    #[serde(with = "duration_ms", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Renew the lease from a background task while a writer is open.
    #[serde(default = "default_true")]
    pub auto_renew: bool,
}

fn default_lease_duration() -> Duration {
    Duration::from_secs(60)
}

fn default_renew_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_safety_margin() -> Duration {
    Duration::from_secs(5)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(0)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration: default_lease_duration(),
            renew_interval: default_renew_interval(),
            safety_margin: default_safety_margin(),
            acquire_timeout: default_acquire_timeout(),
            poll_interval: default_poll_interval(),
            auto_renew: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    /// Attempts at publishing a manifest after the first one lost a race.
    #[serde(default = "default_commit_retries")]
    pub max_retries: u32,
}

fn default_commit_retries() -> u32 {
    3
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_retries: default_commit_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Minimum time a superseded object stays readable.
    #[serde(with = "duration_ms", default = "default_grace_period")]
    pub grace_period: Duration,
    /// Run the collector in the background of writer sessions.
    #[serde(default)]
    pub background: bool,
    #[serde(with = "duration_ms", default = "default_gc_interval")]
    pub interval: Duration,
}

fn default_grace_period() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            background: false,
            interval: default_gc_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    // Export spans to an OpenTelemetry collector.
    #[serde(default)]
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint.
    // Defaults to using OTEL_EXPORTER_OTLP_ENDPOINT env var or to localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl DirectoryConfig {
    /// Loads a YAML file, with `BLOBDIR_` environment variables taking
    /// precedence (`BLOBDIR_LOCK__LEASE_DURATION=30000`).
    pub fn from_path(path: &str) -> Result<DirectoryConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<DirectoryConfig> {
        let config: DirectoryConfig = Figment::from(Serialized::defaults(DirectoryConfig::default()))
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed("BLOBDIR_").split("__"))
            .extract()
            .map_err(|e| DirectoryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DirectoryError::Config(msg));
        if self.blob_storage.path.is_none() {
            return invalid("blob_storage.path must be set".to_string());
        }
        if let Some(namespace) = &self.namespace {
            if namespace.is_empty() || namespace.split('/').any(|p| p.is_empty() || p == "..") {
                return invalid(format!("invalid namespace: {:?}", namespace));
            }
        }
        if self.lock.lease_duration.is_zero() {
            return invalid("lock.lease_duration must be positive".to_string());
        }
        // a renewal must land before the margin makes the lease unusable
        if self.lock.renew_interval + self.lock.safety_margin >= self.lock.lease_duration {
            return invalid(format!(
                "lock.renew_interval ({:?}) plus lock.safety_margin ({:?}) must be shorter than \
                 lock.lease_duration ({:?})",
                self.lock.renew_interval, self.lock.safety_margin, self.lock.lease_duration
            ));
        }
        if self.commit.max_retries == 0 {
            return invalid("commit.max_retries must be at least 1".to_string());
        }
        if self.cache.part_size == 0 || self.cache.multipart_threshold < self.cache.part_size {
            return invalid(format!(
                "cache.multipart_threshold ({}) must be at least cache.part_size ({})",
                self.cache.multipart_threshold, self.cache.part_size
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn holder_id(&self) -> String {
        self.holder_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, std::process::id()))
    }
}

// Durations are written as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
