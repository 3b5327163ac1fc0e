use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use blob_store::BlobStorageConfig;
use chrono::NaiveTime;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "ZIPPER_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub listen_addr: String,
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
    pub blob_storage: BlobStorageConfig,
    /// Bucket holding the group files archives are built from.
    ///
    /// Buckets are top level prefixes under `blob_storage.path`, so this reads
    /// `<path>/<source_bucket>/groups/...`. An existing S3 or MinIO bucket that
    /// keeps `groups/` at its root, such as a PrimeHub `phfs` bucket, cannot be
    /// read in place. Its objects have to be copied below the root as
    /// `<source_bucket>/groups/...` first.
    pub source_bucket: String,
    /// Directory archives are assembled in before upload.
    pub scratch_dir: PathBuf,
    pub workers: WorkerConfig,
    pub eviction: EvictionConfig,
    pub listing_failure_policy: ListingFailurePolicy,
    /// Reject submissions whose files would not fit into the scratch
    /// directory.
    pub preflight_capacity_check: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let storage_root = env::current_dir().unwrap_or_default().join("zipper_storage");
        ServerConfig {
            env: "local".to_string(),
            listen_addr: "0.0.0.0:8900".to_string(),
            structured_logging: false,
            telemetry: TelemetryConfig::default(),
            blob_storage: BlobStorageConfig::default(),
            source_bucket: "phfs".to_string(),
            scratch_dir: storage_root.join("scratch"),
            workers: WorkerConfig::default(),
            eviction: EvictionConfig::default(),
            listing_failure_policy: ListingFailurePolicy::default(),
            preflight_capacity_check: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    /// OTLP collector endpoint. Defaults to the exporter's own default.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            count: 4,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub retention_secs: u64,
    /// UTC wall clock time of the daily sweep, `HH:MM`.
    pub run_at: String,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        EvictionConfig {
            retention_secs: 2 * 24 * 60 * 60,
            run_at: "00:00".to_string(),
        }
    }
}

impl EvictionConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn run_at_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.run_at, "%H:%M")
            .map_err(|e| anyhow::anyhow!("invalid eviction run_at {:?}: {}", self.run_at, e))
    }
}

/// What a submission does when listing a directory specifier fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingFailurePolicy {
    /// Abort the submission with the listing error.
    #[default]
    FailRequest,
    /// Treat the directory as empty and continue with the remaining files.
    FailOpen,
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    /// Layers defaults, the yaml document and `ZIPPER_` prefixed environment
    /// variables, in that order. Nested keys are separated by `__`, e.g.
    /// `ZIPPER_EVICTION__RETENTION_SECS`.
    pub fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        Self::extract(Self::defaults().merge(Yaml::string(config_str)))
    }

    pub fn from_env() -> Result<ServerConfig> {
        Self::extract(Self::defaults())
    }

    fn defaults() -> Figment {
        Figment::from(Serialized::defaults(ServerConfig::default()))
    }

    fn extract(figment: Figment) -> Result<ServerConfig> {
        let config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.workers.count == 0 {
            return Err(anyhow::anyhow!("workers.count must be greater than 0"));
        }
        if self.workers.queue_capacity == 0 {
            return Err(anyhow::anyhow!(
                "workers.queue_capacity must be greater than 0"
            ));
        }
        if self.eviction.retention_secs == 0 {
            return Err(anyhow::anyhow!(
                "eviction.retention_secs must be greater than 0"
            ));
        }
        self.eviction.run_at_time()?;
        if self.source_bucket.is_empty() || self.source_bucket.contains('/') {
            return Err(anyhow::anyhow!(
                "invalid source bucket: {:?}",
                self.source_bucket
            ));
        }
        Ok(())
    }
}
