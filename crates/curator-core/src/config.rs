//! Configuration.
//!
//! One TOML file describes the whole node; every field has a default so a
//! minimal file (or none) still yields a runnable config. Each pipeline
//! gets its own `WorkerConfig` section.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{RetryPolicy, Topic};
use crate::logging::LogConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("invalid config {origin}: {reason}")]
    Parse { origin: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Settings shared by every queue consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub topic: String,
    pub channel: String,
    /// Attempts before a transient failure becomes fatal.
    pub max_attempts: u16,
    /// Messages handled concurrently by the consumer loop.
    pub max_in_flight: usize,
    /// Pool size of CPU/local stages.
    pub workers: usize,
    /// Pool size of network stages.
    pub network_connections: usize,
    pub requeue_delay_secs: u64,
    pub message_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            channel: "curator".to_string(),
            max_attempts: 3,
            max_in_flight: 20,
            workers: 2,
            network_connections: 4,
            requeue_delay_secs: 60,
            message_timeout_secs: 600,
            heartbeat_interval_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn for_topic(topic: Topic) -> Self {
        Self {
            topic: topic.as_str().to_string(),
            ..Self::default()
        }
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_secs)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.requeue_delay())
    }

    /// Capacity of channels feeding network stages.
    pub fn network_channel_size(&self) -> usize {
        self.network_connections * 4
    }

    /// Capacity of channels feeding local stages.
    pub fn work_channel_size(&self) -> usize {
        self.workers * 10
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        let positive = [
            ("max_attempts", usize::from(self.max_attempts)),
            ("max_in_flight", self.max_in_flight),
            ("workers", self.workers),
            ("network_connections", self.network_connections),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field: format!("{section}.{field}"),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.topic.is_empty() {
            return Err(ConfigError::Invalid {
                field: format!("{section}.topic"),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreservationConfig {
    pub primary_bucket: String,
    pub secondary_bucket: String,
    pub cold_bucket: String,
}

impl Default for PreservationConfig {
    fn default() -> Self {
        Self {
            primary_bucket: "preservation.primary".to_string(),
            secondary_bucket: "preservation.secondary".to_string(),
            cold_bucket: "preservation.cold".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixityConfig {
    /// Files are re-checked after this many days.
    pub max_days: i64,
    /// Upper bound of files queued per producer run.
    pub max_files: usize,
}

impl Default for FixityConfig {
    fn default() -> Self {
        Self {
            max_days: 90,
            max_files: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditFormat {
    #[default]
    Json,
    Csv,
    Tsv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub bucket: String,
    pub prefix: String,
    pub concurrency: usize,
    /// Stop after this many records; 0 means no limit.
    pub limit: usize,
    pub format: AuditFormat,
}

pub const MAX_AUDIT_CONCURRENCY: usize = 32;

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            concurrency: 4,
            limit: 0,
            format: AuditFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub local_node: String,
    pub partners: Vec<String>,
    pub batch_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            local_node: "local".to_string(),
            partners: Vec::new(),
            batch_size: 50,
        }
    }
}

/// Whole-node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuratorConfig {
    pub staging_dir: PathBuf,
    pub receiving_buckets: Vec<String>,
    /// Dedup horizon of the bucket reader.
    pub cache_hours: i64,
    /// Objects above this size are skipped; 0 disables the ceiling.
    pub max_file_size: u64,
    /// Reclaim leases older than this. Unset keeps leases until released.
    pub lease_expiry_secs: Option<u64>,
    /// Append a BEGIN/END JSON record per finished item.
    pub json_log: Option<PathBuf>,
    pub collect_stats: bool,
    pub log: LogConfig,
    pub preservation: PreservationConfig,
    pub fixity: FixityConfig,
    pub audit: AuditConfig,
    pub sync: SyncConfig,
    pub fetch: WorkerConfig,
    pub store: WorkerConfig,
    pub record: WorkerConfig,
    pub fixity_worker: WorkerConfig,
    pub file_delete: WorkerConfig,
    pub cold_restore: WorkerConfig,
    pub restore: WorkerConfig,
    pub replication: WorkerConfig,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join("curator"),
            receiving_buckets: Vec::new(),
            cache_hours: 24,
            max_file_size: 0,
            lease_expiry_secs: None,
            json_log: None,
            collect_stats: false,
            log: LogConfig::default(),
            preservation: PreservationConfig::default(),
            fixity: FixityConfig::default(),
            audit: AuditConfig::default(),
            sync: SyncConfig::default(),
            fetch: WorkerConfig::for_topic(Topic::Fetch),
            store: WorkerConfig::for_topic(Topic::Store),
            record: WorkerConfig::for_topic(Topic::Record),
            fixity_worker: WorkerConfig::for_topic(Topic::Fixity),
            file_delete: WorkerConfig::for_topic(Topic::FileDelete),
            cold_restore: WorkerConfig::for_topic(Topic::ColdRestore),
            restore: WorkerConfig::for_topic(Topic::Restore),
            replication: WorkerConfig::for_topic(Topic::Replication),
        }
    }
}

impl CuratorConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::parse_from_str(&contents, &path.display().to_string())
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(contents).map_err(|err| ConfigError::Parse {
            origin: origin.to_string(),
            reason: err.to_string(),
        })?;
        // a section that omits `topic` still serves its own topic
        for topic in Topic::ALL {
            let worker = config.worker_mut(topic);
            if worker.topic.is_empty() {
                worker.topic = topic.as_str().to_string();
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn lease_expiry(&self) -> Option<chrono::Duration> {
        self.lease_expiry_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }

    pub fn worker(&self, topic: Topic) -> &WorkerConfig {
        match topic {
            Topic::Fetch => &self.fetch,
            Topic::Store => &self.store,
            Topic::Record => &self.record,
            Topic::Fixity => &self.fixity_worker,
            Topic::FileDelete => &self.file_delete,
            Topic::ColdRestore => &self.cold_restore,
            Topic::Restore => &self.restore,
            Topic::Replication => &self.replication,
        }
    }

    fn worker_mut(&mut self, topic: Topic) -> &mut WorkerConfig {
        match topic {
            Topic::Fetch => &mut self.fetch,
            Topic::Store => &mut self.store,
            Topic::Record => &mut self.record,
            Topic::Fixity => &mut self.fixity_worker,
            Topic::FileDelete => &mut self.file_delete,
            Topic::ColdRestore => &mut self.cold_restore,
            Topic::Restore => &mut self.restore,
            Topic::Replication => &mut self.replication,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for topic in Topic::ALL {
            self.worker(topic).validate(topic.as_str())?;
        }
        if self.cache_hours <= 0 {
            return Err(ConfigError::Invalid {
                field: "cache_hours".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.audit.concurrency == 0 || self.audit.concurrency > MAX_AUDIT_CONCURRENCY {
            return Err(ConfigError::Invalid {
                field: "audit.concurrency".to_string(),
                reason: format!("must be between 1 and {MAX_AUDIT_CONCURRENCY}"),
            });
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "sync.batch_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
