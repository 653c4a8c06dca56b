// Configuration types for log-aggregator

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub aggregator: AggregatorSettings,

    #[serde(default)]
    pub categories: Vec<CategoryConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Daemon-wide settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregatorSettings {
    /// Interval between periodic store checks
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Messages admitted per wall-clock second (0 = unlimited)
    #[serde(default)]
    pub max_msg_per_second: u64,

    /// Outstanding queued bytes across all queues (0 = unlimited)
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,

    /// Give every category matched by a prefix or default rule its own queue
    #[serde(default = "default_true")]
    pub new_thread_per_category: bool,

    #[serde(default = "default_counters_interval")]
    pub counters_interval_seconds: u64,

    /// Where counter snapshots are POSTed; logged locally when unset
    #[serde(default)]
    pub counters_publish_url: Option<String>,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval(),
            max_msg_per_second: 0,
            max_queue_size: default_max_queue_size(),
            new_thread_per_category: true,
            counters_interval_seconds: default_counters_interval(),
            counters_publish_url: None,
        }
    }
}

impl AggregatorSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn counters_interval(&self) -> Duration {
        Duration::from_secs(self.counters_interval_seconds)
    }
}

/// One routing rule: a category name, `default`, or a prefix ending in `*`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CategoryConfig {
    #[serde(default)]
    pub category: Option<String>,

    /// Several names sharing one store definition
    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default)]
    pub queue: QueueConfig,

    pub store: StoreConfig,
}

impl CategoryConfig {
    pub fn names(&self) -> Vec<&str> {
        self.category
            .iter()
            .map(String::as_str)
            .chain(self.categories.iter().map(String::as_str))
            .collect()
    }
}

/// Per-queue settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Capacity in entries
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: usize,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Queued bytes that trigger a write before the interval elapses
    #[serde(default = "default_target_write_size")]
    pub target_write_size: usize,

    #[serde(default = "default_max_write_interval")]
    pub max_write_interval_ms: u64,

    #[serde(default = "default_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,

    /// Budget for delivering what is still queued when the queue stops
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_length: default_max_queue_length(),
            max_batch_size: default_max_batch_size(),
            target_write_size: default_target_write_size(),
            max_write_interval_ms: default_max_write_interval(),
            retry_initial_backoff_ms: default_initial_backoff(),
            retry_max_backoff_ms: default_max_backoff(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

impl QueueConfig {
    pub fn max_write_interval(&self) -> Duration {
        Duration::from_millis(self.max_write_interval_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Declarative store tree, tagged by `type`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    File(FileStoreConfig),
    Forward(ForwardStoreConfig),
    Buffer(BufferStoreConfig),
    Multi(MultiStoreConfig),
    Bucket(BucketStoreConfig),
    Null,
}

impl StoreConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreConfig::File(_) => "file",
            StoreConfig::Forward(_) => "forward",
            StoreConfig::Buffer(_) => "buffer",
            StoreConfig::Multi(_) => "multi",
            StoreConfig::Bucket(_) => "bucket",
            StoreConfig::Null => "null",
        }
    }

    /// Copy of this tree with every file path moved into `sub`
    pub fn with_subdirectory(&self, sub: &str) -> StoreConfig {
        match self {
            StoreConfig::File(file) => {
                let mut file = file.clone();
                file.file_path = Path::new(&file.file_path)
                    .join(sub)
                    .to_string_lossy()
                    .into_owned();
                StoreConfig::File(file)
            }
            StoreConfig::Buffer(buffer) => {
                let mut buffer = buffer.clone();
                buffer.primary = Box::new(buffer.primary.with_subdirectory(sub));
                buffer.secondary = Box::new(buffer.secondary.with_subdirectory(sub));
                StoreConfig::Buffer(buffer)
            }
            StoreConfig::Multi(multi) => {
                let mut multi = multi.clone();
                multi.stores = multi
                    .stores
                    .iter()
                    .map(|s| s.with_subdirectory(sub))
                    .collect();
                StoreConfig::Multi(multi)
            }
            StoreConfig::Bucket(bucket) => {
                let mut bucket = bucket.clone();
                bucket.bucket = bucket
                    .bucket
                    .as_ref()
                    .map(|b| Box::new(b.with_subdirectory(sub)));
                bucket.buckets = bucket
                    .buckets
                    .iter()
                    .map(|s| s.with_subdirectory(sub))
                    .collect();
                StoreConfig::Bucket(bucket)
            }
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileStoreConfig {
    pub file_path: String,

    /// Defaults to the category name
    #[serde(default)]
    pub base_filename: Option<String>,

    #[serde(default)]
    pub format: FileFormat,

    #[serde(default = "default_true")]
    pub add_newlines: bool,

    /// Rotate once a file reaches this many bytes
    #[serde(default = "default_max_file_size")]
    pub max_size: u64,

    #[serde(default)]
    pub rotate_period: RotatePeriod,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            file_path: "/var/log/aggregator".to_string(),
            base_filename: None,
            format: FileFormat::default(),
            add_newlines: true,
            max_size: default_max_file_size(),
            rotate_period: RotatePeriod::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Raw payloads, readable by people and line-oriented tools
    #[default]
    Plain,
    /// Length-prefixed category and payload; can be read back for replay
    Framed,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotatePeriod {
    #[default]
    Never,
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardStoreConfig {
    pub remote_host: String,
    pub remote_port: u16,

    #[serde(default = "default_forward_timeout")]
    pub timeout_ms: u64,
}

impl ForwardStoreConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.remote_host, self.remote_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferStoreConfig {
    pub primary: Box<StoreConfig>,

    /// Staging store; must be a framed file store
    pub secondary: Box<StoreConfig>,

    /// Cooldown before a failed primary is retried
    #[serde(default = "default_buffer_retry_interval")]
    pub retry_interval_ms: u64,

    /// Staged files replayed into the primary per periodic check
    #[serde(default = "default_drain_files_per_check")]
    pub drain_files_per_check: usize,

    /// Discard staged data on recovery instead of replaying it
    #[serde(default = "default_true")]
    pub replay_buffer: bool,
}

impl BufferStoreConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultiStoreConfig {
    pub stores: Vec<StoreConfig>,

    #[serde(default)]
    pub report_success: ReportSuccess,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportSuccess {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketStoreConfig {
    pub bucket_type: BucketType,
    pub num_buckets: usize,

    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Strip the key and delimiter before delivery
    #[serde(default)]
    pub remove_key: bool,

    /// Template cloned once per bucket into `bucketNNN` subdirectories
    #[serde(default)]
    pub bucket: Option<Box<StoreConfig>>,

    /// Explicit per-bucket stores; takes precedence over `bucket`
    #[serde(default)]
    pub buckets: Vec<StoreConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BucketType {
    KeyHash,
    KeyModulo,
    Category,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_listen() -> String { "0.0.0.0:1463".to_string() }
fn default_check_interval() -> u64 { 5_000 }
fn default_max_queue_size() -> u64 { 5_000_000 }
fn default_counters_interval() -> u64 { 60 }
fn default_max_queue_length() -> usize { 10_000 }
fn default_max_batch_size() -> usize { 1_000 }
fn default_target_write_size() -> usize { 16_384 }
fn default_max_write_interval() -> u64 { 1_000 }
fn default_initial_backoff() -> u64 { 100 }
fn default_max_backoff() -> u64 { 30_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_drain_timeout() -> u64 { 5_000 }
fn default_max_file_size() -> u64 { 1_000_000_000 }
fn default_forward_timeout() -> u64 { 5_000 }
fn default_buffer_retry_interval() -> u64 { 300_000 }
fn default_drain_files_per_check() -> usize { 10 }
fn default_delimiter() -> String { ":".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
