use std::{path::PathBuf, time::Duration};

use logship_core::LabelSet;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use url::Url;

use crate::de::{HumanDuration, LabelSetString, PermissiveBool};

const DEFAULT_URL: &str = "http://localhost:3100/loki/api/v1/push";

pub(crate) fn default_url() -> Url {
    // The constant above is a well-formed absolute URL.
    Url::parse(DEFAULT_URL).expect("default push URL must be valid")
}

const fn default_batch_wait() -> Duration {
    Duration::from_secs(1)
}

const fn default_batch_size() -> usize {
    1024 * 1024
}

fn default_external_labels() -> LabelSet {
    [("job", "fluent-bit")].into_iter().collect()
}

const fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_graceful_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_min_backoff() -> Duration {
    Duration::from_millis(500)
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(300)
}

const fn default_max_retries() -> u32 {
    10
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from("/tmp/flb-storage/loki")
}

const fn default_queue_segment_size() -> usize {
    500
}

fn default_queue_name() -> String {
    "dque".to_string()
}

/// Delivery client configuration.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfiguration {
    /// Push endpoint of the main destination.
    ///
    /// Defaults to `http://localhost:3100/loki/api/v1/push`.
    #[serde(rename = "URL", default = "default_url")]
    #[serde_as(as = "DisplayFromStr")]
    pub url: Url,

    /// Tenant sent with every push to the main destination.
    #[serde(rename = "TenantID", default)]
    pub tenant_id: String,

    /// Maximum age of a batch before it is flushed.
    ///
    /// Defaults to 1 second.
    #[serde(rename = "BatchWait", default = "default_batch_wait")]
    #[serde_as(as = "HumanDuration")]
    pub batch_wait: Duration,

    /// Maximum size of a batch, in bytes, before it is flushed.
    ///
    /// Defaults to 1MiB.
    #[serde(rename = "BatchSize", default = "default_batch_size")]
    #[serde_as(as = "DisplayFromStr")]
    pub batch_size: usize,

    /// Labels added to every entry that does not already carry them.
    ///
    /// Defaults to `{job="fluent-bit"}`.
    #[serde(rename = "Labels", default = "default_external_labels")]
    #[serde_as(as = "LabelSetString")]
    pub external_labels: LabelSet,

    /// Timeout of a single push request.
    ///
    /// Defaults to 10 seconds.
    #[serde(rename = "Timeout", default = "default_timeout")]
    #[serde_as(as = "HumanDuration")]
    pub timeout: Duration,

    /// Whether entries within a batch are pushed in timestamp order rather than arrival order.
    #[serde(rename = "SortByTimestamp", default)]
    #[serde_as(as = "PermissiveBool")]
    pub sort_by_timestamp: bool,

    /// Upper bound on how long a graceful stop may take before pending data is discarded.
    ///
    /// Defaults to 30 seconds.
    #[serde(rename = "GracefulShutdownTimeout", default = "default_graceful_shutdown_timeout")]
    #[serde_as(as = "HumanDuration")]
    pub graceful_shutdown_timeout: Duration,

    /// Retry policy for failed pushes.
    #[serde(flatten)]
    pub backoff: BackoffConfiguration,

    /// On-disk buffering.
    #[serde(flatten)]
    pub buffer: BufferConfiguration,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            url: default_url(),
            tenant_id: String::new(),
            batch_wait: default_batch_wait(),
            batch_size: default_batch_size(),
            external_labels: default_external_labels(),
            timeout: default_timeout(),
            sort_by_timestamp: false,
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
            backoff: BackoffConfiguration::default(),
            buffer: BufferConfiguration::default(),
        }
    }
}

/// Retry policy for failed pushes.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct BackoffConfiguration {
    /// Delay before the first retry.
    ///
    /// Defaults to 500 milliseconds.
    #[serde(rename = "MinBackoff", default = "default_min_backoff")]
    #[serde_as(as = "HumanDuration")]
    pub min_backoff: Duration,

    /// Upper bound on the delay between retries.
    ///
    /// Defaults to 5 minutes.
    #[serde(rename = "MaxBackoff", default = "default_max_backoff")]
    #[serde_as(as = "HumanDuration")]
    pub max_backoff: Duration,

    /// Number of retries after the first failed attempt before a batch is dropped.
    ///
    /// Defaults to 10.
    #[serde(rename = "MaxRetries", default = "default_max_retries")]
    #[serde_as(as = "DisplayFromStr")]
    pub max_retries: u32,
}

impl Default for BackoffConfiguration {
    fn default() -> Self {
        Self {
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
            max_retries: default_max_retries(),
        }
    }
}

/// Kind of buffer placed in front of the batching client.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub enum BufferType {
    /// Durable queue of segment files on local disk.
    #[default]
    #[serde(rename = "dque")]
    Dque,
}

/// On-disk buffering.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct BufferConfiguration {
    /// Whether entries are buffered on disk before being batched.
    #[serde(rename = "Buffer", default)]
    #[serde_as(as = "PermissiveBool")]
    pub enabled: bool,

    /// Kind of buffer.
    #[serde(rename = "BufferType", default)]
    pub buffer_type: BufferType,

    /// Disk queue settings.
    #[serde(flatten)]
    pub queue: QueueConfiguration,
}

/// When appended queue entries are flushed to stable storage.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum QueueSync {
    /// Appends are left to the operating system to flush.
    #[default]
    Normal,

    /// Every append is synced to disk before it is acknowledged.
    Full,
}

/// Disk queue settings.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct QueueConfiguration {
    /// Directory under which each destination gets its own queue directory.
    ///
    /// Defaults to `/tmp/flb-storage/loki`.
    #[serde(rename = "QueueDir", default = "default_queue_dir")]
    pub dir: PathBuf,

    /// Maximum number of entries per segment file.
    ///
    /// Defaults to 500.
    #[serde(rename = "QueueSegmentSize", default = "default_queue_segment_size")]
    #[serde_as(as = "DisplayFromStr")]
    pub segment_size: usize,

    /// Sync mode.
    #[serde(rename = "QueueSync", default)]
    pub sync: QueueSync,

    /// Prefix of the per-destination queue directory names.
    ///
    /// Defaults to `dque`.
    #[serde(rename = "QueueName", default = "default_queue_name")]
    pub name: String,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self {
            dir: default_queue_dir(),
            segment_size: default_queue_segment_size(),
            sync: QueueSync::default(),
            name: default_queue_name(),
        }
    }
}
