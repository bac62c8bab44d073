pub mod settings;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Acknowledgment level a producer connection asks the broker for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredAcks {
    /// Fire and forget
    None,
    /// Wait for the partition leader to persist the message
    Local,
    /// Wait for every in-sync replica
    All,
}

/// How a producer connection picks the partition of a keyed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioner {
    /// Deterministic hash of the message key
    Hash,
    RoundRobin,
}

/// Where a freshly joined consumer group starts reading when it has no
/// committed offset yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetPolicy {
    #[default]
    Oldest,
    Newest,
}

impl OffsetPolicy {
    /// Parse the `reset` query value used by subscribers; anything but
    /// `newest` falls back to the oldest unread message.
    pub fn from_reset(reset: &str) -> Self {
        if reset.eq_ignore_ascii_case("newest") {
            OffsetPolicy::Newest
        } else {
            OffsetPolicy::Oldest
        }
    }
}

/// Connection settings for acknowledged (synchronous) publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncProducerConfig {
    pub client_id: String,
    pub dial_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub metadata_refresh_ms: u64,
    pub metadata_retry_max: u32,
    pub metadata_retry_backoff_ms: u64,
    pub required_acks: RequiredAcks,
    pub partitioner: Partitioner,
    pub retry_max: u32,
    pub channel_buffer_size: usize,
}

impl Default for SyncProducerConfig {
    fn default() -> Self {
        Self {
            client_id: "localhost".to_string(),
            dial_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            metadata_refresh_ms: 10 * 60 * 1000, // 10 minutes
            metadata_retry_max: 3,
            metadata_retry_backoff_ms: 1_000,
            required_acks: RequiredAcks::Local,
            partitioner: Partitioner::Hash,
            retry_max: 3,
            channel_buffer_size: 256,
        }
    }
}

impl SyncProducerConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Connection settings for fire-and-forget (asynchronous) publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncProducerConfig {
    pub client_id: String,
    pub metadata_refresh_ms: u64,
    pub metadata_retry_max: u32,
    pub flush_frequency_ms: u64,
    pub flush_messages: usize,
    /// 0 means the batch size is unbounded
    pub flush_max_messages: usize,
    pub required_acks: RequiredAcks,
    pub partitioner: Partitioner,
    pub retry_max: u32,
}

impl Default for AsyncProducerConfig {
    fn default() -> Self {
        Self {
            client_id: "localhost".to_string(),
            metadata_refresh_ms: 60_000,
            metadata_retry_max: 3,
            flush_frequency_ms: 10_000,
            flush_messages: 1000,
            flush_max_messages: 0,
            required_acks: RequiredAcks::None,
            partitioner: Partitioner::Hash,
            retry_max: 3,
        }
    }
}

impl AsyncProducerConfig {
    pub fn flush_frequency(&self) -> Duration {
        Duration::from_millis(self.flush_frequency_ms)
    }
}

/// Settings handed to the coordination service when joining a group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupJoinConfig {
    pub initial_offset: OffsetPolicy,
    pub commit_interval: Duration,
    /// Grace period for in-flight messages of a partition once the member
    /// stops consuming from it
    pub processing_timeout: Duration,
    pub channel_buffer_size: usize,
}

/// Configuration of the whole store layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub hostname: String,
    /// Cluster the subscribe side reads from
    pub sub_cluster: String,
    /// Capacity of each producer pool (sync and async separately)
    pub pub_pool_size: usize,
    /// 0 keeps pooled connections until the pool is closed
    pub pool_idle_timeout_ms: u64,
    pub offset_commit_interval_ms: u64,
    pub processing_timeout_ms: u64,
    pub join_attempts: usize,
    pub broker_refresh_interval_ms: u64,
    pub sync_producer: SyncProducerConfig,
    pub async_producer: AsyncProducerConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            sub_cluster: "default".to_string(),
            pub_pool_size: 100,
            pool_idle_timeout_ms: 0,
            offset_commit_interval_ms: 10_000,
            processing_timeout_ms: 10_000,
            join_attempts: 3,
            broker_refresh_interval_ms: 30_000,
            sync_producer: SyncProducerConfig::default(),
            async_producer: AsyncProducerConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Set the hostname used as client id on every producer connection
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self.sync_producer.client_id = hostname.to_string();
        self.async_producer.client_id = hostname.to_string();
        self
    }

    /// Sync producer settings with the hostname as client id
    pub fn sync_producer_config(&self) -> SyncProducerConfig {
        SyncProducerConfig {
            client_id: self.hostname.clone(),
            ..self.sync_producer.clone()
        }
    }

    /// Async producer settings with the hostname as client id
    pub fn async_producer_config(&self) -> AsyncProducerConfig {
        AsyncProducerConfig {
            client_id: self.hostname.clone(),
            ..self.async_producer.clone()
        }
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_idle_timeout_ms)
    }

    pub fn broker_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.broker_refresh_interval_ms)
    }

    /// Join settings for a subscriber asking for the given offset policy
    pub fn group_join_config(&self, initial_offset: OffsetPolicy) -> GroupJoinConfig {
        GroupJoinConfig {
            initial_offset,
            commit_interval: Duration::from_millis(self.offset_commit_interval_ms),
            processing_timeout: Duration::from_millis(self.processing_timeout_ms),
            channel_buffer_size: 0,
        }
    }

    /// Validate configuration bounds
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.pub_pool_size == 0 {
            return Err("pub_pool_size must be > 0".to_string());
        }
        if self.join_attempts == 0 {
            return Err("join_attempts must be > 0".to_string());
        }
        if self.broker_refresh_interval_ms == 0 {
            return Err("broker_refresh_interval_ms must be > 0".to_string());
        }
        Ok(())
    }
}
