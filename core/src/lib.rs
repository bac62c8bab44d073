//! # kateway store
//!
//! Store layer of the kateway pub/sub gateway. The HTTP front end calls into
//! this crate to publish to and subscribe from a partitioned, broker-based
//! message log.
//!
//! ## Architecture Overview
//!
//! - [`pool`] - bounded, cancelable pool of backend connections
//! - [`producer`] - per-cluster sync and async producer pools, rebuilt on
//!   broker churn
//! - [`subscriber`] - consumer group registry keyed by (topic, group, client)
//!   with admission control
//! - [`directory`] - cluster metadata the store reads (brokers, partitions,
//!   online consumers)
//! - [`store`] - the pub and sub facades and their background loops
//! - [`backend`] - seams to the log client and the coordination service
//! - [`memory`] - in-process backend for local runs and tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use kateway::{MemoryCluster, PubStore, StaticDirectory, StoreConfig, StoreMetrics, ZkCoordinates};
//!
//! #[tokio::main]
//! async fn main() -> kateway::Result<()> {
//!     let cluster = MemoryCluster::new("c1", 4);
//!     let directory = Arc::new(StaticDirectory::new());
//!     directory.add_cluster("c1", ["127.0.0.1:9092"], ZkCoordinates::default());
//!
//!     let store = PubStore::new(
//!         directory,
//!         Arc::new(cluster),
//!         StoreConfig::default(),
//!         Arc::new(StoreMetrics::default()),
//!     );
//!     store
//!         .publish("c1", "orders", None, Bytes::from("hello"), true)
//!         .await?;
//!     store.close();
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod brokers;
pub mod config;
pub mod directory;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod pool;
pub mod producer;
pub mod store;
pub mod subscriber;

pub use backend::{
    ConsumeRecord, GroupCoordinator, GroupMembership, MessageStream, ProduceAck, ProduceMessage,
    ProducerConnector,
};
pub use brokers::{same_brokers, BrokerSet};
pub use config::{OffsetPolicy, StoreConfig};
pub use directory::{BrokerDirectory, StaticDirectory, ZkCoordinates};
pub use error::KatewayError;
pub use memory::MemoryCluster;
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use pool::{PoolStats, PooledResource, Resource, ResourcePool};
pub use producer::{ProducerPool, RefreshOutcome};
pub use store::{PubStore, SubStore, Subscription};
pub use subscriber::{ConsumerGroupHandle, ConsumerGroupRegistry, HandleKey};

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, KatewayError>;
