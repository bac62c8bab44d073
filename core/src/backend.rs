//! Seams to the message log client and the group coordination service
//!
//! The store never speaks a wire protocol itself. Producer connections and
//! consumer group memberships come from implementations of the traits below;
//! [`crate::memory`] provides an in-process one.

use crate::config::{AsyncProducerConfig, GroupJoinConfig, SyncProducerConfig};
use crate::directory::ZkCoordinates;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message handed to a producer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceMessage {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl ProduceMessage {
    pub fn new(topic: impl Into<String>, key: Option<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key,
            value: value.into(),
        }
    }
}

/// Where an acknowledged message landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProduceAck {
    pub partition: u32,
    pub offset: u64,
}

/// A message read by a consumer group member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub partition: u32,
    pub offset: u64,
}

/// A delivery failure reported by an asynchronous producer after its own
/// retries are exhausted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerError {
    pub message: ProduceMessage,
    pub reason: String,
}

/// Lazy, unbounded sequence of records for one group member
pub type MessageStream = BoxStream<'static, Result<ConsumeRecord>>;

/// Acknowledged producer connection
#[async_trait]
pub trait SyncProducer: Send + Sync {
    async fn send(&self, message: ProduceMessage) -> Result<ProduceAck>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Fire-and-forget producer connection. Delivery failures surface on the
/// error receiver returned by [`ProducerConnector::connect_async`].
pub trait AsyncProducer: Send + Sync {
    fn send(&self, message: ProduceMessage) -> Result<()>;
    /// Close the connection. The error channel closes once pending errors
    /// are delivered.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// A freshly opened asynchronous connection and its error channel
pub struct AsyncConnection {
    pub producer: Box<dyn AsyncProducer>,
    pub errors: mpsc::UnboundedReceiver<ProducerError>,
}

/// Opens producer connections against a broker list
#[async_trait]
pub trait ProducerConnector: Send + Sync + 'static {
    async fn connect_sync(
        &self,
        brokers: &[String],
        config: &SyncProducerConfig,
    ) -> Result<Box<dyn SyncProducer>>;

    async fn connect_async(
        &self,
        brokers: &[String],
        config: &AsyncProducerConfig,
    ) -> Result<AsyncConnection>;
}

/// Live membership in a coordinated consumer group
#[async_trait]
pub trait GroupMembership: Send + Sync {
    /// Record stream for the partitions currently assigned to this member
    fn messages(&self) -> MessageStream;

    /// Mark a record as processed; committed on the next commit tick or on
    /// close
    fn commit(&self, record: &ConsumeRecord) -> Result<()>;

    /// Commit outstanding offsets and leave the group
    async fn close(&self) -> Result<()>;
}

/// Joins consumer groups through the coordination service
#[async_trait]
pub trait GroupCoordinator: Send + Sync + 'static {
    async fn join(
        &self,
        group: &str,
        topic: &str,
        zk: &ZkCoordinates,
        config: &GroupJoinConfig,
    ) -> Result<Arc<dyn GroupMembership>>;
}
