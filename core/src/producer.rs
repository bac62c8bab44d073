//! Per-cluster producer pools
//!
//! A [`ProducerPool`] keeps two [`ResourcePool`]s for one cluster: acknowledged
//! (sync) connections and fire-and-forget (async) connections. Both are built
//! against the cluster's current broker list and rebuilt from scratch when the
//! set of brokers changes.

use crate::backend::{AsyncProducer, ProduceAck, ProduceMessage, ProducerConnector, SyncProducer};
use crate::brokers::{same_brokers, BrokerSet};
use crate::config::{AsyncProducerConfig, StoreConfig, SyncProducerConfig};
use crate::error::KatewayError;
use crate::metrics::StoreMetrics;
use crate::pool::{PoolStats, PooledResource, Resource, ResourcePool};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

/// Pooled acknowledged producer connection
pub struct SyncProducerClient {
    id: u64,
    cluster: String,
    producer: Box<dyn SyncProducer>,
}

impl SyncProducerClient {
    /// Publish and wait for the local broker's acknowledgment
    pub async fn send(&self, message: ProduceMessage) -> Result<ProduceAck> {
        self.producer.send(message).await
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }
}

impl Resource for SyncProducerClient {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.producer.is_closed()
    }

    fn close(&self) {
        self.producer.close();
    }
}

impl fmt::Debug for SyncProducerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncProducerClient")
            .field("id", &self.id)
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Pooled fire-and-forget producer connection.
///
/// Owns the task draining the connection's error channel. The task starts
/// with the connection and ends once the channel is closed and empty, which
/// happens after [`Resource::close`].
pub struct AsyncProducerClient {
    id: u64,
    cluster: String,
    producer: Box<dyn AsyncProducer>,
    drain: Mutex<Option<JoinHandle<u64>>>,
}

impl AsyncProducerClient {
    /// Hand the message to the connection's batcher
    pub fn send(&self, message: ProduceMessage) -> Result<()> {
        self.producer.send(message)
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Whether the error drain task has exited
    pub fn drain_finished(&self) -> bool {
        self.drain
            .lock()
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Wait for the error drain task and return how many errors it logged
    pub async fn join_drain(&self) -> u64 {
        let handle = self.drain.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(errors) => errors,
                Err(err) => {
                    error!(
                        "cluster[{}] async producer[{}] error drain task failed: {}",
                        self.cluster, self.id, err
                    );
                    0
                }
            },
            None => 0,
        }
    }
}

impl Resource for AsyncProducerClient {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.producer.is_closed()
    }

    fn close(&self) {
        self.producer.close();
    }
}

impl Drop for AsyncProducerClient {
    fn drop(&mut self) {
        // ends the drain task even if nobody closed the pool
        self.producer.close();
    }
}

impl fmt::Debug for AsyncProducerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncProducerClient")
            .field("id", &self.id)
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Outcome of [`ProducerPool::refresh_broker_list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Same broker set; pools and connections kept
    Unchanged,
    /// Broker set changed; both pools closed and rebuilt
    Rebuilt,
    /// Empty broker list ignored
    Refused,
}

struct PoolPair {
    brokers: Vec<String>,
    sync_pool: ResourcePool<SyncProducerClient>,
    async_pool: ResourcePool<AsyncProducerClient>,
}

/// Sync and async producer pools of one cluster
pub struct ProducerPool {
    cluster: String,
    size: usize,
    idle_timeout: Duration,
    connector: Arc<dyn ProducerConnector>,
    sync_config: Arc<SyncProducerConfig>,
    async_config: Arc<AsyncProducerConfig>,
    next_id: Arc<AtomicU64>,
    metrics: Arc<StoreMetrics>,
    pools: RwLock<PoolPair>,
}

impl ProducerPool {
    pub fn new(
        cluster: impl Into<String>,
        brokers: Vec<String>,
        connector: Arc<dyn ProducerConnector>,
        config: &StoreConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        let cluster = cluster.into();
        let next_id = Arc::new(AtomicU64::new(0));
        let sync_config = Arc::new(config.sync_producer_config());
        let async_config = Arc::new(config.async_producer_config());
        let size = config.pub_pool_size;
        let idle_timeout = config.pool_idle_timeout();

        let pools = build_pools(
            &cluster,
            brokers,
            size,
            idle_timeout,
            &connector,
            &sync_config,
            &async_config,
            &next_id,
            &metrics,
        );

        Self {
            cluster,
            size,
            idle_timeout,
            connector,
            sync_config,
            async_config,
            next_id,
            metrics,
            pools: RwLock::new(pools),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn broker_list(&self) -> Vec<String> {
        self.pools.read().brokers.clone()
    }

    /// Check out an acknowledged producer
    pub async fn get_sync_producer(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledResource<SyncProducerClient>> {
        let pool = {
            let pools = self.pools.read();
            if pools.brokers.is_empty() {
                return Err(KatewayError::empty_broker_list(&self.cluster));
            }
            pools.sync_pool.clone()
        };
        pool.acquire(cancel).await
    }

    /// Check out a fire-and-forget producer
    pub async fn get_async_producer(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledResource<AsyncProducerClient>> {
        let pool = {
            let pools = self.pools.read();
            if pools.brokers.is_empty() {
                return Err(KatewayError::empty_broker_list(&self.cluster));
            }
            pools.async_pool.clone()
        };
        pool.acquire(cancel).await
    }

    /// Adopt a new broker list.
    ///
    /// Connections checked out from the old pools are closed but not
    /// interrupted; their holders see the closure on next use.
    pub fn refresh_broker_list(&self, brokers: &[String]) -> RefreshOutcome {
        if BrokerSet::new(brokers).is_empty() {
            let current = self.pools.read().brokers.clone();
            if !current.is_empty() {
                warn!(
                    "cluster[{}] found empty broker list, refresh refused, keeping {:?}",
                    self.cluster, current
                );
                self.metrics.record_refresh_refused();
            }
            return RefreshOutcome::Refused;
        }

        let mut pools = self.pools.write();
        if same_brokers(&pools.brokers, brokers) {
            return RefreshOutcome::Unchanged;
        }

        info!(
            "cluster[{}] broker list from {:?} to {:?}",
            self.cluster, pools.brokers, brokers
        );

        pools.sync_pool.close_all();
        pools.async_pool.close_all();
        *pools = build_pools(
            &self.cluster,
            brokers.to_vec(),
            self.size,
            self.idle_timeout,
            &self.connector,
            &self.sync_config,
            &self.async_config,
            &self.next_id,
            &self.metrics,
        );
        self.metrics.record_pool_rebuild();

        RefreshOutcome::Rebuilt
    }

    pub fn stats(&self) -> (PoolStats, PoolStats) {
        let pools = self.pools.read();
        (pools.sync_pool.stats(), pools.async_pool.stats())
    }

    /// Close both pools and every connection they track
    pub fn close(&self) {
        let pools = self.pools.read();
        let closed = pools.sync_pool.close_all() + pools.async_pool.close_all();
        info!("cluster[{}] producer pools closed, {} connections", self.cluster, closed);
    }
}

impl fmt::Debug for ProducerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerPool")
            .field("cluster", &self.cluster)
            .field("size", &self.size)
            .field("brokers", &self.pools.read().brokers)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
fn build_pools(
    cluster: &str,
    brokers: Vec<String>,
    size: usize,
    idle_timeout: Duration,
    connector: &Arc<dyn ProducerConnector>,
    sync_config: &Arc<SyncProducerConfig>,
    async_config: &Arc<AsyncProducerConfig>,
    next_id: &Arc<AtomicU64>,
    metrics: &Arc<StoreMetrics>,
) -> PoolPair {
    let shared_brokers = Arc::new(brokers.clone());

    let sync_pool = {
        let cluster = cluster.to_string();
        let brokers = shared_brokers.clone();
        let connector = connector.clone();
        let config = sync_config.clone();
        let next_id = next_id.clone();
        ResourcePool::new(
            format!("{}/sync", cluster),
            move || {
                sync_producer_factory(
                    cluster.clone(),
                    brokers.clone(),
                    connector.clone(),
                    config.clone(),
                    next_id.clone(),
                )
            },
            size,
            size,
            idle_timeout,
        )
    };

    let async_pool = {
        let cluster = cluster.to_string();
        let brokers = shared_brokers;
        let connector = connector.clone();
        let config = async_config.clone();
        let next_id = next_id.clone();
        let metrics = metrics.clone();
        ResourcePool::new(
            format!("{}/async", cluster),
            move || {
                async_producer_factory(
                    cluster.clone(),
                    brokers.clone(),
                    connector.clone(),
                    config.clone(),
                    next_id.clone(),
                    metrics.clone(),
                )
            },
            size,
            size,
            idle_timeout,
        )
    };

    PoolPair {
        brokers,
        sync_pool,
        async_pool,
    }
}

async fn sync_producer_factory(
    cluster: String,
    brokers: Arc<Vec<String>>,
    connector: Arc<dyn ProducerConnector>,
    config: Arc<SyncProducerConfig>,
    next_id: Arc<AtomicU64>,
) -> Result<SyncProducerClient> {
    if brokers.is_empty() {
        return Err(KatewayError::empty_broker_list(cluster));
    }

    let started = Instant::now();
    let producer = connector.connect_sync(&brokers, &config).await?;
    let id = next_id.fetch_add(1, Ordering::SeqCst) + 1;
    trace!(
        "cluster[{}] kafka connected[{}]: {:?} {:?}",
        cluster,
        id,
        brokers,
        started.elapsed()
    );

    Ok(SyncProducerClient {
        id,
        cluster,
        producer,
    })
}

async fn async_producer_factory(
    cluster: String,
    brokers: Arc<Vec<String>>,
    connector: Arc<dyn ProducerConnector>,
    config: Arc<AsyncProducerConfig>,
    next_id: Arc<AtomicU64>,
    metrics: Arc<StoreMetrics>,
) -> Result<AsyncProducerClient> {
    if brokers.is_empty() {
        return Err(KatewayError::empty_broker_list(cluster));
    }

    let started = Instant::now();
    let connection = connector.connect_async(&brokers, &config).await?;
    let id = next_id.fetch_add(1, Ordering::SeqCst) + 1;
    trace!(
        "cluster[{}] kafka connected[{}]: {:?} {:?}",
        cluster,
        id,
        brokers,
        started.elapsed()
    );

    let mut errors = connection.errors;
    let drain_cluster = cluster.clone();
    let drain = tokio::spawn(async move {
        // errors only arrive here after the connection's own retries
        let mut drained = 0u64;
        while let Some(err) = errors.recv().await {
            drained += 1;
            metrics.record_async_delivery_error();
            error!(
                "cluster[{}] async producer[{}] topic {}: {}",
                drain_cluster, id, err.message.topic, err.reason
            );
        }
        trace!("cluster[{}] async producer[{}] error drain done", drain_cluster, id);
        drained
    });

    Ok(AsyncProducerClient {
        id,
        cluster,
        producer: connection.producer,
        drain: Mutex::new(Some(drain)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use bytes::Bytes;

    fn brokers(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|s| s.to_string()).collect()
    }

    fn test_pool(cluster: &MemoryCluster, addrs: &[&str]) -> ProducerPool {
        let config = StoreConfig {
            pub_pool_size: 2,
            ..Default::default()
        };
        ProducerPool::new(
            "c1",
            brokers(addrs),
            Arc::new(cluster.clone()),
            &config,
            Arc::new(StoreMetrics::default()),
        )
    }

    #[tokio::test]
    async fn test_empty_broker_list_skips_factory() {
        let cluster = MemoryCluster::new("c1", 1);
        let pool = test_pool(&cluster, &[]);
        let cancel = CancellationToken::new();

        let err = pool.get_sync_producer(&cancel).await.unwrap_err();
        assert!(matches!(err, KatewayError::EmptyBrokerList { .. }));
        let err = pool.get_async_producer(&cancel).await.unwrap_err();
        assert!(matches!(err, KatewayError::EmptyBrokerList { .. }));
        assert_eq!(cluster.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_producer_publishes() {
        let cluster = MemoryCluster::new("c1", 2);
        let pool = test_pool(&cluster, &["10.0.0.1:9092"]);

        let producer = pool
            .get_sync_producer(&CancellationToken::new())
            .await
            .unwrap();
        let ack = producer
            .send(ProduceMessage::new("orders", Some(Bytes::from("k")), "v"))
            .await
            .unwrap();
        assert!(ack.partition < 2);
        assert_eq!(producer.cluster(), "c1");
        producer.release();

        assert_eq!(cluster.topic_len("orders"), 1);
        assert_eq!(pool.stats().0.idle, 1);
    }

    #[tokio::test]
    async fn test_connection_errors_surface_verbatim() {
        let cluster = MemoryCluster::new("c1", 1);
        cluster.fail_next_connects(1);
        let pool = test_pool(&cluster, &["10.0.0.1:9092"]);

        let err = pool
            .get_sync_producer(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KatewayError::ResourceAcquisitionFailed { .. }));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_same_broker_set_keeps_connections() {
        let cluster = MemoryCluster::new("c1", 1);
        let pool = test_pool(&cluster, &["10.0.0.1:9092", "10.0.0.2:9092"]);

        let producer = pool
            .get_sync_producer(&CancellationToken::new())
            .await
            .unwrap();
        let outcome = pool.refresh_broker_list(&brokers(&["10.0.0.2:9092", "10.0.0.1:9092"]));

        assert_eq!(outcome, RefreshOutcome::Unchanged);
        assert!(producer.is_open());
        assert_eq!(pool.broker_list(), brokers(&["10.0.0.1:9092", "10.0.0.2:9092"]));
    }

    #[tokio::test]
    async fn test_changed_broker_set_rebuilds() {
        let cluster = MemoryCluster::new("c1", 1);
        let pool = test_pool(&cluster, &["10.0.0.1:9092"]);
        let cancel = CancellationToken::new();

        let stale_sync = pool.get_sync_producer(&cancel).await.unwrap();
        let stale_async = pool.get_async_producer(&cancel).await.unwrap();

        let outcome = pool.refresh_broker_list(&brokers(&["10.0.0.2:9092"]));
        assert_eq!(outcome, RefreshOutcome::Rebuilt);
        assert!(!stale_sync.is_open());
        assert!(!stale_async.is_open());
        assert!(stale_sync
            .send(ProduceMessage::new("orders", None, "late"))
            .await
            .is_err());

        let fresh = pool.get_sync_producer(&cancel).await.unwrap();
        assert!(fresh.is_open());
        assert_ne!(fresh.id(), stale_sync.id());
        assert_eq!(
            cluster.connected_brokers().last().cloned(),
            Some(brokers(&["10.0.0.2:9092"]))
        );
        stale_sync.release();
        stale_async.release();
    }

    #[tokio::test]
    async fn test_empty_refresh_is_refused() {
        let cluster = MemoryCluster::new("c1", 1);
        let pool = test_pool(&cluster, &["10.0.0.1:9092"]);
        let producer = pool
            .get_sync_producer(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(pool.refresh_broker_list(&[]), RefreshOutcome::Refused);
        assert!(producer.is_open());
        assert_eq!(pool.broker_list(), brokers(&["10.0.0.1:9092"]));
    }

    #[tokio::test]
    async fn test_async_drain_logs_and_exits_on_close() {
        let cluster = MemoryCluster::new("c1", 1);
        cluster.fail_next_async_sends(2);
        let metrics = Arc::new(StoreMetrics::default());
        let pool = ProducerPool::new(
            "c1",
            brokers(&["10.0.0.1:9092"]),
            Arc::new(cluster.clone()),
            &StoreConfig::default(),
            metrics.clone(),
        );

        let producer = pool
            .get_async_producer(&CancellationToken::new())
            .await
            .unwrap();
        for i in 0..3 {
            producer
                .send(ProduceMessage::new("orders", None, format!("m{}", i)))
                .unwrap();
        }
        assert!(!producer.drain_finished());

        pool.close();
        assert_eq!(producer.join_drain().await, 2);
        assert_eq!(metrics.snapshot().async_delivery_errors, 2);
        assert_eq!(cluster.topic_len("orders"), 1);
    }

    #[tokio::test]
    async fn test_aborted_drain_reports_no_errors() {
        let cluster = MemoryCluster::new("c1", 1);
        let pool = test_pool(&cluster, &["10.0.0.1:9092"]);
        let producer = pool
            .get_async_producer(&CancellationToken::new())
            .await
            .unwrap();

        if let Some(handle) = producer.drain.lock().as_ref() {
            handle.abort();
        }
        assert_eq!(producer.join_drain().await, 0);
        assert!(producer.drain_finished());
        pool.close();
    }

    #[tokio::test]
    async fn test_connections_use_hostname_as_client_id() {
        let cluster = MemoryCluster::new("c1", 1);
        let config = StoreConfig {
            hostname: "gw-01".to_string(),
            ..Default::default()
        };
        let pool = ProducerPool::new(
            "c1",
            brokers(&["10.0.0.1:9092"]),
            Arc::new(cluster.clone()),
            &config,
            Arc::new(StoreMetrics::default()),
        );
        let cancel = CancellationToken::new();

        pool.get_sync_producer(&cancel).await.unwrap().release();
        pool.get_async_producer(&cancel).await.unwrap().release();
        assert_eq!(cluster.client_ids(), vec!["gw-01".to_string(), "gw-01".to_string()]);
        pool.close();
    }
}
