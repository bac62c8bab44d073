//! Pub/sub store facade called by the gateway's HTTP layer
//!
//! [`PubStore`] routes publishes to the producer pool of the named cluster and
//! keeps every pool's broker list in step with the directory. [`SubStore`]
//! hands out consumer group subscriptions and tears them down when the
//! client's connection goes away.

use crate::backend::{ConsumeRecord, GroupCoordinator, MessageStream, ProduceAck, ProduceMessage, ProducerConnector};
use crate::config::{OffsetPolicy, StoreConfig};
use crate::directory::BrokerDirectory;
use crate::error::KatewayError;
use crate::metrics::StoreMetrics;
use crate::pool::{PoolStats, Resource};
use crate::producer::{ProducerPool, RefreshOutcome};
use crate::subscriber::{ConsumerGroupHandle, ConsumerGroupRegistry};
use crate::Result;
use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Publish side of the store: one [`ProducerPool`] per cluster
pub struct PubStore {
    directory: Arc<dyn BrokerDirectory>,
    connector: Arc<dyn ProducerConnector>,
    config: StoreConfig,
    metrics: Arc<StoreMetrics>,
    pools: DashMap<String, Arc<ProducerPool>>,
    shutdown: CancellationToken,
}

impl PubStore {
    /// Build a producer pool for every cluster the directory knows
    pub fn new(
        directory: Arc<dyn BrokerDirectory>,
        connector: Arc<dyn ProducerConnector>,
        config: StoreConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        let store = Self {
            directory,
            connector,
            config,
            metrics,
            pools: DashMap::new(),
            shutdown: CancellationToken::new(),
        };
        for cluster in store.directory.cluster_names() {
            store.add_cluster(&cluster);
        }
        info!("pub store started with {} clusters", store.pools.len());
        store
    }

    fn add_cluster(&self, cluster: &str) -> Arc<ProducerPool> {
        let brokers = self.directory.broker_list(cluster);
        debug!("cluster[{}] producer pool on {:?}", cluster, brokers);
        let pool = Arc::new(ProducerPool::new(
            cluster,
            brokers,
            self.connector.clone(),
            &self.config,
            self.metrics.clone(),
        ));
        self.pools.insert(cluster.to_string(), pool.clone());
        pool
    }

    fn pool(&self, cluster: &str) -> Result<Arc<ProducerPool>> {
        if self.shutdown.is_cancelled() {
            return Err(KatewayError::StoreShutDown);
        }
        self.pools
            .get(cluster)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KatewayError::UnknownCluster {
                cluster: cluster.to_string(),
            })
    }

    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn broker_list(&self, cluster: &str) -> Result<Vec<String>> {
        Ok(self.pool(cluster)?.broker_list())
    }

    /// Sync and async pool stats of a cluster
    pub fn stats(&self, cluster: &str) -> Result<(PoolStats, PoolStats)> {
        Ok(self.pool(cluster)?.stats())
    }

    /// Publish one message.
    ///
    /// With `require_ack` the call waits for the local broker and returns
    /// where the message landed; otherwise it only enqueues. A connection
    /// found closed by a broker refresh is dropped and the publish retried
    /// once on a fresh one.
    pub async fn publish(
        &self,
        cluster: &str,
        topic: &str,
        key: Option<Bytes>,
        payload: Bytes,
        require_ack: bool,
    ) -> Result<Option<ProduceAck>> {
        let message = ProduceMessage {
            topic: topic.to_string(),
            key,
            value: payload,
        };

        let result = if require_ack {
            self.publish_sync(cluster, message).await.map(Some)
        } else {
            self.publish_async(cluster, message).await.map(|_| None)
        };

        match &result {
            Ok(_) => self.metrics.record_publish(),
            Err(err) => {
                self.metrics.record_publish_error();
                debug!("cluster[{}] publish {}: {}", cluster, topic, err);
            }
        }
        result
    }

    async fn publish_sync(&self, cluster: &str, message: ProduceMessage) -> Result<ProduceAck> {
        for attempt in 0..2 {
            let pool = self.pool(cluster)?;
            let producer = match pool.get_sync_producer(&self.shutdown).await {
                Ok(producer) => producer,
                Err(KatewayError::PoolClosed { .. }) if attempt == 0 => continue,
                Err(err) => return Err(err),
            };

            let sent = producer.send(message.clone()).await;
            match sent {
                Ok(ack) => return Ok(ack),
                Err(err) if !producer.is_open() => {
                    producer.discard();
                    if attempt > 0 {
                        return Err(err);
                    }
                    trace!("cluster[{}] stale producer, retrying publish", cluster);
                }
                Err(err) => return Err(err),
            }
        }
        Err(KatewayError::acquisition(format!(
            "cluster[{}] no usable producer",
            cluster
        )))
    }

    async fn publish_async(&self, cluster: &str, message: ProduceMessage) -> Result<()> {
        for attempt in 0..2 {
            let pool = self.pool(cluster)?;
            let producer = match pool.get_async_producer(&self.shutdown).await {
                Ok(producer) => producer,
                Err(KatewayError::PoolClosed { .. }) if attempt == 0 => continue,
                Err(err) => return Err(err),
            };

            match producer.send(message.clone()) {
                Ok(()) => return Ok(()),
                Err(err) if !producer.is_open() => {
                    producer.discard();
                    if attempt > 0 {
                        return Err(err);
                    }
                    trace!("cluster[{}] stale producer, retrying publish", cluster);
                }
                Err(err) => return Err(err),
            }
        }
        Err(KatewayError::acquisition(format!(
            "cluster[{}] no usable producer",
            cluster
        )))
    }

    /// Apply a new broker list to one cluster's producer pool
    pub fn refresh_brokers(&self, cluster: &str, brokers: &[String]) -> Result<RefreshOutcome> {
        Ok(self.pool(cluster)?.refresh_broker_list(brokers))
    }

    /// Re-read every cluster's broker list from the directory. Clusters the
    /// directory added since the last pass get a new pool.
    pub fn refresh_from_directory(&self) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }

        let mut rebuilt = 0;
        for cluster in self.directory.cluster_names() {
            let existing = self.pools.get(&cluster).map(|e| e.value().clone());
            match existing {
                Some(pool) => {
                    let brokers = self.directory.broker_list(&cluster);
                    if pool.refresh_broker_list(&brokers) == RefreshOutcome::Rebuilt {
                        rebuilt += 1;
                    }
                }
                None => {
                    info!("cluster[{}] discovered", cluster);
                    self.add_cluster(&cluster);
                }
            }
        }
        rebuilt
    }

    /// Follow directory refresh events, plus a periodic resync, until
    /// `cancel` fires
    pub fn spawn_broker_watcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        let mut refresh = store.directory.subscribe_refresh();
        let mut ticker = tokio::time::interval(store.config.broker_refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tokio::spawn(async move {
            let mut events_open = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = refresh.recv(), if events_open => match event {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            store.refresh_from_directory();
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("directory refresh events closed, polling only");
                            events_open = false;
                        }
                    },
                    _ = ticker.tick() => {
                        store.refresh_from_directory();
                    }
                }
            }
            trace!("broker watcher stopped");
        })
    }

    /// Cancel pending acquisitions and close every pool
    pub fn close(&self) {
        self.shutdown.cancel();
        for entry in self.pools.iter() {
            entry.value().close();
        }
        info!("pub store closed");
    }
}

impl std::fmt::Debug for PubStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubStore")
            .field("clusters", &self.cluster_names())
            .finish()
    }
}

/// A subscriber's handle plus its lazy record stream
pub struct Subscription {
    handle: Arc<ConsumerGroupHandle>,
    stream: MessageStream,
}

impl Subscription {
    pub fn handle(&self) -> &Arc<ConsumerGroupHandle> {
        &self.handle
    }

    /// Mark a record as processed
    pub fn commit(&self, record: &ConsumeRecord) -> Result<()> {
        self.handle.commit(record)
    }
}

impl Stream for Subscription {
    type Item = Result<ConsumeRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Subscribe side of the store
#[derive(Debug)]
pub struct SubStore {
    registry: Arc<ConsumerGroupRegistry>,
}

impl SubStore {
    pub fn new(
        directory: Arc<dyn BrokerDirectory>,
        coordinator: Arc<dyn GroupCoordinator>,
        config: StoreConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            registry: Arc::new(ConsumerGroupRegistry::new(
                directory,
                coordinator,
                config,
                metrics,
            )),
        }
    }

    pub fn registry(&self) -> &Arc<ConsumerGroupRegistry> {
        &self.registry
    }

    /// Join (or rejoin the live membership of) `group` on `topic` for
    /// `client`. `reset` of `newest` skips the backlog when the group has no
    /// committed offset.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        client: &str,
        reset: &str,
    ) -> Result<Subscription> {
        let handle = self
            .registry
            .pick_or_create(topic, group, client, OffsetPolicy::from_reset(reset))
            .await?;
        let stream = handle.messages();
        Ok(Subscription { handle, stream })
    }

    /// The client's connection closed: drop all its memberships
    pub async fn notify_client_closed(&self, client: &str) -> usize {
        let evicted = self.registry.evict_client(client).await;
        trace!("{} closed, {} subs killed", client, evicted);
        evicted
    }

    /// Evict clients named on `closed_conns` until `cancel` fires, then shut
    /// the registry down
    pub fn spawn(
        self: &Arc<Self>,
        mut closed_conns: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut conns_open = true;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    client = closed_conns.recv(), if conns_open => match client {
                        Some(client) => {
                            store.notify_client_closed(&client).await;
                        }
                        None => conns_open = false,
                    },
                }
            }

            store.registry.shutdown().await;
            info!("sub store stopped");
        })
    }
}
