//! Consumer group registry
//!
//! Handles are keyed by (topic, group, client) and kept in a three-level map
//! guarded by one async mutex. The whole lookup, admission and join sequence
//! runs under that lock, so subscribes for different keys are serialized.

use crate::backend::{ConsumeRecord, GroupCoordinator, GroupMembership, MessageStream};
use crate::config::{GroupJoinConfig, OffsetPolicy, StoreConfig};
use crate::directory::BrokerDirectory;
use crate::error::KatewayError;
use crate::metrics::StoreMetrics;
use crate::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Identity of one subscriber's group membership
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub topic: String,
    pub group: String,
    pub client: String,
}

impl HandleKey {
    pub fn new(topic: &str, group: &str, client: &str) -> Self {
        Self {
            topic: topic.to_string(),
            group: group.to_string(),
            client: client.to_string(),
        }
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{topic:{}, group:{}, client:{}}}",
            self.topic, self.group, self.client
        )
    }
}

/// A live consumer group membership owned by the registry.
///
/// Only the record stream and commits are exposed. Leaving the group goes
/// through the registry, which makes the final offset commit.
pub struct ConsumerGroupHandle {
    key: HandleKey,
    membership: Arc<dyn GroupMembership>,
    join_config: GroupJoinConfig,
    joined_at: Instant,
}

impl ConsumerGroupHandle {
    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn join_config(&self) -> &GroupJoinConfig {
        &self.join_config
    }

    pub fn joined_at(&self) -> Instant {
        self.joined_at
    }

    /// Records from the partitions currently assigned to this member
    pub fn messages(&self) -> MessageStream {
        self.membership.messages()
    }

    pub fn commit(&self, record: &ConsumeRecord) -> Result<()> {
        self.membership.commit(record)
    }

    async fn close(&self) -> Result<()> {
        self.membership.close().await
    }
}

impl fmt::Debug for ConsumerGroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerGroupHandle")
            .field("key", &self.key)
            .field("join_config", &self.join_config)
            .finish()
    }
}

type ClientMap = HashMap<String, Arc<ConsumerGroupHandle>>;
type GroupMap = HashMap<String, ClientMap>;

#[derive(Default)]
struct RegistryState {
    // topic -> group -> client -> handle
    handles: HashMap<String, GroupMap>,
    shut_down: bool,
}

impl RegistryState {
    fn get(&self, key: &HandleKey) -> Option<Arc<ConsumerGroupHandle>> {
        self.handles
            .get(&key.topic)
            .and_then(|groups| groups.get(&key.group))
            .and_then(|clients| clients.get(&key.client))
            .cloned()
    }

    fn insert(&mut self, handle: Arc<ConsumerGroupHandle>) {
        let key = handle.key.clone();
        self.handles
            .entry(key.topic)
            .or_default()
            .entry(key.group)
            .or_default()
            .insert(key.client, handle);
    }

    /// Remove a handle and prune map levels left empty
    fn remove(&mut self, key: &HandleKey) -> Option<Arc<ConsumerGroupHandle>> {
        let groups = self.handles.get_mut(&key.topic)?;
        let clients = groups.get_mut(&key.group)?;
        let handle = clients.remove(&key.client)?;
        if clients.is_empty() {
            groups.remove(&key.group);
        }
        if groups.is_empty() {
            self.handles.remove(&key.topic);
        }
        Some(handle)
    }

    fn keys_of_client(&self, client: &str) -> Vec<HandleKey> {
        let mut keys = Vec::new();
        for (topic, groups) in &self.handles {
            for (group, clients) in groups {
                if clients.contains_key(client) {
                    keys.push(HandleKey::new(topic, group, client));
                }
            }
        }
        keys
    }

    fn drain(&mut self) -> Vec<Arc<ConsumerGroupHandle>> {
        std::mem::take(&mut self.handles)
            .into_values()
            .flat_map(HashMap::into_values)
            .flat_map(HashMap::into_values)
            .collect()
    }

    fn len(&self) -> usize {
        self.handles
            .values()
            .flat_map(HashMap::values)
            .map(HashMap::len)
            .sum()
    }
}

/// Registry of consumer group handles of one cluster
pub struct ConsumerGroupRegistry {
    cluster: String,
    directory: Arc<dyn BrokerDirectory>,
    coordinator: Arc<dyn GroupCoordinator>,
    config: StoreConfig,
    metrics: Arc<StoreMetrics>,
    state: Mutex<RegistryState>,
}

impl ConsumerGroupRegistry {
    pub fn new(
        directory: Arc<dyn BrokerDirectory>,
        coordinator: Arc<dyn GroupCoordinator>,
        config: StoreConfig,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            cluster: config.sub_cluster.clone(),
            directory,
            coordinator,
            config,
            metrics,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Return the live handle for the key, or admit and join a new member.
    ///
    /// The online consumer count and the partition count are two separate
    /// directory reads, so admissions racing at the partition boundary may
    /// both pass.
    pub async fn pick_or_create(
        &self,
        topic: &str,
        group: &str,
        client: &str,
        initial_offset: OffsetPolicy,
    ) -> Result<Arc<ConsumerGroupHandle>> {
        let key = HandleKey::new(topic, group, client);
        let mut state = self.state.lock().await;
        if state.shut_down {
            return Err(KatewayError::StoreShutDown);
        }

        if let Some(handle) = state.get(&key) {
            return Ok(handle);
        }

        let online = self
            .directory
            .online_consumer_count(&self.cluster, topic, group);
        let partitions = self.directory.partition_count(&self.cluster, topic);
        if online >= partitions {
            self.metrics.record_admission_refusal();
            warn!(
                "{} refused: {} online consumers, {} partitions",
                key, online, partitions
            );
            return Err(KatewayError::too_many_consumers(topic, group));
        }

        let zk = self.directory.zk_coordinates(&self.cluster);
        let join_config = self.config.group_join_config(initial_offset);
        let attempts = self.config.join_attempts.max(1);

        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.coordinator.join(group, topic, &zk, &join_config).await {
                Ok(membership) => {
                    let handle = Arc::new(ConsumerGroupHandle {
                        key: key.clone(),
                        membership,
                        join_config,
                        joined_at: Instant::now(),
                    });
                    state.insert(handle.clone());
                    self.metrics.record_subscribe();
                    info!("consumer {} joined on attempt {}", key, attempt);
                    return Ok(handle);
                }
                Err(err) => {
                    debug!("consumer {} join attempt {} failed: {}", key, attempt, err);
                    last_err = Some(err);
                }
            }
        }

        self.metrics.record_join_failure();
        let source = last_err.unwrap_or_else(|| KatewayError::backend("no join attempt made"));
        error!("consumer {} join failed after {} attempts: {}", key, attempts, source);
        Err(KatewayError::GroupJoinFailed {
            group: group.to_string(),
            attempts,
            source: Box::new(source),
        })
    }

    /// Leave the group and drop the handle. Returns whether a handle existed.
    pub async fn evict(&self, topic: &str, group: &str, client: &str) -> bool {
        let key = HandleKey::new(topic, group, client);
        let mut state = self.state.lock().await;
        let Some(handle) = state.remove(&key) else {
            return false;
        };
        self.close_handle(&handle).await;
        true
    }

    /// Evict every handle owned by `client`
    pub async fn evict_client(&self, client: &str) -> usize {
        let mut state = self.state.lock().await;
        let keys = state.keys_of_client(client);
        let mut evicted = 0;
        for key in keys {
            if let Some(handle) = state.remove(&key) {
                self.close_handle(&handle).await;
                evicted += 1;
            }
        }
        evicted
    }

    async fn close_handle(&self, handle: &ConsumerGroupHandle) {
        // will flush offsets
        match handle.close().await {
            Ok(()) => info!("consumer {} closed", handle.key),
            Err(err) => {
                self.metrics.record_close_error();
                error!("consumer {} close: {}", handle.key, err);
            }
        }
        self.metrics.record_eviction();
    }

    /// Close every handle concurrently and refuse further subscribes
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shut_down = true;
        let handles = state.drain();
        let total = handles.len();

        let mut closes = JoinSet::new();
        for handle in handles {
            let metrics = self.metrics.clone();
            closes.spawn(async move {
                if let Err(err) = handle.close().await {
                    metrics.record_close_error();
                    error!("consumer {} close: {}", handle.key, err);
                }
            });
        }

        // wait for all members to commit their offsets
        while let Some(joined) = closes.join_next().await {
            if let Err(err) = joined {
                error!("consumer close task failed: {}", err);
            }
        }

        info!("consumer group registry shut down, {} members closed", total);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, topic: &str, group: &str, client: &str) -> bool {
        self.state
            .lock()
            .await
            .get(&HandleKey::new(topic, group, client))
            .is_some()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.lock().await.shut_down
    }
}

impl fmt::Debug for ConsumerGroupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerGroupRegistry")
            .field("cluster", &self.cluster)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{StaticDirectory, ZkCoordinates};
    use crate::memory::MemoryCluster;
    use std::time::Duration;

    struct Fixture {
        cluster: MemoryCluster,
        directory: Arc<StaticDirectory>,
        metrics: Arc<StoreMetrics>,
        registry: ConsumerGroupRegistry,
    }

    fn fixture(partitions: usize) -> Fixture {
        let cluster = MemoryCluster::new("c1", partitions);
        cluster.create_topic("orders", partitions);
        let directory = Arc::new(StaticDirectory::new());
        directory.add_cluster(
            "c1",
            ["10.0.0.1:9092"],
            ZkCoordinates::new(["zk1:2181"], "/kafka/c1"),
        );
        directory.set_partitions("c1", "orders", partitions);
        directory.attach_member_source("c1", Arc::new(cluster.clone()));

        let config = StoreConfig {
            sub_cluster: "c1".to_string(),
            ..Default::default()
        };
        let metrics = Arc::new(StoreMetrics::default());
        let registry = ConsumerGroupRegistry::new(
            directory.clone(),
            Arc::new(cluster.clone()),
            config,
            metrics.clone(),
        );
        Fixture {
            cluster,
            directory,
            metrics,
            registry,
        }
    }

    #[tokio::test]
    async fn test_same_key_returns_same_handle() {
        let f = fixture(3);

        let first = f
            .registry
            .pick_or_create("orders", "billing", "client-1", OffsetPolicy::Oldest)
            .await
            .unwrap();
        let second = f
            .registry
            .pick_or_create("orders", "billing", "client-1", OffsetPolicy::Oldest)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.cluster.join_count(), 1);
        assert_eq!(f.registry.len().await, 1);
        assert_eq!(first.key().client, "client-1");
    }

    #[tokio::test]
    async fn test_admission_refused_at_partition_count() {
        let f = fixture(3);
        f.directory.set_online_consumers("c1", "orders", "billing", 3);

        let err = f
            .registry
            .pick_or_create("orders", "billing", "client-4", OffsetPolicy::Oldest)
            .await
            .unwrap_err();

        assert!(err.is_admission_refusal());
        assert_eq!(f.cluster.join_attempts(), 0);
        assert!(f.registry.is_empty().await);
        assert_eq!(f.metrics.snapshot().admission_refusals, 1);
    }

    #[tokio::test]
    async fn test_own_members_count_towards_admission() {
        let f = fixture(1);

        f.registry
            .pick_or_create("orders", "billing", "client-1", OffsetPolicy::Oldest)
            .await
            .unwrap();
        let err = f
            .registry
            .pick_or_create("orders", "billing", "client-2", OffsetPolicy::Oldest)
            .await
            .unwrap_err();
        assert!(err.is_admission_refusal());
        assert_eq!(f.registry.len().await, 1);
        assert_eq!(f.cluster.join_count(), 1);

        // a different group has its own budget
        assert!(f
            .registry
            .pick_or_create("orders", "audit", "client-2", OffsetPolicy::Oldest)
            .await
            .is_ok());

        // leaving frees the slot
        assert!(f.registry.evict("orders", "billing", "client-1").await);
        assert!(f
            .registry
            .pick_or_create("orders", "billing", "client-2", OffsetPolicy::Oldest)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unknown_topic_is_refused() {
        let f = fixture(1);
        let err = f
            .registry
            .pick_or_create("missing", "billing", "client-1", OffsetPolicy::Oldest)
            .await
            .unwrap_err();
        assert!(matches!(err, KatewayError::TooManyConsumers { .. }));
    }

    #[tokio::test]
    async fn test_join_retry_then_cached() {
        let f = fixture(3);
        f.cluster.fail_next_joins(1);

        let handle = f
            .registry
            .pick_or_create("orders", "billing", "client-1", OffsetPolicy::Oldest)
            .await
            .unwrap();
        assert_eq!(f.cluster.join_attempts(), 2);

        let again = f
            .registry
            .pick_or_create("orders", "billing", "client-1", OffsetPolicy::Oldest)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
        assert_eq!(f.cluster.join_attempts(), 2);
    }

    #[tokio::test]
    async fn test_join_exhaustion_wraps_last_error() {
        let f = fixture(3);
        f.cluster.fail_next_joins(3);

        let err = f
            .registry
            .pick_or_create("orders", "billing", "client-1", OffsetPolicy::Oldest)
            .await
            .unwrap_err();

        match err {
            KatewayError::GroupJoinFailed {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, KatewayError::Backend { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.cluster.join_attempts(), 3);
        assert!(!f.registry.contains("orders", "billing", "client-1").await);
        assert_eq!(f.metrics.snapshot().join_failures, 1);
    }

    #[tokio::test]
    async fn test_evict_prunes_and_closes() {
        let f = fixture(3);
        f.registry
            .pick_or_create("orders", "billing", "client-1", OffsetPolicy::Oldest)
            .await
            .unwrap();

        assert!(f.registry.evict("orders", "billing", "client-1").await);
        assert!(!f.registry.evict("orders", "billing", "client-1").await);
        assert_eq!(f.cluster.close_count(), 1);
        assert_eq!(f.cluster.live_members("orders", "billing"), 0);
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_evict_client_removes_all_its_handles() {
        let f = fixture(3);
        f.directory.set_partitions("c1", "payments", 1);
        for (topic, group) in [("orders", "billing"), ("orders", "audit"), ("payments", "billing")] {
            f.registry
                .pick_or_create(topic, group, "client-1", OffsetPolicy::Oldest)
                .await
                .unwrap();
        }
        f.registry
            .pick_or_create("orders", "billing", "client-2", OffsetPolicy::Oldest)
            .await
            .unwrap();

        assert_eq!(f.registry.evict_client("client-1").await, 3);
        assert_eq!(f.registry.len().await, 1);
        assert!(f.registry.contains("orders", "billing", "client-2").await);
        assert_eq!(f.metrics.snapshot().evictions, 3);
    }

    #[tokio::test]
    async fn test_close_failure_is_logged_not_surfaced() {
        let f = fixture(3);
        f.cluster.set_fail_closes(true);
        f.registry
            .pick_or_create("orders", "billing", "client-1", OffsetPolicy::Oldest)
            .await
            .unwrap();

        assert!(f.registry.evict("orders", "billing", "client-1").await);
        assert!(f.registry.is_empty().await);
        assert_eq!(f.metrics.snapshot().close_errors, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_each_handle_once() {
        let f = fixture(8);
        f.cluster.set_close_delay(Duration::from_millis(15));
        for i in 0..5 {
            f.registry
                .pick_or_create("orders", "billing", &format!("client-{}", i), OffsetPolicy::Oldest)
                .await
                .unwrap();
        }

        f.registry.shutdown().await;

        assert_eq!(f.cluster.close_count(), 5);
        assert!(f.registry.is_empty().await);
        assert!(f.registry.is_shut_down().await);

        let err = f
            .registry
            .pick_or_create("orders", "billing", "client-9", OffsetPolicy::Oldest)
            .await
            .unwrap_err();
        assert!(matches!(err, KatewayError::StoreShutDown));
    }
}
