//! Broker directory: cluster metadata the store reads but does not own
//!
//! Every value is an eventually consistent snapshot. Callers must not assume
//! that two reads (for example partition count and online consumer count)
//! observe the same moment.

use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Coordination service address and namespace of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZkCoordinates {
    pub addrs: Vec<String>,
    pub chroot: String,
}

impl ZkCoordinates {
    pub fn new<I, S>(addrs: I, chroot: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
            chroot: chroot.into(),
        }
    }
}

/// Source of live cluster metadata
pub trait BrokerDirectory: Send + Sync + 'static {
    /// All live cluster names
    fn cluster_names(&self) -> Vec<String>;

    /// Live broker addresses of a cluster, empty when unknown
    fn broker_list(&self, cluster: &str) -> Vec<String>;

    fn zk_coordinates(&self, cluster: &str) -> ZkCoordinates;

    /// Current partition count of a topic, 0 when unknown
    fn partition_count(&self, cluster: &str, topic: &str) -> usize;

    /// Members currently registered for a topic's consumer group
    fn online_consumer_count(&self, cluster: &str, topic: &str, group: &str) -> usize;

    /// Fires whenever the metadata has been refreshed
    fn subscribe_refresh(&self) -> broadcast::Receiver<()>;
}

/// Members currently registered with a cluster's coordination service
pub trait MemberSource: Send + Sync + 'static {
    fn online_members(&self, topic: &str, group: &str) -> usize;
}

#[derive(Debug, Clone, Default)]
struct ClusterMeta {
    brokers: Vec<String>,
    zk: ZkCoordinates,
    partitions: HashMap<String, usize>,
    /// Consumers registered outside any attached member source
    online: HashMap<(String, String), usize>,
}

/// In-memory [`BrokerDirectory`] fed through setters.
///
/// Online consumer counts are the externally registered count plus, for
/// clusters with an attached [`MemberSource`], the members that source
/// currently reports.
pub struct StaticDirectory {
    clusters: DashMap<String, ClusterMeta>,
    members: DashMap<String, Arc<dyn MemberSource>>,
    refresh_tx: broadcast::Sender<()>,
}

impl fmt::Debug for StaticDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticDirectory")
            .field("clusters", &self.clusters)
            .field("member_sources", &self.members.len())
            .finish()
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticDirectory {
    pub fn new() -> Self {
        let (refresh_tx, _) = broadcast::channel(16);
        Self {
            clusters: DashMap::new(),
            members: DashMap::new(),
            refresh_tx,
        }
    }

    /// Count the live members of `cluster`'s groups through `source`
    pub fn attach_member_source(&self, cluster: &str, source: Arc<dyn MemberSource>) {
        self.members.insert(cluster.to_string(), source);
    }

    pub fn add_cluster<I, S>(&self, cluster: &str, brokers: I, zk: ZkCoordinates)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut meta = self.clusters.entry(cluster.to_string()).or_default();
        meta.brokers = brokers.into_iter().map(Into::into).collect();
        meta.zk = zk;
    }

    /// Replace a cluster's broker list and notify refresh subscribers
    pub fn set_broker_list<I, S>(&self, cluster: &str, brokers: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clusters
            .entry(cluster.to_string())
            .or_default()
            .brokers = brokers.into_iter().map(Into::into).collect();
        self.notify_refresh();
    }

    pub fn set_partitions(&self, cluster: &str, topic: &str, partitions: usize) {
        self.clusters
            .entry(cluster.to_string())
            .or_default()
            .partitions
            .insert(topic.to_string(), partitions);
    }

    pub fn set_online_consumers(&self, cluster: &str, topic: &str, group: &str, count: usize) {
        self.clusters
            .entry(cluster.to_string())
            .or_default()
            .online
            .insert((topic.to_string(), group.to_string()), count);
    }

    pub fn notify_refresh(&self) {
        // no subscribers is fine
        let receivers = self.refresh_tx.send(()).unwrap_or(0);
        debug!("directory refreshed, {} watchers notified", receivers);
    }
}

impl BrokerDirectory for StaticDirectory {
    fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn broker_list(&self, cluster: &str) -> Vec<String> {
        self.clusters
            .get(cluster)
            .map(|meta| meta.brokers.clone())
            .unwrap_or_default()
    }

    fn zk_coordinates(&self, cluster: &str) -> ZkCoordinates {
        self.clusters
            .get(cluster)
            .map(|meta| meta.zk.clone())
            .unwrap_or_default()
    }

    fn partition_count(&self, cluster: &str, topic: &str) -> usize {
        self.clusters
            .get(cluster)
            .and_then(|meta| meta.partitions.get(topic).copied())
            .unwrap_or(0)
    }

    fn online_consumer_count(&self, cluster: &str, topic: &str, group: &str) -> usize {
        let external = self
            .clusters
            .get(cluster)
            .and_then(|meta| {
                meta.online
                    .get(&(topic.to_string(), group.to_string()))
                    .copied()
            })
            .unwrap_or(0);
        let source = self.members.get(cluster).map(|e| e.value().clone());
        let live = source
            .map(|source| source.online_members(topic, group))
            .unwrap_or(0);
        external + live
    }

    fn subscribe_refresh(&self) -> broadcast::Receiver<()> {
        self.refresh_tx.subscribe()
    }
}
