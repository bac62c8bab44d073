//! In-process message log used for local runs and tests
//!
//! [`MemoryCluster`] plays both the broker side (producer connections) and the
//! coordination side (consumer group membership) of one cluster. Topics are
//! created on first publish. Faults can be injected to exercise the store's
//! error paths.

use crate::backend::{
    AsyncConnection, AsyncProducer, ConsumeRecord, GroupCoordinator, GroupMembership,
    MessageStream, ProduceAck, ProduceMessage, ProducerConnector, ProducerError, SyncProducer,
};
use crate::config::{AsyncProducerConfig, GroupJoinConfig, OffsetPolicy, SyncProducerConfig};
use crate::directory::{MemberSource, ZkCoordinates};
use crate::error::KatewayError;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<Bytes>,
    value: Bytes,
}

type GroupKey = (String, String);

struct ClusterInner {
    name: String,
    default_partitions: usize,
    topics: RwLock<HashMap<String, Vec<Vec<StoredMessage>>>>,
    /// (group, topic) -> partition -> next offset to read
    committed: Mutex<HashMap<GroupKey, HashMap<u32, u64>>>,
    /// (topic, group) -> live member ids, ascending
    members: Mutex<HashMap<GroupKey, Vec<u64>>>,
    appended: watch::Sender<u64>,
    round_robin: AtomicU64,
    next_member: AtomicU64,

    unreachable: Mutex<HashSet<String>>,
    fail_connects: AtomicUsize,
    fail_joins: AtomicUsize,
    fail_async_sends: AtomicUsize,
    fail_closes: AtomicBool,
    close_delay: Mutex<Duration>,

    connected_brokers: Mutex<Vec<Vec<String>>>,
    client_ids: Mutex<Vec<String>>,
    joins: AtomicUsize,
    join_attempts: AtomicUsize,
    member_closes: AtomicUsize,
}

/// One in-memory cluster
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("name", &self.inner.name)
            .field("default_partitions", &self.inner.default_partitions)
            .finish()
    }
}

/// Take one unit from a fault counter, if any is left
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryCluster {
    pub fn new(name: impl Into<String>, default_partitions: usize) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(ClusterInner {
                name: name.into(),
                default_partitions: default_partitions.max(1),
                topics: RwLock::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                members: Mutex::new(HashMap::new()),
                appended,
                round_robin: AtomicU64::new(0),
                next_member: AtomicU64::new(0),
                unreachable: Mutex::new(HashSet::new()),
                fail_connects: AtomicUsize::new(0),
                fail_joins: AtomicUsize::new(0),
                fail_async_sends: AtomicUsize::new(0),
                fail_closes: AtomicBool::new(false),
                close_delay: Mutex::new(Duration::ZERO),
                connected_brokers: Mutex::new(Vec::new()),
                client_ids: Mutex::new(Vec::new()),
                joins: AtomicUsize::new(0),
                join_attempts: AtomicUsize::new(0),
                member_closes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create a topic, or resize an existing one upwards
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut topics = self.inner.topics.write();
        let logs = topics.entry(topic.to_string()).or_default();
        while logs.len() < partitions.max(1) {
            logs.push(Vec::new());
        }
    }

    pub fn partition_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of messages stored in one partition
    pub fn partition_len(&self, topic: &str, partition: u32) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn topic_len(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|logs| logs.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.inner
            .committed
            .lock()
            .get(&(group.to_string(), topic.to_string()))
            .and_then(|offsets| offsets.get(&partition).copied())
    }

    pub fn live_members(&self, topic: &str, group: &str) -> usize {
        self.inner
            .members
            .lock()
            .get(&(topic.to_string(), group.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    // fault injection

    pub fn set_unreachable<I, S>(&self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.inner.unreachable.lock() = addrs.into_iter().map(Into::into).collect();
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_joins(&self, n: usize) {
        self.inner.fail_joins.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` asynchronous sends fail delivery
    pub fn fail_next_async_sends(&self, n: usize) {
        self.inner.fail_async_sends.store(n, Ordering::SeqCst);
    }

    /// Make every membership close report a failed offset commit
    pub fn set_fail_closes(&self, fail: bool) {
        self.inner.fail_closes.store(fail, Ordering::SeqCst);
    }

    /// Base delay of membership closes; member `n` waits `n % 3` times it
    pub fn set_close_delay(&self, delay: Duration) {
        *self.inner.close_delay.lock() = delay;
    }

    // observation

    /// Broker lists of every successful producer connection, in order
    pub fn connected_brokers(&self) -> Vec<Vec<String>> {
        self.inner.connected_brokers.lock().clone()
    }

    /// Client ids of every successful producer connection, in order
    pub fn client_ids(&self) -> Vec<String> {
        self.inner.client_ids.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connected_brokers.lock().len()
    }

    pub fn join_attempts(&self) -> usize {
        self.inner.join_attempts.load(Ordering::SeqCst)
    }

    pub fn join_count(&self) -> usize {
        self.inner.joins.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.member_closes.load(Ordering::SeqCst)
    }

    fn dial(&self, brokers: &[String], client_id: &str) -> Result<()> {
        if take_fault(&self.inner.fail_connects) {
            return Err(KatewayError::acquisition(format!(
                "dial {:?}: connection refused",
                brokers
            )));
        }
        let unreachable = self.inner.unreachable.lock();
        if brokers.iter().all(|b| unreachable.contains(b)) {
            return Err(KatewayError::acquisition(format!(
                "client has run out of available brokers to talk to: {:?}",
                brokers
            )));
        }
        drop(unreachable);

        self.inner.connected_brokers.lock().push(brokers.to_vec());
        self.inner.client_ids.lock().push(client_id.to_string());
        Ok(())
    }
}

impl ClusterInner {
    fn append(&self, message: ProduceMessage) -> ProduceAck {
        let ack = {
            let mut topics = self.topics.write();
            let logs = topics.entry(message.topic.clone()).or_default();
            while logs.len() < self.default_partitions {
                logs.push(Vec::new());
            }

            let partition = match &message.key {
                Some(key) => hash_partition(key, logs.len()),
                None => (self.round_robin.fetch_add(1, Ordering::Relaxed) as usize) % logs.len(),
            };
            let log = &mut logs[partition];
            log.push(StoredMessage {
                key: message.key,
                value: message.value,
            });
            ProduceAck {
                partition: partition as u32,
                offset: (log.len() - 1) as u64,
            }
        };

        self.appended.send_modify(|seq| *seq += 1);
        trace!(
            "cluster[{}] appended {}:{}@{}",
            self.name,
            message.topic,
            ack.partition,
            ack.offset
        );
        ack
    }

    /// Partitions of `topic` owned by `member`, spread by member rank
    fn assigned_partitions(&self, topic: &str, group: &str, member: u64, count: usize) -> Vec<u32> {
        let members = self.members.lock();
        let Some(ids) = members.get(&(topic.to_string(), group.to_string())) else {
            return Vec::new();
        };
        let Some(rank) = ids.iter().position(|id| *id == member) else {
            return Vec::new();
        };
        (0..count)
            .filter(|p| p % ids.len() == rank)
            .map(|p| p as u32)
            .collect()
    }
}

/// FNV-1a of the key, stable across processes
fn hash_partition(key: &[u8], partition_count: usize) -> usize {
    let mut hash = 2166136261u32;
    for byte in key {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    (hash as usize) % partition_count
}

struct MemorySyncProducer {
    cluster: Arc<ClusterInner>,
    closed: AtomicBool,
}

#[async_trait]
impl SyncProducer for MemorySyncProducer {
    async fn send(&self, message: ProduceMessage) -> Result<ProduceAck> {
        if self.is_closed() {
            return Err(KatewayError::backend("kafka: tried to use a client that was closed"));
        }
        Ok(self.cluster.append(message))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MemoryAsyncProducer {
    cluster: Arc<ClusterInner>,
    closed: AtomicBool,
    errors: Mutex<Option<mpsc::UnboundedSender<ProducerError>>>,
}

impl AsyncProducer for MemoryAsyncProducer {
    fn send(&self, message: ProduceMessage) -> Result<()> {
        if self.is_closed() {
            return Err(KatewayError::backend("kafka: tried to use a client that was closed"));
        }

        if take_fault(&self.cluster.fail_async_sends) {
            if let Some(errors) = self.errors.lock().as_ref() {
                let _ = errors.send(ProducerError {
                    message,
                    reason: "kafka server: message was too large".to_string(),
                });
            }
            return Ok(());
        }

        self.cluster.append(message);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // dropping the sender ends the error stream
        self.errors.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProducerConnector for MemoryCluster {
    async fn connect_sync(
        &self,
        brokers: &[String],
        config: &SyncProducerConfig,
    ) -> Result<Box<dyn SyncProducer>> {
        self.dial(brokers, &config.client_id)?;
        Ok(Box::new(MemorySyncProducer {
            cluster: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn connect_async(
        &self,
        brokers: &[String],
        config: &AsyncProducerConfig,
    ) -> Result<AsyncConnection> {
        self.dial(brokers, &config.client_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(AsyncConnection {
            producer: Box::new(MemoryAsyncProducer {
                cluster: self.inner.clone(),
                closed: AtomicBool::new(false),
                errors: Mutex::new(Some(tx)),
            }),
            errors: rx,
        })
    }
}

impl MemberSource for MemoryCluster {
    fn online_members(&self, topic: &str, group: &str) -> usize {
        self.live_members(topic, group)
    }
}

struct MemberState {
    id: u64,
    topic: String,
    group: String,
    initial_offset: OffsetPolicy,
    commit_interval: Duration,
    cluster: Arc<ClusterInner>,
    cursors: Mutex<HashMap<u32, u64>>,
    pending: Mutex<HashMap<u32, u64>>,
    last_flush: Mutex<Instant>,
    closed: CancellationToken,
}

impl MemberState {
    fn group_key(&self) -> GroupKey {
        (self.group.clone(), self.topic.clone())
    }

    fn next_record(&self) -> Option<ConsumeRecord> {
        let topics = self.cluster.topics.read();
        let logs = topics.get(&self.topic)?;
        let assigned =
            self.cluster
                .assigned_partitions(&self.topic, &self.group, self.id, logs.len());

        let mut cursors = self.cursors.lock();
        for partition in assigned {
            let log = &logs[partition as usize];
            let cursor = match cursors.get(&partition) {
                Some(cursor) => *cursor,
                None => self.start_offset(partition, log.len()),
            };
            if let Some(message) = log.get(cursor as usize) {
                cursors.insert(partition, cursor + 1);
                return Some(ConsumeRecord {
                    topic: self.topic.clone(),
                    key: message.key.clone(),
                    value: message.value.clone(),
                    partition,
                    offset: cursor,
                });
            }
            cursors.insert(partition, cursor);
        }
        None
    }

    fn start_offset(&self, partition: u32, log_len: usize) -> u64 {
        let committed = self
            .cluster
            .committed
            .lock()
            .get(&self.group_key())
            .and_then(|offsets| offsets.get(&partition).copied());
        match (committed, self.initial_offset) {
            (Some(offset), _) => offset,
            (None, OffsetPolicy::Oldest) => 0,
            (None, OffsetPolicy::Newest) => log_len as u64,
        }
    }

    fn flush(&self) {
        let pending: Vec<(u32, u64)> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            let mut committed = self.cluster.committed.lock();
            let offsets = committed.entry(self.group_key()).or_default();
            for (partition, offset) in pending {
                let current = offsets.entry(partition).or_insert(0);
                *current = (*current).max(offset);
            }
        }
        *self.last_flush.lock() = Instant::now();
    }

    fn maybe_flush(&self) {
        let due = self.last_flush.lock().elapsed() >= self.commit_interval;
        if due {
            self.flush();
        }
    }

    fn leave(&self) {
        let mut members = self.cluster.members.lock();
        let key = (self.topic.clone(), self.group.clone());
        if let Some(ids) = members.get_mut(&key) {
            ids.retain(|id| *id != self.id);
            if ids.is_empty() {
                members.remove(&key);
            }
        }
    }
}

struct MemoryMembership {
    state: Arc<MemberState>,
}

#[async_trait]
impl GroupMembership for MemoryMembership {
    fn messages(&self) -> MessageStream {
        let state = self.state.clone();
        let appended = self.state.cluster.appended.subscribe();

        Box::pin(futures::stream::unfold(
            (state, appended),
            |(state, mut appended)| async move {
                loop {
                    if state.closed.is_cancelled() {
                        return None;
                    }
                    appended.borrow_and_update();
                    state.maybe_flush();
                    if let Some(record) = state.next_record() {
                        return Some((Ok(record), (state, appended)));
                    }

                    tokio::select! {
                        _ = state.closed.cancelled() => return None,
                        changed = appended.changed() => {
                            if changed.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        ))
    }

    fn commit(&self, record: &ConsumeRecord) -> Result<()> {
        if self.state.closed.is_cancelled() {
            return Err(KatewayError::backend("consumer group member already left"));
        }
        let mut pending = self.state.pending.lock();
        let next = pending.entry(record.partition).or_insert(0);
        *next = (*next).max(record.offset + 1);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let state = &self.state;
        let delay = *state.cluster.close_delay.lock() * (state.id % 3) as u32;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        state.closed.cancel();
        state.leave();
        state.cluster.member_closes.fetch_add(1, Ordering::SeqCst);

        if state.cluster.fail_closes.load(Ordering::SeqCst) {
            state.pending.lock().clear();
            return Err(KatewayError::backend(format!(
                "zk: offset commit for {}/{} failed",
                state.group, state.topic
            )));
        }

        state.flush();
        debug!(
            "cluster[{}] member {} left {}/{}",
            state.cluster.name, state.id, state.topic, state.group
        );
        Ok(())
    }
}

#[async_trait]
impl GroupCoordinator for MemoryCluster {
    async fn join(
        &self,
        group: &str,
        topic: &str,
        _zk: &ZkCoordinates,
        config: &GroupJoinConfig,
    ) -> Result<Arc<dyn GroupMembership>> {
        self.inner.join_attempts.fetch_add(1, Ordering::SeqCst);
        if take_fault(&self.inner.fail_joins) {
            return Err(KatewayError::backend("zk: could not connect to a server"));
        }

        let id = self.inner.next_member.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .members
            .lock()
            .entry((topic.to_string(), group.to_string()))
            .or_default()
            .push(id);
        self.inner.joins.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryMembership {
            state: Arc::new(MemberState {
                id,
                topic: topic.to_string(),
                group: group.to_string(),
                initial_offset: config.initial_offset,
                commit_interval: config.commit_interval,
                cluster: self.inner.clone(),
                cursors: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                last_flush: Mutex::new(Instant::now()),
                closed: CancellationToken::new(),
            }),
        }))
    }
}
