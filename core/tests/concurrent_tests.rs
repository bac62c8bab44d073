use bytes::Bytes;
use kateway::{
    KatewayError, MemoryCluster, ProducerPool, PubStore, StaticDirectory, StoreConfig,
    StoreMetrics, SubStore, ZkCoordinates,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn directory(cluster: &MemoryCluster, partitions: usize) -> Arc<StaticDirectory> {
    let directory = Arc::new(StaticDirectory::new());
    directory.add_cluster(
        "c1",
        ["10.0.0.1:9092", "10.0.0.2:9092"],
        ZkCoordinates::new(["zk1:2181"], "/kafka/c1"),
    );
    directory.set_partitions("c1", "concurrent-topic", partitions);
    directory.attach_member_source("c1", Arc::new(cluster.clone()));
    directory
}

fn config(pool_size: usize) -> StoreConfig {
    StoreConfig {
        sub_cluster: "c1".to_string(),
        pub_pool_size: pool_size,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_concurrent_producers() {
    let cluster = MemoryCluster::new("c1", 4);
    let pool_size = 3;
    let store = Arc::new(PubStore::new(
        directory(&cluster, 4),
        Arc::new(cluster.clone()),
        config(pool_size),
        Arc::new(StoreMetrics::default()),
    ));
    let num_producers = 10;
    let messages_per_producer = 50;

    let mut tasks = JoinSet::new();
    for producer_id in 0..num_producers {
        let store = Arc::clone(&store);
        tasks.spawn(async move {
            for msg_id in 0..messages_per_producer {
                let require_ack = msg_id % 2 == 0;
                store
                    .publish(
                        "c1",
                        "concurrent-topic",
                        Some(Bytes::from(format!("producer-{}", producer_id))),
                        Bytes::from(format!("producer_{}_message_{}", producer_id, msg_id)),
                        require_ack,
                    )
                    .await
                    .expect("Failed to publish message");
            }
            producer_id
        });
    }

    let mut completed = 0;
    while let Some(result) = tasks.join_next().await {
        result.expect("Producer task failed");
        completed += 1;
    }
    assert_eq!(completed, num_producers);
    assert_eq!(
        cluster.topic_len("concurrent-topic"),
        num_producers * messages_per_producer
    );

    let (sync_stats, async_stats) = store.stats("c1").unwrap();
    assert!(sync_stats.created <= pool_size as u64);
    assert!(async_stats.created <= pool_size as u64);
    assert_eq!(sync_stats.in_use, 0);
}

#[tokio::test]
async fn test_checkouts_never_exceed_pool_size() {
    let cluster = MemoryCluster::new("c1", 1);
    let pool_size = 2;
    let pool = Arc::new(ProducerPool::new(
        "c1",
        vec!["10.0.0.1:9092".to_string()],
        Arc::new(cluster.clone()),
        &config(pool_size),
        Arc::new(StoreMetrics::default()),
    ));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for _ in 0..12 {
        let pool = pool.clone();
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        tasks.spawn(async move {
            let producer = pool
                .get_sync_producer(&CancellationToken::new())
                .await
                .expect("checkout failed");
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            producer.release();
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("checkout task failed");
    }

    assert!(peak.load(Ordering::SeqCst) <= pool_size);
    assert!(cluster.connect_count() <= pool_size);
}

#[tokio::test]
async fn test_publish_during_broker_churn() {
    let cluster = MemoryCluster::new("c1", 2);
    let store = Arc::new(PubStore::new(
        directory(&cluster, 2),
        Arc::new(cluster.clone()),
        config(4),
        Arc::new(StoreMetrics::default()),
    ));
    let failures = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for producer_id in 0..4 {
        let store = Arc::clone(&store);
        let failures = failures.clone();
        tasks.spawn(async move {
            for msg_id in 0..40 {
                let result = store
                    .publish(
                        "c1",
                        "concurrent-topic",
                        None,
                        Bytes::from(format!("{}-{}", producer_id, msg_id)),
                        true,
                    )
                    .await;
                if let Err(err) = result {
                    // stale connections surface as retryable errors, never as success
                    assert!(err.is_retryable(), "unexpected error: {}", err);
                    failures.fetch_add(1, Ordering::SeqCst);
                }
                tokio::task::yield_now().await;
            }
        });
    }

    for round in 0..5 {
        let brokers = vec![format!("10.0.0.{}:9092", 10 + round)];
        store.refresh_brokers("c1", &brokers).unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    while let Some(result) = tasks.join_next().await {
        result.expect("publisher task failed");
    }

    let delivered = cluster.topic_len("concurrent-topic");
    assert_eq!(delivered + failures.load(Ordering::SeqCst), 160);
    assert_eq!(store.broker_list("c1").unwrap(), vec!["10.0.0.14:9092".to_string()]);
}

#[tokio::test]
async fn test_concurrent_subscribes_respect_partition_cap() {
    let cluster = MemoryCluster::new("c1", 3);
    let subs = Arc::new(SubStore::new(
        directory(&cluster, 3),
        Arc::new(cluster.clone()),
        config(1),
        Arc::new(StoreMetrics::default()),
    ));

    let mut tasks = JoinSet::new();
    for i in 0..10 {
        let subs = subs.clone();
        tasks.spawn(async move {
            subs.subscribe("concurrent-topic", "billing", &format!("client-{}", i), "")
                .await
                .is_ok()
        });
    }

    let mut admitted = 0;
    while let Some(result) = tasks.join_next().await {
        if result.expect("subscribe task failed") {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(subs.registry().len().await, 3);
    assert_eq!(cluster.live_members("concurrent-topic", "billing"), 3);
}

#[tokio::test]
async fn test_concurrent_subscribes_respect_registry_keys() {
    let cluster = MemoryCluster::new("c1", 8);
    let subs = Arc::new(SubStore::new(
        directory(&cluster, 8),
        Arc::new(cluster.clone()),
        config(1),
        Arc::new(StoreMetrics::default()),
    ));

    let mut tasks = JoinSet::new();
    for i in 0..16 {
        let subs = subs.clone();
        // two subscribe calls per client
        let client = format!("client-{}", i % 8);
        tasks.spawn(async move {
            subs.subscribe("concurrent-topic", "billing", &client, "")
                .await
                .map(|sub| sub.handle().key().client.clone())
        });
    }

    let mut joined = 0;
    while let Some(result) = tasks.join_next().await {
        let client = result.expect("subscribe task failed").unwrap();
        assert!(client.starts_with("client-"));
        joined += 1;
    }
    assert_eq!(joined, 16);
    assert_eq!(subs.registry().len().await, 8);
    assert_eq!(cluster.join_count(), 8);

    subs.registry().shutdown().await;
    assert_eq!(cluster.close_count(), 8);
    let err = subs
        .subscribe("concurrent-topic", "billing", "client-0", "")
        .await
        .unwrap_err();
    assert!(matches!(err, KatewayError::StoreShutDown));
}
