use bytes::Bytes;
use clap::Parser;
use futures::StreamExt;
use kateway::{
    KatewayError, MemoryCluster, PubStore, Result, StaticDirectory, StoreConfig, StoreMetrics,
    SubStore, ZkCoordinates,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kateway-store")]
#[command(about = "Runs the kateway store layer against an in-memory message log")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Cluster served by both the pub and sub side
    #[arg(long, default_value = "default")]
    cluster: String,

    /// Broker addresses (comma-separated)
    #[arg(long, default_value = "127.0.0.1:9092")]
    brokers: String,

    /// Coordination service addresses (comma-separated)
    #[arg(long, default_value = "127.0.0.1:2181")]
    zk: String,

    #[arg(long, default_value = "/kafka")]
    zk_chroot: String,

    /// Partitions of every auto-created topic
    #[arg(long, default_value = "4")]
    partitions: usize,

    /// Producer pool capacity, overrides KATEWAY_PUB_POOL_SIZE
    #[arg(long)]
    pool_size: Option<usize>,

    /// Client id of producer connections
    #[arg(long)]
    hostname: Option<String>,

    /// Publish this many messages to `demo-topic` and read them back
    #[arg(long, default_value = "0")]
    demo_messages: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    let mut config = StoreConfig::from_env()?;
    config.sub_cluster = args.cluster.clone();
    if let Some(size) = args.pool_size {
        config.pub_pool_size = size;
    }
    if let Some(ref hostname) = args.hostname {
        config = config.with_hostname(hostname);
    }
    config.validate().map_err(KatewayError::Config)?;

    let brokers = split_list(&args.brokers);
    info!("Starting kateway store for cluster {}", args.cluster);
    info!("Brokers: {:?}", brokers);
    info!("Producer pool size: {}", config.pub_pool_size);

    let cluster = MemoryCluster::new(args.cluster.clone(), args.partitions);
    let directory = Arc::new(StaticDirectory::new());
    directory.add_cluster(
        &args.cluster,
        brokers,
        ZkCoordinates::new(split_list(&args.zk), args.zk_chroot.clone()),
    );
    directory.attach_member_source(&args.cluster, Arc::new(cluster.clone()));

    let metrics = Arc::new(StoreMetrics::default());
    let pub_store = Arc::new(PubStore::new(
        directory.clone(),
        Arc::new(cluster.clone()),
        config.clone(),
        metrics.clone(),
    ));
    let sub_store = Arc::new(SubStore::new(
        directory.clone(),
        Arc::new(cluster.clone()),
        config,
        metrics.clone(),
    ));

    let shutdown = CancellationToken::new();
    let (closed_tx, closed_rx) = mpsc::channel(64);
    let watcher = pub_store.spawn_broker_watcher(shutdown.clone());
    let sub_loop = sub_store.spawn(closed_rx, shutdown.clone());

    if args.demo_messages > 0 {
        directory.set_partitions(&args.cluster, "demo-topic", args.partitions);
        cluster.create_topic("demo-topic", args.partitions);
        if let Err(e) = run_demo(&pub_store, &sub_store, &args.cluster, args.demo_messages).await {
            error!("Demo failed: {}", e);
        }
        if closed_tx.send("demo-client".to_string()).await.is_err() {
            warn!("Sub store loop already stopped");
        }
    }

    signal::ctrl_c()
        .await
        .map_err(|e| KatewayError::backend(format!("signal handler: {}", e)))?;
    info!("Received Ctrl+C, shutting down gracefully...");

    shutdown.cancel();
    pub_store.close();
    for (name, task) in [("broker watcher", watcher), ("sub store", sub_loop)] {
        if let Err(e) = task.await {
            error!("{} task failed: {}", name, e);
        }
    }

    info!("Metrics: {:?}", metrics.snapshot());
    info!("kateway store shut down successfully");
    Ok(())
}

async fn run_demo(
    pub_store: &PubStore,
    sub_store: &SubStore,
    cluster: &str,
    count: usize,
) -> Result<()> {
    for i in 0..count {
        let key = Bytes::from(format!("key-{}", i % 8));
        pub_store
            .publish(cluster, "demo-topic", Some(key), Bytes::from(format!("message {}", i)), true)
            .await?;
    }
    info!("Published {} messages", count);

    let mut subscription = sub_store
        .subscribe("demo-topic", "demo-group", "demo-client", "oldest")
        .await?;
    for _ in 0..count {
        match subscription.next().await {
            Some(Ok(record)) => {
                subscription.commit(&record)?;
                info!(
                    "Consumed partition {} offset {}: {:?}",
                    record.partition, record.offset, record.value
                );
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(())
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
