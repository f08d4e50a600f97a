//! Two channel servers on one in-memory exchange: election, load reports,
//! readiness and master failover.

use channel_server::*;
use channel_system::{
    default_registry, ChannelId, LocalExchange, MasterSettings, MasterState, MemoryDatastore,
    WorkerSettings,
};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

struct Cluster {
    exchange: Arc<LocalExchange>,
    datastore: Arc<MemoryDatastore>,
    heartbeat: JoinHandle<()>,
}

impl Cluster {
    fn new() -> Self {
        let exchange = Arc::new(LocalExchange::new());
        let heartbeat = exchange.spawn_heartbeat(Duration::from_millis(20));
        Self {
            exchange,
            datastore: Arc::new(MemoryDatastore::new()),
            heartbeat,
        }
    }

    async fn server(&self, name: &str) -> ChannelServer {
        let config = ServerConfig {
            server_id: name.to_string(),
            load_report_interval_ms: 30,
            deploy_secret: Some("s3cret".to_string()),
            ..ServerConfig::default()
        };
        let settings = WorkerSettings {
            tick_interval_ms: 10,
            ..WorkerSettings::default()
        };
        let sample = HostSample {
            cpu: 5.0,
            host_cpu: 10.0,
            mem_mb: 100.0,
            free_mem: 80.0,
        };
        ChannelServer::start(
            config,
            self.exchange.clone(),
            self.datastore.clone(),
            default_registry(MasterSettings::default()).unwrap(),
            settings,
            Box::new(StaticSampler(sample)),
        )
        .await
        .unwrap()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = timeout(Duration::from_secs(5), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn known_hosts(server: &ChannelServer) -> usize {
    match server.host().worker(&ChannelId::master()) {
        Some(master) => master
            .inspect(|ctx| ctx.ext::<MasterState>().map(|s| s.placement().host_count()))
            .await
            .ok()
            .flatten()
            .unwrap_or(0),
        None => 0,
    }
}

#[tokio::test]
async fn test_one_master_and_both_hosts_reporting() {
    let cluster = Cluster::new();
    let first = cluster.server("cs1").await;
    let second = cluster.server("cs2").await;

    assert!(first.is_master());
    assert!(!second.is_master());

    eventually("both load reports", || async { known_hosts(&first).await == 2 }).await;

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_readiness_checks() {
    let cluster = Cluster::new();
    let first = cluster.server("cs1").await;
    let second = cluster.server("cs2").await;
    let readiness = second.readiness();

    eventually("ready", || {
        let readiness = readiness.clone();
        async move { readiness.ready(Some("ios"), Some("2.0")).await.0 == 200 }
    })
    .await;

    let (status, _) = readiness.deploy_ready(Some("wrong")).await;
    assert_eq!(status, 403);
    let (status, _) = readiness.deploy_ready(None).await;
    assert_eq!(status, 403);

    let (status, body) = readiness.deploy_ready(Some("s3cret")).await;
    assert_eq!(status, 503);
    assert!(body.contains("quiescing"));
    eventually("deploy ready", || {
        let readiness = readiness.clone();
        async move { readiness.deploy_ready(Some("s3cret")).await.0 == 200 }
    })
    .await;

    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn test_master_moves_when_its_host_stops() {
    let cluster = Cluster::new();
    let first = cluster.server("cs1").await;
    let second = cluster.server("cs2").await;
    assert!(first.is_master());

    first.shutdown().await;
    eventually("the takeover", || async { second.is_master() }).await;
    eventually("the new master to hear from its host", || async {
        known_hosts(&second).await == 1
    })
    .await;

    second.shutdown().await;
}
