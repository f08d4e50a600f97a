//! Shared setup for the integration tests: hosts on one in-memory exchange
//! with fast timers.

#![allow(dead_code)]

use channel_system::*;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

pub const BEAT: Duration = Duration::from_millis(20);

pub fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        tick_interval_ms: 10,
        commit_spacing_ms: 10,
        idle_grace_ms: 50,
        ..WorkerSettings::default()
    }
}

/// Master settings that never time hosts out during a test.
pub fn master_settings() -> MasterSettings {
    let mut settings = MasterSettings::default();
    settings.placement.host_timeout_beats = 100_000;
    settings.placement.heavy_host_timeout_beats = 100_000;
    settings
}

pub fn id(s: &str) -> ChannelId {
    s.parse().unwrap()
}

pub struct Cluster {
    pub exchange: Arc<LocalExchange>,
    pub datastore: Arc<MemoryDatastore>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_exchange(LocalExchange::new())
    }

    pub fn with_exchange(exchange: LocalExchange) -> Self {
        let exchange = Arc::new(exchange);
        let heartbeat = exchange.spawn_heartbeat(BEAT);
        Self {
            exchange,
            datastore: Arc::new(MemoryDatastore::new()),
            heartbeat: Some(heartbeat),
        }
    }

    /// A cluster whose liveness only moves when the test calls `tick`.
    pub fn manual() -> Self {
        Self {
            exchange: Arc::new(LocalExchange::new()),
            datastore: Arc::new(MemoryDatastore::new()),
            heartbeat: None,
        }
    }

    pub fn tick(&self, beats: u64) {
        for _ in 0..beats {
            self.exchange.tick();
        }
    }

    /// Starts a host with the framework types, a `client` type and `types`,
    /// and spawns its `server.<name>` endpoint.
    pub async fn host<F>(&self, name: &str, types: F) -> Arc<HostContext>
    where
        F: FnOnce(&mut WorkerRegistry),
    {
        let mut registry = default_registry(master_settings()).unwrap();
        registry
            .register(WorkerTypeBuilder::new("client").build().unwrap())
            .unwrap();
        types(&mut registry);
        let server = ServerId::new(name);
        let host = HostContext::new(
            server.clone(),
            self.exchange.clone(),
            self.datastore.clone(),
            registry,
            worker_settings(),
        );
        host.spawn_worker(ChannelId::server(&server)).await.unwrap();
        host
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
    }
}

/// Reports an idle load for `host` and waits for the master's ack.
pub async fn report_load(host: &Arc<HostContext>, report: LoadReport) {
    let endpoint = host
        .worker(&ChannelId::server(host.server_id()))
        .expect("server endpoint running");
    endpoint
        .request(&ChannelId::master(), "load", serde_json::to_value(report).unwrap())
        .await
        .unwrap();
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
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
