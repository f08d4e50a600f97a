//! The channel server process: one host context, its `server.<id>`
//! endpoint, the periodic load report and, on master candidates, the
//! contest for `master.0`.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::load::{LoadSampler, MessageRate};
use crate::readiness::ReadinessCheck;
use channel_system::ids::{MASTER_TYPE, SERVER_TYPE};
use channel_system::{
    ChannelError, ChannelId, Datastore, Exchange, HostContext, LoadReport, ServerId,
    WorkerHandle, WorkerRegistry, WorkerSettings,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub struct ChannelServer {
    config: ServerConfig,
    host: Arc<HostContext>,
    endpoint: WorkerHandle,
    shutdown_sender: broadcast::Sender<()>,
    reporter: JoinHandle<()>,
}

impl std::fmt::Debug for ChannelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelServer")
            .field("server_id", self.host.server_id())
            .field("workers", &self.host.worker_count())
            .finish()
    }
}

impl ChannelServer {
    /// Creates the host context, spawns the endpoint, enters the master
    /// election when configured to, and starts reporting load.
    ///
    /// `registry` must contain the `master` and `server` worker types.
    pub async fn start(
        config: ServerConfig,
        exchange: Arc<dyn Exchange>,
        datastore: Arc<dyn Datastore>,
        registry: WorkerRegistry,
        settings: WorkerSettings,
        sampler: Box<dyn LoadSampler>,
    ) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;
        settings.validate().map_err(ServerError::Config)?;
        for required in [MASTER_TYPE, SERVER_TYPE] {
            if !registry.contains(required) {
                return Err(ServerError::Config(format!(
                    "worker type {required:?} is not registered"
                )));
            }
        }

        let server_id = ServerId::new(config.server_id.clone());
        info!("🚀 Starting channel server {}", server_id);
        info!("🧩 Worker types: {}", registry.names().join(", "));
        let host = HostContext::new(server_id.clone(), exchange, datastore, registry, settings);
        let endpoint = host.spawn_worker(ChannelId::server(&server_id)).await?;

        if config.master_candidate {
            contest_master(&host).await;
        }

        let (shutdown_sender, shutdown_receiver) = broadcast::channel(1);
        let reporter = tokio::spawn(report_load(
            config.clone(),
            Arc::clone(&host),
            endpoint.clone(),
            sampler,
            shutdown_receiver,
        ));

        info!("✅ Channel server {} ready", server_id);
        Ok(Self {
            config,
            host,
            endpoint,
            shutdown_sender,
            reporter,
        })
    }

    pub fn server_id(&self) -> &ServerId {
        self.host.server_id()
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    /// Handle of this host's `server.<id>` endpoint.
    pub fn endpoint(&self) -> &WorkerHandle {
        &self.endpoint
    }

    /// Whether `master.0` currently runs on this host.
    pub fn is_master(&self) -> bool {
        self.host.worker(&ChannelId::master()).is_some()
    }

    pub fn readiness(&self) -> ReadinessCheck {
        ReadinessCheck::new(self.endpoint.clone(), self.config.deploy_secret.clone())
    }

    /// Stops load reporting, then every worker of the host.
    pub async fn shutdown(self) {
        info!("🛑 Shutting down channel server {}", self.host.server_id());
        let _ = self.shutdown_sender.send(());
        if let Err(e) = self.reporter.await {
            warn!("Load reporter ended abnormally: {}", e);
        }
        self.host.shutdown().await;
        info!("✅ Channel server {} stopped", self.host.server_id());
    }
}

/// Tries to start `master.0` here. The exchange refuses a second
/// registration, so at most one candidate wins.
async fn contest_master(host: &Arc<HostContext>) -> bool {
    let master = ChannelId::master();
    if host.worker(&master).is_some() {
        return true;
    }
    if host.exchange().is_registered(&master) {
        return false;
    }
    match host.spawn_worker(master).await {
        Ok(_) => {
            info!("👑 {} is hosting the master", host.server_id());
            true
        }
        Err(ChannelError::Exchange(reason)) => {
            debug!(server = %host.server_id(), reason = %reason, "master elected elsewhere");
            false
        }
        Err(e) => {
            warn!(server = %host.server_id(), error = %e, "could not start the master");
            false
        }
    }
}

fn build_report(
    config: &ServerConfig,
    host: &HostContext,
    sampler: &mut dyn LoadSampler,
    rate: &mut MessageRate,
) -> LoadReport {
    let sample = sampler.sample();
    LoadReport {
        cpu: sample.cpu,
        host_cpu: sample.host_cpu,
        mem_mb: sample.mem_mb,
        free_mem: sample.free_mem,
        msgs_per_sec: rate.update(host.message_count(), Instant::now()),
        worker_counts: host.worker_counts(),
        debug_addr: config.debug_addr.clone(),
    }
}

async fn report_load(
    config: ServerConfig,
    host: Arc<HostContext>,
    endpoint: WorkerHandle,
    mut sampler: Box<dyn LoadSampler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(config.load_report_interval());
    let mut rate = MessageRate::default();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => break,
        }
        if host.is_closing() {
            break;
        }
        // a lost master is replaced by whichever candidate notices first
        if config.master_candidate {
            contest_master(&host).await;
        }
        let report = build_report(&config, &host, sampler.as_mut(), &mut rate);
        let payload = match serde_json::to_value(&report) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode load report: {}", e);
                continue;
            }
        };
        if let Err(e) = endpoint.push(&ChannelId::master(), "load", payload) {
            debug!(error = %e, "load report not sent");
            if matches!(e, ChannelError::ShuttingDown) {
                break;
            }
        }
    }
    debug!(server = %host.server_id(), "load reporter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::{HostSample, StaticSampler};
    use channel_system::{LocalExchange, MemoryDatastore};

    #[tokio::test]
    async fn test_start_requires_framework_types() {
        let err = ChannelServer::start(
            ServerConfig::default(),
            Arc::new(LocalExchange::new()),
            Arc::new(MemoryDatastore::new()),
            WorkerRegistry::new(),
            WorkerSettings::default(),
            Box::new(StaticSampler::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[tokio::test]
    async fn test_report_carries_sample_and_workers() {
        let host = HostContext::new(
            ServerId::new("cs1"),
            Arc::new(LocalExchange::new()),
            Arc::new(MemoryDatastore::new()),
            channel_system::default_registry(Default::default()).unwrap(),
            WorkerSettings::default(),
        );
        host.spawn_worker(ChannelId::server(host.server_id()))
            .await
            .unwrap();
        let config = ServerConfig {
            debug_addr: Some("10.0.0.1:9000".to_string()),
            ..ServerConfig::default()
        };
        let mut sampler = StaticSampler(HostSample {
            cpu: 12.0,
            host_cpu: 30.0,
            mem_mb: 512.0,
            free_mem: 60.0,
        });
        let report = build_report(&config, &host, &mut sampler, &mut MessageRate::default());
        assert_eq!(report.cpu, 12.0);
        assert_eq!(report.free_mem, 60.0);
        assert_eq!(report.msgs_per_sec, 0.0);
        assert_eq!(report.worker_counts.get(SERVER_TYPE), Some(&1));
        assert_eq!(report.debug_addr.as_deref(), Some("10.0.0.1:9000"));
        host.shutdown().await;
    }
}
