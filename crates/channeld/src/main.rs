//! # channeld
//!
//! Runs one channel server: loads `channeld.toml` (writing a default one if
//! needed), applies command-line overrides, sets up logging and serves until
//! SIGINT/SIGTERM. The exchange and datastore are in-process, so one daemon
//! is a complete single-host cluster hosting the master, the id mapper and
//! chat rooms.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context, Result};
use channel_server::{ChannelServer, SystemSampler};
use channel_system::workers::{chattable, DefaultChatPolicy};
use channel_system::{
    default_registry, ChannelId, LocalExchange, MemoryDatastore, WorkerRegistry,
    WorkerTypeBuilder,
};
use cli::CliArgs;
use config::AppConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Applies command-line overrides on top of the file configuration.
fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(server_id) = &args.server_id {
        config.server.server_id = server_id.clone();
    }
    if args.no_master {
        config.server.master_candidate = false;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}

async fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    apply_overrides(&mut config, args);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;
    Ok(config)
}

/// Framework types plus the chat `room`.
fn registry(config: &AppConfig) -> Result<WorkerRegistry> {
    let mut registry = default_registry(config.master.clone())?;
    let room = chattable(
        WorkerTypeBuilder::new("room")
            .auto_destroy(true)
            .persist(true)
            .writable("topic"),
        config.chat.clone(),
        Arc::new(DefaultChatPolicy),
    )
    .build()?;
    registry.register(room)?;
    Ok(registry)
}

pub struct Application {
    config: AppConfig,
    server: ChannelServer,
    heartbeat: JoinHandle<()>,
}

impl Application {
    pub async fn start(config: AppConfig) -> Result<Self> {
        let exchange = Arc::new(LocalExchange::new());
        let heartbeat = exchange.spawn_heartbeat(config.server.heartbeat_interval());
        let server = ChannelServer::start(
            config.server.clone(),
            exchange,
            Arc::new(MemoryDatastore::new()),
            registry(&config)?,
            config.worker.clone(),
            Box::new(SystemSampler::new()),
        )
        .await
        .context("starting channel server")?;
        Ok(Self {
            config,
            server,
            heartbeat,
        })
    }

    /// Serves until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🏷️ Server: {}", self.config.server.server_id);
        info!("  👑 Master candidate: {}", self.config.server.master_candidate);
        info!("  💓 Heartbeat: {}ms", self.config.server.heartbeat_interval_ms);
        info!("  📊 Load reports: every {}ms", self.config.server.load_report_interval_ms);
        info!("✅ channeld is now running");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let waited = signals::wait_for_shutdown().await;
        if let Err(e) = &waited {
            warn!("Signal handling failed, shutting down: {}", e);
        }
        self.shutdown().await;
        waited
    }

    pub async fn shutdown(self) {
        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        self.server.shutdown().await;
        self.heartbeat.abort();
        info!("👋 channeld stopped");
    }

    pub fn server(&self) -> &ChannelServer {
        &self.server
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {e:#}");
            std::process::exit(1);
        }
    };
    logging::setup_logging(&config.logging)?;
    info!(
        "🌟 channeld v{} | config {}",
        env!("CARGO_PKG_VERSION"),
        args.config_path.display()
    );

    let app = match Application::start(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("❌ Failed to start: {:#}", e);
            std::process::exit(1);
        }
    };
    if app.server().is_master() {
        info!("👑 Hosting {}", ChannelId::master());
    }
    app.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio::time::{sleep, timeout, Duration};

    fn args(path: PathBuf) -> CliArgs {
        CliArgs {
            config_path: path,
            server_id: Some("cs9".to_string()),
            no_master: false,
            log_level: Some("debug".to_string()),
            json_logs: true,
        }
    }

    #[tokio::test]
    async fn test_overrides_apply_after_loading() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&args(dir.path().join("channeld.toml")))
            .await
            .unwrap();
        assert_eq!(config.server.server_id, "cs9");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }

    #[tokio::test]
    async fn test_invalid_override_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut bad = args(dir.path().join("channeld.toml"));
        bad.server_id = Some("cs.9".to_string());
        assert!(load_config(&bad).await.is_err());
    }

    #[test]
    fn test_registry_has_room() {
        let registry = registry(&AppConfig::default()).unwrap();
        for name in ["master", "server", "idmap", "room"] {
            assert!(registry.contains(name), "{name} missing");
        }
    }

    #[tokio::test]
    async fn test_single_host_cluster_becomes_ready() {
        let mut config = AppConfig::default();
        config.server.heartbeat_interval_ms = 20;
        config.server.load_report_interval_ms = 50;
        let app = Application::start(config).await.unwrap();
        assert!(app.server().is_master());

        let readiness = app.server().readiness();
        let became_ready = timeout(Duration::from_secs(5), async {
            while readiness.ready(None, None).await.0 != 200 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(became_ready.is_ok());

        app.shutdown().await;
    }
}
