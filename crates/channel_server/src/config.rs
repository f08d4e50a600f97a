//! Host-process settings, the `[server]` section of the daemon config.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

fn default_server_id() -> String {
    "cs1".to_string()
}

fn default_master_candidate() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_load_report_interval_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name of this channel server; its endpoint is `server.<server_id>`
    #[serde(default = "default_server_id")]
    pub server_id: String,
    /// Whether this host competes for `master.0`
    #[serde(default = "default_master_candidate")]
    pub master_candidate: bool,
    /// Interval of the liveness beat when this process owns the exchange
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_load_report_interval_ms")]
    pub load_report_interval_ms: u64,
    /// Shared secret `/api/deployready` callers must present
    #[serde(default)]
    pub deploy_secret: Option<String>,
    /// Debug address advertised in load reports
    #[serde(default)]
    pub debug_addr: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            master_candidate: default_master_candidate(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            load_report_interval_ms: default_load_report_interval_ms(),
            deploy_secret: None,
            debug_addr: None,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn load_report_interval(&self) -> Duration {
        Duration::from_millis(self.load_report_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server_id.is_empty() {
            return Err("server.server_id cannot be empty".to_string());
        }
        if self.server_id.contains('.') {
            return Err(format!(
                "server.server_id {:?} cannot contain '.'",
                self.server_id
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("server.heartbeat_interval_ms must be greater than 0".to_string());
        }
        if self.load_report_interval_ms == 0 {
            return Err("server.load_report_interval_ms must be greater than 0".to_string());
        }
        if matches!(&self.deploy_secret, Some(secret) if secret.is_empty()) {
            return Err("server.deploy_secret cannot be empty when set".to_string());
        }
        Ok(())
    }
}
