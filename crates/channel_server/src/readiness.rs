//! # Readiness Checks
//!
//! Status/body pairs behind `/api/ready` and `/api/deployready`. Both ask
//! the master through this host's endpoint; an HTTP layer only has to copy
//! the pair into its response.

use channel_system::{ChannelError, ChannelId, WorkerHandle};
use serde_json::json;
use tracing::debug;

pub const STATUS_READY: u16 = 200;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_UNAVAILABLE: u16 = 503;

#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    endpoint: WorkerHandle,
    deploy_secret: Option<String>,
}

impl ReadinessCheck {
    pub fn new(endpoint: WorkerHandle, deploy_secret: Option<String>) -> Self {
        Self {
            endpoint,
            deploy_secret,
        }
    }

    /// Whether clients of `platform` at build `version` may connect.
    pub async fn ready(&self, platform: Option<&str>, version: Option<&str>) -> (u16, String) {
        let query = json!({ "platform": platform, "version": version });
        let result = self
            .endpoint
            .request(&ChannelId::master(), "ready_query", query)
            .await;
        answer(result, "ready")
    }

    /// Whether the cluster is quiet enough to deploy. Callers must present
    /// the configured secret, if any.
    pub async fn deploy_ready(&self, secret: Option<&str>) -> (u16, String) {
        if let Some(expected) = &self.deploy_secret {
            if secret != Some(expected.as_str()) {
                return (STATUS_FORBIDDEN, "forbidden".to_string());
            }
        }
        let result = self
            .endpoint
            .request(&ChannelId::master(), "deploy_ready_query", serde_json::Value::Null)
            .await;
        answer(result, "deploy ready")
    }
}

fn answer(result: Result<serde_json::Value, ChannelError>, ok: &str) -> (u16, String) {
    match result {
        Ok(_) => (STATUS_READY, ok.to_string()),
        Err(e) => {
            debug!(error = %e, "not ready");
            (STATUS_UNAVAILABLE, e.to_string())
        }
    }
}
