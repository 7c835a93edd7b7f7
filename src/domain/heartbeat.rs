//! Heartbeat assembly and delivery, plus the latest-version poll that may
//! start a self-update.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::health::{fmt_uptime, HealthSampler, HealthSnapshot};
use super::reconciler::git_command;
use super::state::AgentState;
use super::types::{HeartbeatSummary, NodeRole};
use super::updater::Updater;
use crate::client::ControlPlaneClient;
use crate::config::AgentConfig;
use crate::exec::{self, CommandRunner};

/// Body of `POST /api/heartbeat`.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub git_sha: String,
    pub agent_version: String,
    pub caddy_version: String,
    pub last_reload_ok: bool,
    pub last_error: String,
    pub node_type: NodeRole,
    pub is_healthy: bool,
    pub health_summary: String,
    pub health_data: HealthData,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthData {
    pub disk_usage: f64,
    pub mem_usage: f64,
    pub cpu_usage: f64,
    pub uptime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caddy_ok: Option<bool>,
}

impl From<&HealthSnapshot> for HealthData {
    fn from(snap: &HealthSnapshot) -> Self {
        Self {
            disk_usage: snap.disk_used_pct,
            mem_usage: snap.mem_used_pct,
            cpu_usage: snap.cpu_load_1m,
            uptime: fmt_uptime(snap.uptime),
            caddy_ok: snap.proxy_ok,
        }
    }
}

pub struct Heartbeater {
    state: Arc<AgentState>,
    runner: Arc<dyn CommandRunner>,
    sampler: HealthSampler,
    updater: Arc<dyn Updater>,
    updating: Arc<AtomicBool>,
    installed: Arc<Mutex<Option<String>>>,
    last_timestamp: std::sync::Mutex<Option<DateTime<Utc>>>,
}

/// Clears the in-flight flag when the update task ends, however it ends.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Heartbeater {
    pub fn new(
        state: Arc<AgentState>,
        runner: Arc<dyn CommandRunner>,
        updater: Arc<dyn Updater>,
    ) -> Self {
        Self {
            state,
            runner,
            sampler: HealthSampler::new(),
            updater,
            updating: Arc::new(AtomicBool::new(false)),
            installed: Arc::new(Mutex::new(None)),
            last_timestamp: std::sync::Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_sampler(mut self, sampler: HealthSampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Send one heartbeat, then poll for a newer agent. Never fails; returns
    /// the update task if one was started.
    pub async fn tick(&self, config: &AgentConfig) -> Option<JoinHandle<()>> {
        let client = match ControlPlaneClient::new(&config.control_url, config.request_timeout()) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "heartbeat skipped");
                return None;
            }
        };

        let payload = self.build_payload(config).await;
        let delivered = match client.send_heartbeat(&payload).await {
            Ok(()) => {
                debug!(healthy = payload.is_healthy, "heartbeat delivered");
                true
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "heartbeat failed");
                false
            }
        };
        self.state
            .record_heartbeat(HeartbeatSummary {
                timestamp: payload.timestamp.clone(),
                delivered,
                healthy: payload.is_healthy,
                summary: payload.health_summary.clone(),
            })
            .await;

        if !config.update.enabled {
            return None;
        }
        self.check_for_update(&client).await
    }

    pub async fn build_payload(&self, config: &AgentConfig) -> HeartbeatPayload {
        let role = self.state.role().await;
        let reconciliation = self.state.reconciliation().await;
        let health = self.sampler.sample(role, reconciliation.ok).await;

        let (git_sha, caddy_version) = if role == NodeRole::Gateway {
            let rev_parse = git_command(&config.proxy.config_dir, &["rev-parse", "HEAD"]);
            let sha = exec::query(self.runner.as_ref(), &rev_parse);
            let version = exec::query(self.runner.as_ref(), &config.proxy.version_command);
            let (sha, version) = tokio::join!(sha, version);
            (sha.unwrap_or_default(), version.unwrap_or_default())
        } else {
            (String::new(), String::new())
        };

        HeartbeatPayload {
            node_id: self.state.node_id().to_string(),
            git_sha,
            agent_version: self.state.version().to_string(),
            caddy_version,
            last_reload_ok: reconciliation.ok,
            last_error: reconciliation.error_detail,
            node_type: role,
            is_healthy: health.healthy,
            health_summary: health.summary.clone(),
            health_data: HealthData::from(&health),
            timestamp: self.next_timestamp(),
        }
    }

    /// RFC 3339 UTC, never earlier than the previous heartbeat's.
    fn next_timestamp(&self) -> String {
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = match *last {
            Some(prev) if prev > Utc::now() => prev,
            _ => Utc::now(),
        };
        *last = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Start a detached update when the control plane advertises a version
    /// other than the running one. At most one update runs at a time, and a
    /// version already installed in this process is not fetched again.
    pub async fn check_for_update(&self, client: &ControlPlaneClient) -> Option<JoinHandle<()>> {
        let latest = match client.latest_version().await {
            Ok(Some(v)) => v,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %format!("{:#}", e), "version check failed");
                return None;
            }
        };

        let current = self.state.version();
        if versions_match(&latest, current) {
            return None;
        }
        if let Some(installed) = self.installed.lock().await.as_deref() {
            if versions_match(&latest, installed) {
                debug!(version = %latest, "update already installed, waiting for restart");
                return None;
            }
        }
        if self
            .updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(version = %latest, "update already in progress");
            return None;
        }

        info!(from = %current, to = %latest, "triggering agent update");
        let guard = InFlight(self.updating.clone());
        let updater = self.updater.clone();
        let installed = self.installed.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let result = updater.update(&latest).await;
            match result {
                Ok(()) => {
                    info!(version = %latest, "agent update installed");
                    *installed.lock().await = Some(latest);
                }
                Err(e) => error!(version = %latest, error = %e, "agent update failed"),
            }
        }))
    }
}

/// Compare two version tags, ignoring a leading `v`.
pub fn versions_match(a: &str, b: &str) -> bool {
    let a = a.trim().trim_start_matches('v');
    let b = b.trim().trim_start_matches('v');
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
