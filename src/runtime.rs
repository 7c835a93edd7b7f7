use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api::rest::{self, AppState};
use crate::client;
use crate::config::{AgentConfig, ConfigSource};
use crate::domain::heartbeat::Heartbeater;
use crate::domain::reconciler::ConfigReconciler;
use crate::domain::state::AgentState;
use crate::domain::types::{NodeIdentity, NodeRole};
use crate::domain::updater::{SelfUpdater, Updater};
use crate::exec::{CommandRunner, SystemRunner};
use crate::telemetry::stream::LogStream;
use crate::telemetry::LogShipper;

/// Owns the scheduling loop and the long-lived background tasks.
pub struct AgentRuntime {
    source: ConfigSource,
    config: AgentConfig,
    state: Arc<AgentState>,
    runner: Arc<dyn CommandRunner>,
    heartbeater: Heartbeater,
}

impl AgentRuntime {
    pub fn new(source: ConfigSource) -> Result<Self> {
        let config = source.load()?;
        let runner = Arc::new(SystemRunner::new(config.command_timeout()));
        let updater = Arc::new(SelfUpdater::new(
            config.update.clone(),
            config.token().map(str::to_string),
        ));
        Self::with_parts(source, config, runner, updater)
    }

    /// Fails when the node has no identity; nothing is started in that case.
    pub fn with_parts(
        source: ConfigSource,
        config: AgentConfig,
        runner: Arc<dyn CommandRunner>,
        updater: Arc<dyn Updater>,
    ) -> Result<Self> {
        let identity = NodeIdentity::new(&config.node_id, config.node_role)?;
        let state = Arc::new(AgentState::from_identity(
            &identity,
            env!("CARGO_PKG_VERSION"),
        ));
        let heartbeater = Heartbeater::new(state.clone(), runner.clone(), updater);
        Ok(Self {
            source,
            config,
            state,
            runner,
            heartbeater,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> Arc<AgentState> {
        self.state.clone()
    }

    fn reconciler(&self) -> ConfigReconciler {
        ConfigReconciler::new(
            self.config.proxy.clone(),
            self.runner.clone(),
            self.state.clone(),
        )
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Start background tasks, reconcile a gateway once, then tick until
    /// `shutdown` resolves. The first tick fires one period after startup.
    async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            version = self.state.version(),
            node_id = self.state.node_id(),
            role = %self.config.node_role,
            "edge-agent starting"
        );

        if self.config.logs.enabled {
            self.spawn_log_shipper();
        }
        if !self.config.status_addr.is_empty() {
            self.spawn_status_server().await;
        }

        if self.config.node_role == NodeRole::Gateway {
            self.reconciler().reconcile().await;
        }

        // Tick period and update settings are fixed for the process lifetime.
        let period = self.config.tick_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => break,
            }
            self.tick().await;
        }

        info!("edge-agent stopped");
        Ok(())
    }

    /// One scheduling step: refresh config, reconcile when this node is a
    /// gateway, then report. Reconciliation always finishes before the
    /// heartbeat that reports it.
    pub async fn tick(&mut self) {
        match self.source.load() {
            Ok(fresh) => {
                if fresh.node_id.trim() != self.state.node_id() {
                    debug!(configured = %fresh.node_id, "node_id changes take effect after restart");
                }
                self.config = fresh;
            }
            Err(e) => warn!(error = %format!("{:#}", e), "config reload failed, keeping previous"),
        }

        let role = self.config.node_role;
        self.state.set_role(role).await;

        if role == NodeRole::Gateway && self.config.auto_pull {
            self.reconciler().reconcile().await;
        }

        // Any update task is detached; the next tick does not wait for it.
        let _ = self.heartbeater.tick(&self.config).await;
    }

    fn spawn_log_shipper(&self) {
        let url = match client::log_stream_url(&self.config.control_url) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "log shipping disabled");
                return;
            }
        };
        let sink = Arc::new(LogStream::new(
            url,
            self.state.node_id(),
            self.config.logs.connect_timeout(),
        ));
        let shipper = LogShipper::new(&self.config.logs, sink);
        tokio::spawn(shipper.run());
    }

    async fn spawn_status_server(&self) {
        let addr = &self.config.status_addr;
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(addr = %addr, error = %e, "status API disabled");
                return;
            }
        };
        info!(addr = %addr, "status API listening");

        let app = rest::router(AppState {
            agent: self.state.clone(),
        })
        .layer(TraceLayer::new_for_http());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                warn!(error = %e, "status API stopped");
            }
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::{CliOverrides, ConfigError};
    use crate::domain::updater::UpdateError;
    use crate::exec::testing::FakeRunner;

    struct NoUpdates;

    #[async_trait]
    impl Updater for NoUpdates {
        async fn update(&self, _target_version: &str) -> Result<(), UpdateError> {
            Ok(())
        }
    }

    fn write_config(file: &Path, node_id: &str, role: &str, server: &MockServer) {
        std::fs::write(
            file,
            format!(
                "node_id: '{}'\nnode_role: {}\ncontrol_url: {}\nstatus_addr: ''\n\
                 logs:\n  enabled: false\nupdate:\n  enabled: false\n",
                node_id,
                role,
                server.uri()
            ),
        )
        .unwrap();
    }

    fn runtime(file: &Path, runner: Arc<FakeRunner>) -> Result<AgentRuntime> {
        let source = ConfigSource::new(Some(file.to_path_buf()), CliOverrides::default());
        let config = source.load()?;
        AgentRuntime::with_parts(source, config, runner, Arc::new(NoUpdates))
    }

    async fn accept_heartbeats(server: &MockServer, body: serde_json::Value, times: u64) {
        Mock::given(method("POST"))
            .and(path("/api/heartbeat"))
            .and(body_partial_json(body))
            .respond_with(ResponseTemplate::new(200))
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn missing_node_id_is_fatal() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edge-agent.yaml");
        write_config(&file, "", "server", &server);

        let err = runtime(&file, Arc::new(FakeRunner::new())).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingNodeId)
        ));
    }

    #[tokio::test]
    async fn server_never_touches_proxy_config() {
        let server = MockServer::start().await;
        accept_heartbeats(&server, json!({ "node_id": "srv-01", "node_type": "server" }), 3).await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edge-agent.yaml");
        write_config(&file, "srv-01", "server", &server);

        let runner = Arc::new(FakeRunner::new());
        let mut rt = runtime(&file, runner.clone()).unwrap();
        for _ in 0..3 {
            rt.tick().await;
        }
        assert_eq!(runner.count("pull"), 0);
        assert_eq!(runner.count("validate"), 0);
        assert_eq!(runner.count("reload"), 0);
    }

    #[tokio::test]
    async fn heartbeat_reports_same_tick_validation_failure() {
        let server = MockServer::start().await;
        accept_heartbeats(
            &server,
            json!({ "node_type": "gateway", "last_reload_ok": false, "is_healthy": false }),
            1,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edge-agent.yaml");
        write_config(&file, "gw-01", "gateway", &server);

        let runner = Arc::new(FakeRunner::new().respond("caddy validate", false, "Error: bad directive"));
        let mut rt = runtime(&file, runner.clone()).unwrap();
        rt.tick().await;

        assert_eq!(runner.count("pull --ff-only"), 1);
        assert_eq!(runner.count("caddy reload"), 0);
        let status = rt.state().status().await;
        assert!(status.reconciliation.error_detail.contains("bad directive"));
    }

    #[tokio::test]
    async fn role_change_is_picked_up_on_next_tick() {
        let server = MockServer::start().await;
        accept_heartbeats(&server, json!({ "node_id": "node-01" }), 2).await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edge-agent.yaml");
        write_config(&file, "node-01", "server", &server);

        let runner = Arc::new(FakeRunner::new());
        let mut rt = runtime(&file, runner.clone()).unwrap();
        rt.tick().await;
        assert_eq!(runner.count("pull"), 0);

        write_config(&file, "node-01", "gateway", &server);
        rt.tick().await;
        assert_eq!(runner.count("pull"), 1);
        assert_eq!(rt.state().role().await, NodeRole::Gateway);
    }

    #[tokio::test]
    async fn gateway_reconciles_at_startup_without_auto_pull() {
        let server = MockServer::start().await;
        accept_heartbeats(&server, json!({}), 0).await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edge-agent.yaml");
        write_config(&file, "gw-01", "gateway", &server);
        let mut yaml = std::fs::read_to_string(&file).unwrap();
        yaml.push_str("auto_pull: false\ntick_interval_secs: 3600\n");
        std::fs::write(&file, yaml).unwrap();

        let runner = Arc::new(FakeRunner::new().respond("rev-parse", true, "abc123\n"));
        let rt = runtime(&file, runner.clone()).unwrap();
        let state = rt.state();
        rt.run_until(std::future::ready(())).await.unwrap();

        assert_eq!(runner.count("pull --ff-only"), 1);
        assert_eq!(runner.count("caddy validate"), 1);
        assert_eq!(runner.count("caddy reload"), 1);
        let reconciliation = state.reconciliation().await;
        assert!(reconciliation.ok);
        assert_eq!(reconciliation.config_revision, "abc123");
        assert!(state.last_heartbeat().await.is_none());
    }

    #[tokio::test]
    async fn server_skips_startup_reconcile() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edge-agent.yaml");
        write_config(&file, "srv-01", "server", &server);

        let runner = Arc::new(FakeRunner::new());
        let rt = runtime(&file, runner.clone()).unwrap();
        rt.run_until(std::future::ready(())).await.unwrap();
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn unreadable_config_keeps_previous_snapshot() {
        let server = MockServer::start().await;
        accept_heartbeats(&server, json!({ "node_type": "server" }), 2).await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("edge-agent.yaml");
        write_config(&file, "srv-01", "server", &server);

        let runner = Arc::new(FakeRunner::new());
        let mut rt = runtime(&file, runner.clone()).unwrap();
        rt.tick().await;

        std::fs::write(&file, "node_role: [not, a, role]\n").unwrap();
        rt.tick().await;
        assert_eq!(rt.config.node_role, NodeRole::Server);
        assert_eq!(runner.count("pull"), 0);
    }
}
