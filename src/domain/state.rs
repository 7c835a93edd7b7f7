//! Shared agent state.
//!
//! The scheduling loop writes; the heartbeat and the local status API read.
//! Each field sits behind its own lock and is replaced whole, so readers never
//! observe a half-written reconciliation result.

use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

use super::types::{HeartbeatSummary, NodeIdentity, NodeRole, ReconciliationResult};

pub struct AgentState {
    node_id: String,
    version: String,
    started_at: Instant,
    role: RwLock<NodeRole>,
    reconciliation: RwLock<ReconciliationResult>,
    last_heartbeat: RwLock<Option<HeartbeatSummary>>,
}

/// Point-in-time view served by `GET /api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub node_id: String,
    pub node_role: NodeRole,
    pub agent_version: String,
    pub uptime_secs: u64,
    pub reconciliation: ReconciliationResult,
    pub last_heartbeat: Option<HeartbeatSummary>,
}

impl AgentState {
    pub fn new(node_id: impl Into<String>, role: NodeRole, version: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            version: version.into(),
            started_at: Instant::now(),
            role: RwLock::new(role),
            reconciliation: RwLock::new(ReconciliationResult::default()),
            last_heartbeat: RwLock::new(None),
        }
    }

    pub fn from_identity(identity: &NodeIdentity, version: impl Into<String>) -> Self {
        Self::new(identity.node_id.clone(), identity.node_role, version)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub async fn role(&self) -> NodeRole {
        *self.role.read().await
    }

    pub async fn set_role(&self, role: NodeRole) {
        *self.role.write().await = role;
    }

    pub async fn reconciliation(&self) -> ReconciliationResult {
        self.reconciliation.read().await.clone()
    }

    pub async fn record_reconciliation(&self, result: ReconciliationResult) {
        *self.reconciliation.write().await = result;
    }

    pub async fn last_heartbeat(&self) -> Option<HeartbeatSummary> {
        self.last_heartbeat.read().await.clone()
    }

    pub async fn record_heartbeat(&self, summary: HeartbeatSummary) {
        *self.last_heartbeat.write().await = Some(summary);
    }

    pub async fn status(&self) -> AgentStatus {
        AgentStatus {
            node_id: self.node_id.clone(),
            node_role: self.role().await,
            agent_version: self.version.clone(),
            uptime_secs: self.uptime_secs(),
            reconciliation: self.reconciliation().await,
            last_heartbeat: self.last_heartbeat().await,
        }
    }
}
