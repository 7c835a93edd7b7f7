use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Role of this node in the fleet. Only gateways run the proxy reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Gateway,
    #[default]
    Server,
}

impl FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gateway" => Ok(NodeRole::Gateway),
            "server" => Ok(NodeRole::Server),
            other => bail!("unknown node role '{}' (expected 'gateway' or 'server')", other),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Gateway => write!(f, "gateway"),
            NodeRole::Server => write!(f, "server"),
        }
    }
}

/// Who this agent is. Validated once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub node_role: NodeRole,
}

impl NodeIdentity {
    pub fn new(node_id: &str, node_role: NodeRole) -> Result<Self, ConfigError> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(ConfigError::MissingNodeId);
        }
        Ok(Self {
            node_id: node_id.to_string(),
            node_role,
        })
    }
}

/// Outcome of the last validate + activate cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub ok: bool,
    pub error_detail: String,
    pub config_revision: String,
    pub attempted_at: Option<DateTime<Utc>>,
}

impl ReconciliationResult {
    pub fn succeeded(config_revision: String) -> Self {
        Self {
            ok: true,
            error_detail: String::new(),
            config_revision,
            attempted_at: Some(Utc::now()),
        }
    }

    pub fn failed(error_detail: impl Into<String>, config_revision: String) -> Self {
        Self {
            ok: false,
            error_detail: error_detail.into(),
            config_revision,
            attempted_at: Some(Utc::now()),
        }
    }
}

/// Result of a fast-forward-only pull of the tracked config directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    pub updated: bool,
    pub error: Option<String>,
}

/// Local vs. remote revision of the tracked config directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftStatus {
    pub local_revision: String,
    pub remote_revision: Option<String>,
    pub drift: bool,
}

impl DriftStatus {
    pub fn new(local_revision: String, remote_revision: Option<String>) -> Self {
        let drift = match &remote_revision {
            Some(remote) => !local_revision.is_empty() && *remote != local_revision,
            None => false,
        };
        Self {
            local_revision,
            remote_revision,
            drift,
        }
    }
}

/// What the last heartbeat said, kept for the local status API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatSummary {
    pub timestamp: String,
    pub delivered: bool,
    pub healthy: bool,
    pub summary: String,
}
