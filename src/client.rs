//! Typed HTTP client for the control plane.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::Deserialize;

use crate::domain::heartbeat::HeartbeatPayload;

pub struct ControlPlaneClient {
    base_url: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct LatestVersion {
    #[serde(default)]
    version: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("edge-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// POST the heartbeat. The response body is ignored; any non-2xx is an error.
    pub async fn send_heartbeat(&self, payload: &HeartbeatPayload) -> Result<()> {
        let url = format!("{}/api/heartbeat", self.base_url);
        self.http
            .post(&url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("POST {}", url))?
            .error_for_status()
            .with_context(|| format!("{} rejected heartbeat", url))?;
        Ok(())
    }

    /// Latest published agent version, or `None` when the control plane has
    /// nothing to offer (empty or `unknown`).
    pub async fn latest_version(&self) -> Result<Option<String>> {
        let url = format!("{}/api/agent/latest-version", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;

        if !resp.status().is_success() {
            bail!("{} returned {}", url, resp.status());
        }

        let latest: LatestVersion = resp
            .json()
            .await
            .with_context(|| format!("parsing response from {}", url))?;

        let version = latest.version.trim();
        if version.is_empty() || version == "unknown" {
            return Ok(None);
        }
        Ok(Some(version.to_string()))
    }
}

/// WebSocket endpoint for log streaming, derived from the control URL.
pub fn log_stream_url(control_url: &str) -> Result<String> {
    let base = control_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        bail!("invalid control URL: {}", control_url);
    };
    Ok(format!("{}/api/logs/stream", ws))
}
