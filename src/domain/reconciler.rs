//! Pull, validate and activate the proxy configuration.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::state::AgentState;
use super::types::{DriftStatus, PullOutcome, ReconciliationResult};
use crate::config::ProxyConfig;
use crate::exec::{self, CommandRunner};

/// `git -C <dir> <args..>`
pub fn git_command(dir: &Path, args: &[&str]) -> Vec<String> {
    let mut argv = vec!["git".to_string(), "-C".to_string(), dir.display().to_string()];
    argv.extend(args.iter().map(|a| a.to_string()));
    argv
}

pub struct ConfigReconciler {
    config: ProxyConfig,
    runner: Arc<dyn CommandRunner>,
    state: Arc<AgentState>,
}

impl ConfigReconciler {
    pub fn new(config: ProxyConfig, runner: Arc<dyn CommandRunner>, state: Arc<AgentState>) -> Self {
        Self {
            config,
            runner,
            state,
        }
    }

    fn git(&self, args: &[&str]) -> Vec<String> {
        git_command(&self.config.config_dir, args)
    }

    /// Fast-forward the config checkout. Divergence is reported, never forced.
    pub async fn pull(&self) -> PullOutcome {
        let argv = self.git(&["pull", "--ff-only"]);
        match self.runner.run(&argv).await {
            Ok(out) if out.success => {
                if out.output.contains("Already up to date") || out.output.contains("Already up-to-date") {
                    debug!("proxy config already up to date");
                    PullOutcome {
                        updated: false,
                        error: None,
                    }
                } else {
                    info!(output = %out.trimmed(), "pulled new proxy config");
                    PullOutcome {
                        updated: true,
                        error: None,
                    }
                }
            }
            Ok(out) => {
                warn!(output = %out.trimmed(), "git pull failed");
                PullOutcome {
                    updated: false,
                    error: Some(format!("git pull failed: {}", out.trimmed())),
                }
            }
            Err(e) => {
                warn!(error = %e, "git pull could not run");
                PullOutcome {
                    updated: false,
                    error: Some(format!("git pull failed: {:#}", e)),
                }
            }
        }
    }

    /// Current HEAD of the config checkout, empty when unknown.
    pub async fn revision(&self) -> String {
        exec::query(self.runner.as_ref(), &self.git(&["rev-parse", "HEAD"]))
            .await
            .unwrap_or_default()
    }

    /// Compare local HEAD against the tracked remote.
    pub async fn drift_status(&self) -> DriftStatus {
        let local = self.revision().await;
        let remote = exec::query(self.runner.as_ref(), &self.git(&["ls-remote", "origin", "HEAD"]))
            .await
            .and_then(|line| line.split_whitespace().next().map(str::to_string));
        DriftStatus::new(local, remote)
    }

    /// Validate the on-disk config and reload the proxy only if validation passed.
    /// Records the outcome in the shared state exactly once.
    pub async fn validate_and_activate(&self) -> ReconciliationResult {
        let revision = self.revision().await;
        let result = match self.activate().await {
            Ok(()) => {
                info!(revision = %revision, "proxy config validated and reloaded");
                ReconciliationResult::succeeded(revision)
            }
            Err(detail) => {
                error!(revision = %revision, detail = %detail, "proxy config not activated");
                ReconciliationResult::failed(detail, revision)
            }
        };
        self.state.record_reconciliation(result.clone()).await;
        result
    }

    async fn activate(&self) -> Result<(), String> {
        self.step("validation", &self.config.validate_command).await?;
        self.step("reload", &self.config.reload_command).await
    }

    async fn step(&self, name: &str, argv: &[String]) -> Result<(), String> {
        match self.runner.run(argv).await {
            Ok(out) if out.success => Ok(()),
            Ok(out) => Err(format!("{} failed: {}", name, out.trimmed())),
            Err(e) => Err(format!("{} failed: {:#}", name, e)),
        }
    }

    /// One full cycle. A failed pull marks the result failed and skips
    /// validation so the running config stays in place.
    pub async fn reconcile(&self) -> ReconciliationResult {
        let pull = self.pull().await;
        if let Some(detail) = pull.error {
            let result = ReconciliationResult::failed(detail, self.revision().await);
            self.state.record_reconciliation(result.clone()).await;
            return result;
        }
        self.validate_and_activate().await
    }
}
