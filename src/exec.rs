//! Subprocess execution.
//!
//! Reconciliation and heartbeat code reach git and the proxy binary only
//! through [`CommandRunner`], so their decision logic runs without a real
//! checkout in tests.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout followed by stderr.
    pub output: String,
}

impl CommandOutput {
    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput>;
}

pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let (program, args) = argv.split_first().context("empty command line")?;
        let child = Command::new(program).args(args).kill_on_drop(true).output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .with_context(|| {
                format!("{} timed out after {}s", program, self.timeout.as_secs())
            })?
            .with_context(|| format!("failed to run {}", program))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            output: combined,
        })
    }
}

/// Best-effort: trimmed output of a successful command, `None` otherwise.
pub async fn query(runner: &dyn CommandRunner, argv: &[String]) -> Option<String> {
    match runner.run(argv).await {
        Ok(out) if out.success => Some(out.trimmed().to_string()),
        _ => None,
    }
}
