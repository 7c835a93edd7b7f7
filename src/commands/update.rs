//! `edge-agent update`: install a release now and restart the service.

use anyhow::{Context, Result};
use colored::Colorize;

use crate::client::ControlPlaneClient;
use crate::commands::init_tracing;
use crate::commands::version::VERSION;
use crate::config::{AgentConfig, ConfigSource};
use crate::domain::heartbeat::versions_match;
use crate::domain::updater::SelfUpdater;

pub fn run(source: ConfigSource, target: Option<String>, force: bool) -> Result<()> {
    let config = source.load()?;
    init_tracing(config.effective_log_level(), false);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config, target, force))
}

async fn run_async(config: AgentConfig, target: Option<String>, force: bool) -> Result<()> {
    let target = match target {
        Some(t) => t,
        None => {
            let client = ControlPlaneClient::new(&config.control_url, config.request_timeout())?;
            client
                .latest_version()
                .await?
                .context("control plane has no published agent version")?
        }
    };

    if !force && versions_match(&target, VERSION) {
        println!("{} edge-agent {} is already running", "✓".green(), VERSION);
        return Ok(());
    }

    println!("Updating edge-agent {} → {}", VERSION, target.bold());
    let updater = SelfUpdater::new(config.update.clone(), config.token().map(str::to_string));
    let path = updater.install(&target).await?;
    println!("{} installed {} at {}", "✓".green(), target, path.display());

    updater.restart_service().await;
    Ok(())
}
