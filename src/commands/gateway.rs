//! `edge-agent gateway`: run reconciler steps by hand.

use std::sync::Arc;

use anyhow::{bail, Result};
use colored::Colorize;

use crate::commands::init_tracing;
use crate::commands::version::VERSION;
use crate::config::{AgentConfig, ConfigSource};
use crate::domain::reconciler::ConfigReconciler;
use crate::domain::state::AgentState;
use crate::exec::SystemRunner;

fn reconciler(config: &AgentConfig) -> ConfigReconciler {
    let state = Arc::new(AgentState::new(
        config.node_id.clone(),
        config.node_role,
        VERSION,
    ));
    ConfigReconciler::new(
        config.proxy.clone(),
        Arc::new(SystemRunner::new(config.command_timeout())),
        state,
    )
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let rt = tokio::runtime::Runtime::new()?;
    Ok(rt.block_on(future))
}

pub fn pull(source: &ConfigSource) -> Result<()> {
    let config = source.load()?;
    init_tracing(config.effective_log_level(), false);

    let outcome = block_on(reconciler(&config).pull())?;
    if let Some(error) = outcome.error {
        bail!(error);
    }
    if outcome.updated {
        println!("{} proxy config updated", "✓".green());
    } else {
        println!("{} proxy config already up to date", "✓".green());
    }
    Ok(())
}

pub fn reload(source: &ConfigSource) -> Result<()> {
    let config = source.load()?;
    init_tracing(config.effective_log_level(), false);

    let result = block_on(reconciler(&config).validate_and_activate())?;
    if !result.ok {
        bail!(result.error_detail);
    }
    println!("{} proxy reloaded", "✓".green());
    if !result.config_revision.is_empty() {
        println!("  revision: {}", result.config_revision);
    }
    Ok(())
}

pub fn status(source: &ConfigSource) -> Result<()> {
    let config = source.load()?;
    let drift = block_on(reconciler(&config).drift_status())?;

    println!("{}", "edge-agent gateway status".bold());
    println!("  node id:        {}", config.node_id);
    println!("  node role:      {}", config.node_role);
    println!("  agent version:  {}", VERSION);
    println!("  local revision: {}", drift.local_revision);
    println!(
        "  remote revision: {}",
        drift.remote_revision.as_deref().unwrap_or("unknown")
    );
    if drift.drift {
        println!(
            "  status:         {} (run `edge-agent gateway pull` to sync)",
            "DRIFTED".red()
        );
    } else {
        println!("  status:         {}", "up to date".green());
    }
    Ok(())
}
