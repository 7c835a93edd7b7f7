use anyhow::Result;
use colored::Colorize;

use crate::client::ControlPlaneClient;
use crate::config::ConfigSource;
use crate::domain::heartbeat::versions_match;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Print the running version. This output doubles as the self-check a
/// freshly downloaded binary must pass, so the first line stays stable.
pub fn run(source: ConfigSource, check: bool) -> Result<()> {
    println!("edge-agent {}", VERSION);
    if !check {
        return Ok(());
    }

    let config = source.load()?;
    let client = ControlPlaneClient::new(&config.control_url, config.request_timeout())?;
    let rt = tokio::runtime::Runtime::new()?;
    match rt.block_on(client.latest_version())? {
        None => println!("  latest:  {}", "unknown".yellow()),
        Some(latest) if versions_match(&latest, VERSION) => {
            println!("  latest:  {} {}", latest, "(up to date)".green());
        }
        Some(latest) => {
            println!("  latest:  {} {}", latest, "(update available)".yellow());
            println!("  hint:    run `edge-agent update` to install it");
        }
    }
    Ok(())
}
