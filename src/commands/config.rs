//! `edge-agent config`: inspect and edit the layered configuration.

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::config::{flatten, is_secret_key, mask_secret, AgentConfig, ConfigSource};

fn display_value(key: &str, value: String) -> String {
    if is_secret_key(key) && !value.is_empty() {
        mask_secret(&value)
    } else {
        value
    }
}

pub fn show(source: &ConfigSource) -> Result<()> {
    let config = source.load()?;
    let tree = serde_json::to_value(&config).context("serializing config")?;

    println!(
        "{}",
        "Current configuration (precedence: Flag > Env > Config > Default):".bold()
    );
    for (key, value) in flatten(&tree) {
        let provenance = source.provenance(&key);
        println!(
            "  {:<32} {:<40} ({})",
            key,
            display_value(&key, value),
            provenance.label().dimmed()
        );
    }

    let files = source.files_in_use();
    if files.is_empty() {
        println!("\nNo config file found; writes go to {}", source.writable_path().display());
    } else {
        for file in files {
            println!("\nConfig file used: {}", file.display());
        }
    }
    Ok(())
}

pub fn get(source: &ConfigSource, key: &str) -> Result<()> {
    let config = source.load()?;
    let tree = serde_json::to_value(&config).context("serializing config")?;
    let prefix = format!("{}.", key);

    let matches: Vec<(String, String)> = flatten(&tree)
        .into_iter()
        .filter(|(k, _)| k == key || k.starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => bail!("unknown config key '{}'", key),
        [(k, v)] if k == key => println!("{}", display_value(k, v.clone())),
        section => {
            for (k, v) in section {
                println!("{} = {}", k, display_value(k, v.clone()));
            }
        }
    }
    Ok(())
}

pub fn set(source: &ConfigSource, key: &str, value: &str) -> Result<()> {
    let known = serde_json::to_value(AgentConfig::default()).context("serializing defaults")?;
    if !flatten(&known).iter().any(|(k, _)| k == key) {
        bail!("unknown config key '{}'", key);
    }

    let path = source.set_value(key, value)?;
    println!(
        "{} {} = {} ({})",
        "✓".green(),
        key,
        display_value(key, value.to_string()),
        path.display()
    );
    Ok(())
}
