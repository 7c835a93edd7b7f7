//! Layered agent configuration.
//!
//! Precedence, highest first: CLI flag, `EDGE_AGENT_*` environment variable,
//! YAML config file, built-in default. Nested keys use `__` in environment
//! variable names (`EDGE_AGENT_PROXY__CONFIG_DIR`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::domain::types::NodeRole;

pub const ENV_PREFIX: &str = "EDGE_AGENT_";
const SYSTEM_CONFIG: &str = "/etc/edge-agent/edge-agent.yaml";
const LOCAL_CONFIG: &str = "edge-agent.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "node_id is required. Set it permanently with `edge-agent config set node_id <name>`, \
         once with --node-id, or via the EDGE_AGENT_NODE_ID environment variable"
    )]
    MissingNodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node_id: String,
    pub node_role: NodeRole,
    pub control_url: String,
    pub log_level: String,
    pub verbose: bool,
    pub auto_pull: bool,
    pub tick_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Loopback address for the local status API. Empty disables it.
    pub status_addr: String,
    /// Bearer token for artifact downloads. Never printed in full.
    pub github_token: String,
    pub proxy: ProxyConfig,
    pub logs: LogsConfig,
    pub update: UpdateConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            node_role: NodeRole::Server,
            control_url: "https://control.edge.internal".to_string(),
            log_level: "info".to_string(),
            verbose: false,
            auto_pull: true,
            tick_interval_secs: 10,
            request_timeout_secs: 10,
            command_timeout_secs: 60,
            status_addr: "127.0.0.1:9110".to_string(),
            github_token: String::new(),
            proxy: ProxyConfig::default(),
            logs: LogsConfig::default(),
            update: UpdateConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn effective_log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.log_level
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn token(&self) -> Option<&str> {
        Some(self.github_token.as_str()).filter(|t| !t.is_empty())
    }
}

/// The edge proxy and the git checkout it is configured from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub config_dir: PathBuf,
    pub validate_command: Vec<String>,
    pub reload_command: Vec<String>,
    pub version_command: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let caddyfile = "/etc/caddy/Caddyfile";
        Self {
            config_dir: PathBuf::from("/etc/caddy"),
            validate_command: argv(&["caddy", "validate", "--config", caddyfile]),
            reload_command: argv(&["caddy", "reload", "--config", caddyfile]),
            version_command: argv(&["caddy", "version"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub enabled: bool,
    pub source_command: Vec<String>,
    pub restart_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_command: argv(&["journalctl", "-f", "-o", "json", "-n", "0"]),
            restart_delay_secs: 2,
            connect_timeout_secs: 10,
        }
    }
}

impl LogsConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub enabled: bool,
    /// Artifact URL with `{version}` (no leading `v`) and `{arch}` placeholders.
    pub release_url: String,
    pub verify: bool,
    /// Supervisor command run after a successful replace. Empty skips the restart.
    pub restart_command: Vec<String>,
    pub download_timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            release_url:
                "https://github.com/edge-ops/edge-agent/releases/download/v{version}/edge-agent-linux-{arch}"
                    .to_string(),
            verify: true,
            restart_command: argv(&["systemctl", "restart", "edge-agent"]),
            download_timeout_secs: 300,
        }
    }
}

pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Values given on the command line. Unset fields fall through to lower layers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_role: Option<NodeRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_url: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub verbose: bool,
}

impl CliOverrides {
    fn sets(&self, key: &str) -> bool {
        match key {
            "node_id" => self.node_id.is_some(),
            "node_role" => self.node_role.is_some(),
            "control_url" => self.control_url.is_some(),
            "verbose" => self.verbose,
            _ => false,
        }
    }
}

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Default,
    ConfigFile,
    Environment,
    Flag,
}

impl Provenance {
    pub fn label(&self) -> &'static str {
        match self {
            Provenance::Default => "Default",
            Provenance::ConfigFile => "Config File",
            Provenance::Environment => "Environment",
            Provenance::Flag => "Flag",
        }
    }
}

/// Re-readable configuration source. Every `load()` yields a fresh, consistent
/// snapshot of all layers.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    files: Vec<PathBuf>,
    explicit: bool,
    overrides: CliOverrides,
}

impl ConfigSource {
    pub fn new(config_path: Option<PathBuf>, overrides: CliOverrides) -> Self {
        match config_path {
            Some(path) => Self {
                files: vec![path],
                explicit: true,
                overrides,
            },
            None => Self {
                files: vec![PathBuf::from(SYSTEM_CONFIG), PathBuf::from(LOCAL_CONFIG)],
                explicit: false,
                overrides,
            },
        }
    }

    fn file_figment(&self) -> Figment {
        self.files
            .iter()
            .fold(Figment::new(), |fig, path| fig.merge(Yaml::file(path)))
    }

    pub fn figment(&self) -> Figment {
        Figment::from(Serialized::defaults(AgentConfig::default()))
            .merge(self.file_figment())
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(&self.overrides))
    }

    pub fn load(&self) -> Result<AgentConfig> {
        self.figment()
            .extract()
            .context("loading agent configuration")
    }

    pub fn files_in_use(&self) -> Vec<&Path> {
        self.files
            .iter()
            .filter(|p| p.exists())
            .map(|p| p.as_path())
            .collect()
    }

    pub fn provenance(&self, key: &str) -> Provenance {
        if self.overrides.sets(key) {
            Provenance::Flag
        } else if std::env::var_os(env_var_name(key)).is_some() {
            Provenance::Environment
        } else if self.file_figment().find_value(key).is_ok() {
            Provenance::ConfigFile
        } else {
            Provenance::Default
        }
    }

    /// File that `config set` writes to: the explicit `--config` path, an
    /// existing local file, or the system-wide file.
    pub fn writable_path(&self) -> PathBuf {
        if self.explicit {
            return self.files[0].clone();
        }
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            return local;
        }
        let system = PathBuf::from(SYSTEM_CONFIG);
        match system.parent().map(std::fs::create_dir_all) {
            Some(Ok(())) => system,
            _ => local,
        }
    }

    /// Persist `key = raw` into the writable config file. The write is rolled
    /// back if the resulting configuration no longer loads.
    pub fn set_value(&self, key: &str, raw: &str) -> Result<PathBuf> {
        let path = self.writable_path();
        let original = if path.exists() {
            Some(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
            )
        } else {
            None
        };

        let mut doc = match original.as_deref() {
            Some(content) if !content.trim().is_empty() => serde_yaml::from_str(content)
                .with_context(|| format!("parsing {}", path.display()))?,
            _ => serde_yaml::Value::Mapping(Default::default()),
        };
        set_field_path(&mut doc, key, parse_scalar(raw));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let content = serde_yaml::to_string(&doc).context("serializing config")?;
        std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;

        if let Err(e) = self.load() {
            match original {
                Some(content) => std::fs::write(&path, content)
                    .with_context(|| format!("restoring {}", path.display()))?,
                None => std::fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?,
            }
            return Err(e.context(format!("rejected value for '{}'", key)));
        }
        Ok(path)
    }
}

fn env_var_name(key: &str) -> String {
    format!("{}{}", ENV_PREFIX, key.replace('.', "__").to_uppercase())
}

fn parse_scalar(raw: &str) -> serde_yaml::Value {
    match serde_yaml::from_str::<serde_yaml::Value>(raw) {
        Ok(serde_yaml::Value::Mapping(_)) | Err(_) => serde_yaml::Value::String(raw.to_string()),
        Ok(value) => value,
    }
}

/// Set a dot-separated field path in a YAML tree, creating mappings on the way.
fn set_field_path(doc: &mut serde_yaml::Value, path: &str, value: serde_yaml::Value) {
    let mut current = doc;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if !current.is_mapping() {
            *current = serde_yaml::Value::Mapping(Default::default());
        }
        let serde_yaml::Value::Mapping(map) = current else {
            return;
        };
        let key = serde_yaml::Value::String(part.to_string());
        if i == parts.len() - 1 {
            map.insert(key, value);
            return;
        }
        current = map
            .entry(key)
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
    }
}

/// Flatten a config tree into `(dotted.key, rendered value)` pairs.
pub fn flatten(value: &serde_json::Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(value, "", &mut out);
    out
}

fn flatten_into(value: &serde_json::Value, prefix: &str, out: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten_into(v, &key, out);
            }
        }
        serde_json::Value::String(s) => out.push((prefix.to_string(), s.clone())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

/// Masked form of a secret: first and last four characters only.
pub fn mask_secret(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}....{}", head, tail)
}

pub fn is_secret_key(key: &str) -> bool {
    key.contains("token")
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn explicit(overrides: CliOverrides) -> ConfigSource {
        ConfigSource::new(Some(PathBuf::from("edge-agent.yaml")), overrides)
    }

    #[test]
    fn defaults_apply_without_any_source() {
        Jail::expect_with(|_jail| {
            let cfg = explicit(CliOverrides::default()).load().map_err(|e| e.to_string())?;
            assert_eq!(cfg.node_role, NodeRole::Server);
            assert_eq!(cfg.tick_interval_secs, 10);
            assert!(cfg.auto_pull);
            assert_eq!(cfg.proxy.config_dir, PathBuf::from("/etc/caddy"));
            assert_eq!(cfg.token(), None);
            Ok(())
        });
    }

    #[test]
    fn layers_follow_precedence() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "edge-agent.yaml",
                "node_id: from-file\nnode_role: gateway\ncontrol_url: https://file.example\n\
                 proxy:\n  config_dir: /srv/caddy\n",
            )?;
            jail.set_env("EDGE_AGENT_CONTROL_URL", "https://env.example");
            jail.set_env("EDGE_AGENT_LOGS__RESTART_DELAY_SECS", "7");

            let source = explicit(CliOverrides {
                node_id: Some("from-flag".into()),
                ..Default::default()
            });
            let cfg = source.load().map_err(|e| e.to_string())?;
            assert_eq!(cfg.node_id, "from-flag");
            assert_eq!(cfg.node_role, NodeRole::Gateway);
            assert_eq!(cfg.control_url, "https://env.example");
            assert_eq!(cfg.proxy.config_dir, PathBuf::from("/srv/caddy"));
            assert_eq!(cfg.logs.restart_delay_secs, 7);

            assert_eq!(source.provenance("node_id"), Provenance::Flag);
            assert_eq!(source.provenance("control_url"), Provenance::Environment);
            assert_eq!(source.provenance("node_role"), Provenance::ConfigFile);
            assert_eq!(source.provenance("auto_pull"), Provenance::Default);
            Ok(())
        });
    }

    #[test]
    fn each_load_sees_current_file() {
        Jail::expect_with(|jail| {
            jail.create_file("edge-agent.yaml", "node_role: server\n")?;
            let source = explicit(CliOverrides::default());
            assert_eq!(source.load().map_err(|e| e.to_string())?.node_role, NodeRole::Server);

            jail.create_file("edge-agent.yaml", "node_role: gateway\n")?;
            assert_eq!(source.load().map_err(|e| e.to_string())?.node_role, NodeRole::Gateway);
            Ok(())
        });
    }

    #[test]
    fn set_value_writes_nested_keys() {
        Jail::expect_with(|jail| {
            jail.create_file("edge-agent.yaml", "node_id: gw-01\n")?;
            let source = explicit(CliOverrides::default());
            source
                .set_value("proxy.config_dir", "/opt/caddy")
                .map_err(|e| e.to_string())?;
            source.set_value("auto_pull", "false").map_err(|e| e.to_string())?;

            let cfg = source.load().map_err(|e| e.to_string())?;
            assert_eq!(cfg.node_id, "gw-01");
            assert_eq!(cfg.proxy.config_dir, PathBuf::from("/opt/caddy"));
            assert!(!cfg.auto_pull);
            Ok(())
        });
    }

    #[test]
    fn set_value_rolls_back_invalid_values() {
        Jail::expect_with(|jail| {
            jail.create_file("edge-agent.yaml", "node_role: gateway\n")?;
            let source = explicit(CliOverrides::default());
            assert!(source.set_value("node_role", "edge").is_err());

            let content = std::fs::read_to_string(jail.directory().join("edge-agent.yaml"))
                .map_err(|e| e.to_string())?;
            assert_eq!(content, "node_role: gateway\n");
            Ok(())
        });
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("12345678"), "****");
        assert_eq!(mask_secret("ghp_abcdefghijklmnop"), "ghp_....mnop");
        assert!(is_secret_key("github_token"));
        assert!(!is_secret_key("node_id"));
    }

    #[test]
    fn flatten_produces_dotted_keys() {
        let value = serde_json::to_value(AgentConfig::default()).unwrap();
        let flat = flatten(&value);
        assert!(flat
            .iter()
            .any(|(k, v)| k == "proxy.config_dir" && v == "/etc/caddy"));
        assert!(flat.iter().any(|(k, v)| k == "auto_pull" && v == "true"));
    }
}
