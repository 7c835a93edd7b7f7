//! Journal entry normalization and the follower process.

use std::process::Stdio;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

/// A shipped log record: arbitrary JSON fields plus the enrichment keys
/// `message`, `unit`, `logger` and `level`.
pub type LogRecord = Map<String, Value>;

/// syslog severities, indexed by journal `PRIORITY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

impl Severity {
    pub fn from_priority(priority: &str) -> Option<Self> {
        Some(match priority {
            "0" => Severity::Emergency,
            "1" => Severity::Alert,
            "2" => Severity::Critical,
            "3" => Severity::Error,
            "4" => Severity::Warning,
            "5" => Severity::Notice,
            "6" => Severity::Info,
            "7" => Severity::Debug,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Emergency => "emergency",
            Severity::Alert => "alert",
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
            Severity::Info => "info",
            Severity::Debug => "debug",
        }
    }
}

/// Turn one `journalctl -o json` line into a shipped record. Lines that are
/// not JSON objects or carry no string `MESSAGE` yield `None`.
pub fn normalize(line: &str) -> Option<LogRecord> {
    let entry: Map<String, Value> = serde_json::from_str(line).ok()?;
    let raw = entry.get("MESSAGE")?.as_str()?;

    let mut record = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(fields)) => fields,
        _ => {
            let mut plain = Map::new();
            plain.insert("message".into(), Value::String(raw.to_string()));
            plain
        }
    };

    if let Some(unit) = entry.get("_SYSTEMD_UNIT").and_then(Value::as_str) {
        record.insert("unit".into(), Value::String(unit.to_string()));
        if !record.contains_key("logger") {
            let logger = unit.strip_suffix(".service").unwrap_or(unit);
            record.insert("logger".into(), Value::String(logger.to_string()));
        }
    }

    if let Some(severity) = entry
        .get("PRIORITY")
        .and_then(Value::as_str)
        .and_then(Severity::from_priority)
    {
        if record.get("level").map_or(true, Value::is_null) {
            record.insert("level".into(), Value::String(severity.as_str().into()));
        }
    }

    Some(record)
}

/// A running journal follower.
pub struct JournalSource {
    child: Child,
    lines: tokio::io::Split<BufReader<ChildStdout>>,
}

impl JournalSource {
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().context("empty log source command")?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", program))?;
        let stdout = child.stdout.take().context("log source has no stdout")?;
        Ok(Self {
            child,
            lines: BufReader::new(stdout).split(b'\n'),
        })
    }

    /// Next raw line, or `None` once the follower's output ends.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        let line = self.lines.next_segment().await.context("reading log source")?;
        Ok(line.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Reap the follower after its output ended.
    pub async fn wait(mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.context("waiting for log source")
    }
}
