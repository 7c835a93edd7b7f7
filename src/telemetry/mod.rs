pub mod journal;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::LogsConfig;
use crate::telemetry::journal::{normalize, JournalSource, LogRecord};

/// Destination for normalized log records. Returns whether the record was sent.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn deliver(&self, record: LogRecord) -> bool;
}

enum ShipperState {
    Starting,
    Streaming(JournalSource),
    Backoff,
}

/// Follows the journal and forwards every usable entry to a sink. Restarts
/// the follower after a fixed delay whenever it exits or fails to start.
pub struct LogShipper {
    source_command: Vec<String>,
    restart_delay: Duration,
    sink: Arc<dyn RecordSink>,
}

impl LogShipper {
    pub fn new(config: &LogsConfig, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            source_command: config.source_command.clone(),
            restart_delay: config.restart_delay(),
            sink,
        }
    }

    /// Runs for the lifetime of the process.
    pub async fn run(self) {
        info!(command = %self.source_command.join(" "), "starting log shipper");
        let mut state = ShipperState::Starting;
        loop {
            state = self.step(state).await;
        }
    }

    async fn step(&self, state: ShipperState) -> ShipperState {
        match state {
            ShipperState::Starting => match JournalSource::spawn(&self.source_command) {
                Ok(source) => {
                    debug!("log source attached");
                    ShipperState::Streaming(source)
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "log source failed to start");
                    ShipperState::Backoff
                }
            },
            ShipperState::Streaming(mut source) => {
                self.forward(&mut source).await;
                match source.wait().await {
                    Ok(status) => warn!(%status, "log source exited, restarting"),
                    Err(e) => warn!(error = %format!("{:#}", e), "log source lost, restarting"),
                }
                ShipperState::Backoff
            }
            ShipperState::Backoff => {
                tokio::time::sleep(self.restart_delay).await;
                ShipperState::Starting
            }
        }
    }

    async fn forward(&self, source: &mut JournalSource) {
        loop {
            match source.next_line().await {
                Ok(Some(line)) => {
                    if let Some(record) = normalize(&line) {
                        self.sink.deliver(record).await;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "log source read failed");
                    return;
                }
            }
        }
    }
}
