//! Persistent WebSocket connection to the control plane's log endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::journal::LogRecord;
use super::RecordSink;

type Connection = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const NODE_ID_HEADER: &str = "X-Node-ID";

struct ConnState {
    ws: Option<Connection>,
    failures: u32,
}

/// At-most-once record delivery. Records that cannot be sent are dropped;
/// the connection is re-established lazily by the next record.
pub struct LogStream {
    url: String,
    node_id: String,
    connect_timeout: Duration,
    conn: Mutex<ConnState>,
}

impl LogStream {
    pub fn new(url: impl Into<String>, node_id: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            node_id: node_id.into(),
            connect_timeout,
            conn: Mutex::new(ConnState {
                ws: None,
                failures: 0,
            }),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid log stream URL {}", self.url))?;
        request.headers_mut().insert(
            NODE_ID_HEADER,
            HeaderValue::from_str(&self.node_id).context("node id is not a valid header value")?,
        );

        let (ws, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .with_context(|| format!("connect timed out after {}s", self.connect_timeout.as_secs()))?
            .context("websocket handshake failed")?;
        Ok(ws)
    }

    /// Send one record as a single text frame. The lock serializes connects
    /// and writes, so frames never interleave.
    pub async fn send(&self, record: &LogRecord) -> bool {
        let payload = match serde_json::to_string(record) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "unserializable log record dropped");
                return false;
            }
        };

        let mut conn = self.conn.lock().await;
        if conn.ws.is_none() {
            match self.connect().await {
                Ok(ws) => {
                    info!(url = %self.url, after_failures = conn.failures, "log stream connected");
                    conn.failures = 0;
                    conn.ws = Some(ws);
                }
                Err(e) => {
                    conn.failures += 1;
                    if conn.failures == 1 {
                        warn!(url = %self.url, error = %format!("{:#}", e), "log stream connection failed");
                    } else {
                        debug!(url = %self.url, attempts = conn.failures, error = %format!("{:#}", e), "log stream still unavailable");
                    }
                    return false;
                }
            }
        }

        let Some(ws) = conn.ws.as_mut() else {
            return false;
        };
        let sent = ws.send(Message::Text(payload.into())).await;
        if let Err(e) = sent {
            warn!(error = %e, "log stream write failed, reconnecting on next record");
            conn.ws = None;
            return false;
        }
        true
    }
}

#[async_trait]
impl RecordSink for LogStream {
    async fn deliver(&self, record: LogRecord) -> bool {
        self.send(&record).await
    }
}
