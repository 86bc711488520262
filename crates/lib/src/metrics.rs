//! Live metrics ingestion.
//!
//! Components can expose a line-delimited JSON metrics feed over TCP. A
//! [`MetricsSource`] yields a stream of [`MetricsEvent`]s; the operation
//! phase's listener stage folds them into per-host data as they arrive.
//!
//! Wire protocol of [`TcpMetricsSource`]:
//!
//! 1. connect and send `{"subscribe":"metrics"}` on one line
//! 2. the feed answers `{"ok":true}` within the handshake timeout
//! 3. every following line is one event:
//!    `{"source":"svc0","timestamp_ms":1000,"metrics":{"rps":120.0}}`

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::model::HostData;

/// Default time a feed gets to acknowledge a subscription.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel capacity between the reader task and the consumer.
const EVENT_BUFFER: usize = 64;

/// One metrics sample from a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEvent {
  /// Host id the sample belongs to.
  pub source: String,
  pub timestamp_ms: u64,
  pub metrics: BTreeMap<String, f64>,
}

/// Errors from metrics ingestion.
#[derive(Debug, Error)]
pub enum MetricsError {
  #[error("failed to connect to metrics feed at {endpoint}")]
  Connect {
    endpoint: String,
    #[source]
    source: std::io::Error,
  },

  #[error("metrics feed did not acknowledge subscription within {0:?}")]
  HandshakeTimeout(Duration),

  #[error("metrics feed rejected subscription: {0}")]
  HandshakeRejected(String),

  #[error("metrics feed io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("invalid metrics payload: {0}")]
  Parse(#[from] serde_json::Error),
}

/// Stream of metrics events.
#[async_trait]
pub trait MetricsSource: Send + Sync {
  /// Open the stream. The receiver ends when the feed closes.
  async fn subscribe(&self) -> Result<mpsc::Receiver<MetricsEvent>, MetricsError>;
}

/// Fold one event into a host's scratch data under the `metrics` key.
///
/// Later samples overwrite earlier values of the same metric; the event's
/// timestamp rides along so consumers can see how fresh the data is.
pub fn fold_event(data: &HostData, event: &MetricsEvent) {
  data.update(|map| {
    let entry = map
      .entry("metrics".to_string())
      .or_insert_with(|| serde_json::json!({}));
    if let serde_json::Value::Object(obj) = entry {
      for (name, value) in &event.metrics {
        obj.insert(name.clone(), serde_json::json!(value));
      }
      obj.insert("timestamp_ms".to_string(), serde_json::json!(event.timestamp_ms));
    }
  });
}

#[derive(Serialize)]
struct SubscribeRequest<'a> {
  subscribe: &'a str,
}

#[derive(Deserialize)]
struct SubscribeAck {
  ok: bool,
  #[serde(default)]
  error: Option<String>,
}

/// Metrics source reading line-delimited JSON over TCP.
pub struct TcpMetricsSource {
  endpoint: String,
  handshake_timeout: Duration,
}

impl TcpMetricsSource {
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
    }
  }

  pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
    self.handshake_timeout = timeout;
    self
  }
}

#[async_trait]
impl MetricsSource for TcpMetricsSource {
  async fn subscribe(&self) -> Result<mpsc::Receiver<MetricsEvent>, MetricsError> {
    let stream = TcpStream::connect(&self.endpoint)
      .await
      .map_err(|source| MetricsError::Connect {
        endpoint: self.endpoint.clone(),
        source,
      })?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    let request = serde_json::to_string(&SubscribeRequest { subscribe: "metrics" })?;
    write_half.write_all(request.as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    let ack_line = match timeout(self.handshake_timeout, reader.next_line()).await {
      Err(_) => return Err(MetricsError::HandshakeTimeout(self.handshake_timeout)),
      Ok(result) => result?.ok_or_else(|| {
        MetricsError::HandshakeRejected("feed closed before acknowledging".to_string())
      })?,
    };
    let ack: SubscribeAck = serde_json::from_str(&ack_line)?;
    if !ack.ok {
      return Err(MetricsError::HandshakeRejected(
        ack.error.unwrap_or_else(|| "subscription refused".to_string()),
      ));
    }
    debug!(endpoint = %self.endpoint, "subscribed to metrics feed");

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let endpoint = self.endpoint.clone();
    tokio::spawn(async move {
      // Keep the write half alive so the feed sees an open connection.
      let _write_half = write_half;
      loop {
        match reader.next_line().await {
          Ok(Some(line)) => {
            if line.trim().is_empty() {
              continue;
            }
            match serde_json::from_str::<MetricsEvent>(&line) {
              Ok(event) => {
                if tx.send(event).await.is_err() {
                  // Consumer went away.
                  break;
                }
              }
              Err(e) => warn!(endpoint = %endpoint, error = %e, "skipping malformed metrics line"),
            }
          }
          Ok(None) => {
            debug!(endpoint = %endpoint, "metrics feed closed");
            break;
          }
          Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "metrics feed read error");
            break;
          }
        }
      }
    });

    Ok(rx)
  }
}
