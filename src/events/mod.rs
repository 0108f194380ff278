//! Operational events.
//!
//! Publishing is best-effort: a sink never reports failure to its caller, it logs it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

pub const LOG_TYPE_DISPATCH_ERROR: &str = "eventDispatchError";

/// Fire-and-forget destination for events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value);
}

/// Posts each event as JSON to a webhook
pub struct WebhookSink {
    http: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    async fn publish(&self, topic: &str, payload: Value) {
        let body = json!({ "topic": topic, "data": payload });

        match self.http.post(&self.url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!("Event publish to {} returned {}", topic, response.status()),
            Err(e) => warn!("Event publish to {} failed: {}", topic, e),
        }
    }
}

/// Writes events to the log; used when no webhook is configured.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn publish(&self, topic: &str, payload: Value) {
        info!(topic = topic, "📣 {}", payload);
    }
}

/// Adds the common envelope and hands typed events to a sink
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    topic: String,
    app_server: String,
    network: String,
    enabled: bool,
}

impl EventPublisher {
    pub fn new(
        sink: Arc<dyn EventSink>,
        topic: impl Into<String>,
        app_server: impl Into<String>,
        network: impl Into<String>,
        enabled: bool,
    ) -> Self {
        Self {
            sink,
            topic: topic.into(),
            app_server: app_server.into(),
            network: network.into(),
            enabled,
        }
    }

    pub async fn emit<E: Serialize + Sync>(&self, event: &E) {
        if !self.enabled {
            return;
        }

        let mut payload = match serde_json::to_value(event) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                warn!("Refusing to publish non-object event: {}", other);
                return;
            }
            Err(e) => {
                warn!("Failed to serialize event: {}", e);
                return;
            }
        };

        payload.insert("@timestamp".to_string(), Value::from(Utc::now().to_rfc3339()));
        payload.insert("appServer".to_string(), Value::from(self.app_server.clone()));
        payload.insert("network".to_string(), Value::from(self.network.clone()));
        payload.insert("uuidv4".to_string(), Value::from(Uuid::new_v4().to_string()));

        self.sink.publish(&self.topic, Value::Object(payload)).await;
    }
}

/// Emitted once a batch has been broadcast and recorded
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementEvent {
    pub log_type: &'static str,
    pub from_wallet: String,
    pub to_wallet: String,
    pub to_id: Option<String>,
    /// Display units
    pub amount: String,
    pub tx_hash: String,
    pub tx_sequence: u64,
    pub current_block: Option<u64>,
    pub payout_ids: Vec<String>,
}

/// Emitted when a recipient's dispatch ends in failure
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchErrorEvent {
    pub log_type: &'static str,
    pub from_wallet: String,
    pub to_wallet: String,
    pub tx_hash: Option<String>,
    pub raw_signed_tx: Option<String>,
    pub tx_sequence: u64,
    pub error: String,
}

#[cfg(test)]
pub mod recording {
    use super::*;
    use parking_lot::Mutex;

    /// Captures every published event
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<(String, Value)> {
            self.events.lock().clone()
        }

        pub fn of_type(&self, log_type: &str) -> Vec<Value> {
            self.events
                .lock()
                .iter()
                .filter(|(_, e)| e["logType"] == log_type)
                .map(|(_, e)| e.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(&self, topic: &str, payload: Value) {
            self.events.lock().push((topic.to_string(), payload));
        }
    }

    pub fn publisher(sink: Arc<RecordingSink>) -> EventPublisher {
        EventPublisher::new(sink, "misc", "test-settler", "testnet", true)
    }
}

#[cfg(test)]
mod tests {
    use super::recording::{publisher, RecordingSink};
    use super::*;

    fn error_event() -> DispatchErrorEvent {
        DispatchErrorEvent {
            log_type: LOG_TYPE_DISPATCH_ERROR,
            from_wallet: "0x1".to_string(),
            to_wallet: "0x2".to_string(),
            tx_hash: None,
            raw_signed_tx: None,
            tx_sequence: 3,
            error: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_envelope_fields() {
        let sink = Arc::new(RecordingSink::new());
        publisher(sink.clone()).emit(&error_event()).await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let (topic, event) = &events[0];
        assert_eq!(topic, "misc");
        assert_eq!(event["logType"], LOG_TYPE_DISPATCH_ERROR);
        assert_eq!(event["txSequence"], 3);
        assert_eq!(event["appServer"], "test-settler");
        assert_eq!(event["network"], "testnet");
        assert!(event["@timestamp"].is_string());
        assert!(Uuid::parse_str(event["uuidv4"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_disabled_publisher_is_silent() {
        let sink = Arc::new(RecordingSink::new());
        let publisher = EventPublisher::new(sink.clone(), "misc", "a", "b", false);

        publisher.emit(&error_event()).await;
        assert!(sink.events().is_empty());
    }
}
