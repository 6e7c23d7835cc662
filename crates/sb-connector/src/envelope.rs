//! Envelope around one broker-delivered message
//!
//! The payload is decoded exactly once at construction with best-effort
//! content sniffing; disposition runs through the channel's coordinators
//! and resolves at most once, regardless of how many times or from how
//! many tasks ack/nack are invoked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use bytes::Bytes;
use sb_broker::{InboundMessage, SettlementOutcome};
use tracing::{debug, warn};

use crate::ack::{AckCoordinator, FailureCoordinator};
use crate::error::Result;

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_TEXT: &str = "text/plain";
const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

static DECODE_FALLBACK_WARNING: Once = Once::new();

fn warn_decode_fallback() {
    DECODE_FALLBACK_WARNING.call_once(|| {
        warn!(
            "No usable content type, falling back to raw bytes. If that is intended, \
             set the content type to application/octet-stream"
        );
    });
}

/// Payload decoded once at envelope construction
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
}

impl Payload {
    fn decode(message: &InboundMessage) -> Self {
        let content_type = message.content_type.as_deref().unwrap_or("");
        let encoding_set = message
            .content_encoding
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());

        if encoding_set {
            // Encoded bodies are never unwrapped; only silence the warning
            // for explicitly binary content.
            if !content_type.eq_ignore_ascii_case(CONTENT_TYPE_OCTET_STREAM) {
                warn_decode_fallback();
            }
            return Payload::Bytes(message.payload.clone());
        }

        if content_type.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
            match serde_json::from_slice(&message.payload) {
                Ok(value) => return Payload::Json(value),
                Err(_) => warn_decode_fallback(),
            }
        } else if content_type.eq_ignore_ascii_case(CONTENT_TYPE_TEXT) {
            match std::str::from_utf8(&message.payload) {
                Ok(text) => return Payload::Text(text.to_string()),
                Err(_) => warn_decode_fallback(),
            }
        }
        Payload::Bytes(message.payload.clone())
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Explicit settlement outcome, attachable when nacking to override the
/// default reject-on-failure
#[derive(Debug, Clone, Copy)]
pub struct SettleMetadata {
    outcome: SettlementOutcome,
}

impl SettleMetadata {
    pub fn accepted() -> Self {
        Self {
            outcome: SettlementOutcome::Accepted,
        }
    }

    pub fn rejected() -> Self {
        Self {
            outcome: SettlementOutcome::Rejected,
        }
    }

    pub fn failed() -> Self {
        Self {
            outcome: SettlementOutcome::Failed,
        }
    }

    pub fn outcome(&self) -> SettlementOutcome {
        self.outcome
    }
}

/// Immutable view of the delivery's broker metadata
#[derive(Debug, Clone)]
pub struct InboundMetadata {
    pub delivery_id: u64,
    pub topic: String,
    pub content_type: Option<String>,
    pub properties: HashMap<String, String>,
    pub expiration: Option<i64>,
    pub priority: Option<u8>,
    pub sender_id: Option<String>,
    pub application_message_id: Option<String>,
    pub application_message_type: Option<String>,
    pub time_to_live: Option<i64>,
    pub class_of_service: Option<u8>,
    pub replication_group_message_id: Option<String>,
}

impl InboundMetadata {
    fn snapshot(message: &InboundMessage) -> Self {
        Self {
            delivery_id: message.delivery_id,
            topic: message.topic.clone(),
            content_type: message.content_type.clone(),
            properties: message.properties.clone(),
            expiration: message.expiration,
            priority: message.priority,
            sender_id: message.sender_id.clone(),
            application_message_id: message.application_message_id.clone(),
            application_message_type: message.application_message_type.clone(),
            time_to_live: message.time_to_live,
            class_of_service: message.class_of_service,
            replication_group_message_id: message.replication_group_message_id.clone(),
        }
    }
}

/// One broker-delivered message on its way to the application
pub struct Envelope {
    channel: String,
    message: Arc<InboundMessage>,
    payload: Payload,
    metadata: InboundMetadata,
    ack: AckCoordinator,
    fail: FailureCoordinator,
    settled: AtomicBool,
}

impl Envelope {
    pub(crate) fn new(
        channel: String,
        message: InboundMessage,
        ack: AckCoordinator,
        fail: FailureCoordinator,
    ) -> Self {
        let payload = Payload::decode(&message);
        let metadata = InboundMetadata::snapshot(&message);
        Self {
            channel,
            message: Arc::new(message),
            payload,
            metadata,
            ack,
            fail,
            settled: AtomicBool::new(false),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn metadata(&self) -> &InboundMetadata {
        &self.metadata
    }

    pub(crate) fn raw_message(&self) -> Arc<InboundMessage> {
        self.message.clone()
    }

    /// Positively acknowledge the message. Resolves the disposition at
    /// most once; later calls are no-ops.
    pub async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            self.log_duplicate();
            return Ok(());
        }
        self.ack.ack(self).await
    }

    /// Negatively acknowledge the message. The settlement outcome comes
    /// from `metadata` when given, Rejected otherwise.
    pub async fn nack(
        &self,
        reason: anyhow::Error,
        metadata: Option<SettleMetadata>,
    ) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            self.log_duplicate();
            return Ok(());
        }
        self.fail.fail(self, &reason, metadata.as_ref()).await
    }

    fn log_duplicate(&self) {
        debug!(
            channel = %self.channel,
            delivery_id = self.metadata.delivery_id,
            "Disposition already resolved, ignoring duplicate settlement"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with(content_type: Option<&str>, encoding: Option<&str>, body: &[u8]) -> InboundMessage {
        InboundMessage {
            delivery_id: 0,
            topic: "t".to_string(),
            payload: Bytes::copy_from_slice(body),
            content_type: content_type.map(String::from),
            content_encoding: encoding.map(String::from),
            properties: HashMap::new(),
            expiration: None,
            priority: None,
            sender_id: None,
            application_message_id: None,
            application_message_type: None,
            time_to_live: None,
            class_of_service: None,
            replication_group_message_id: None,
        }
    }

    #[test]
    fn json_content_type_decodes_to_structured_value() {
        let payload = Payload::decode(&message_with(Some("application/json"), None, br#"{"a":1}"#));
        assert_eq!(payload, Payload::Json(serde_json::json!({"a": 1})));
    }

    #[test]
    fn text_content_type_decodes_to_exact_string() {
        let payload = Payload::decode(&message_with(Some("text/plain"), None, b"hello there"));
        assert_eq!(payload, Payload::Text("hello there".to_string()));
    }

    #[test]
    fn unknown_content_type_stays_raw() {
        let payload = Payload::decode(&message_with(None, None, b"\x00\x01\x02"));
        assert_eq!(payload, Payload::Bytes(Bytes::from_static(b"\x00\x01\x02")));
    }

    #[test]
    fn invalid_json_degrades_to_raw_bytes() {
        let payload = Payload::decode(&message_with(Some("application/json"), None, b"{nope"));
        assert_eq!(payload, Payload::Bytes(Bytes::from_static(b"{nope")));
    }

    #[test]
    fn content_encoding_suppresses_sniffing() {
        let payload = Payload::decode(&message_with(
            Some("application/json"),
            Some("gzip"),
            br#"{"a":1}"#,
        ));
        assert!(matches!(payload, Payload::Bytes(_)));
    }
}
