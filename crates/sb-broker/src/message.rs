use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Broker-level disposition attached when settling a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettlementOutcome {
    Accepted,
    Rejected,
    Failed,
}

impl SettlementOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementOutcome::Accepted => "accepted",
            SettlementOutcome::Rejected => "rejected",
            SettlementOutcome::Failed => "failed",
        }
    }
}

/// One message delivered by the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Broker-assigned delivery id, unique per receiver
    pub delivery_id: u64,
    pub topic: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
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

/// One message handed to the broker for publishing
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub properties: HashMap<String, String>,
    pub expiration: Option<i64>,
    pub priority: Option<u8>,
    pub sender_id: Option<String>,
    pub application_message_id: Option<String>,
    pub application_message_type: Option<String>,
    pub time_to_live: Option<i64>,
    pub class_of_service: Option<u8>,
}

/// Builder for outbound messages, metadata applied field by field
#[derive(Debug, Clone, Default)]
pub struct OutboundMessageBuilder {
    msg: OutboundMessage,
}

impl OutboundMessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_header(mut self, content_type: &str, content_encoding: &str) -> Self {
        self.msg.content_type = Some(content_type.to_string());
        if !content_encoding.is_empty() {
            self.msg.content_encoding = Some(content_encoding.to_string());
        }
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.msg.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_expiration(mut self, expiration: i64) -> Self {
        self.msg.expiration = Some(expiration);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.msg.priority = Some(priority);
        self
    }

    pub fn with_sender_id(mut self, sender_id: &str) -> Self {
        self.msg.sender_id = Some(sender_id.to_string());
        self
    }

    pub fn with_application_message_id(mut self, id: &str) -> Self {
        self.msg.application_message_id = Some(id.to_string());
        self
    }

    pub fn with_application_message_type(mut self, message_type: &str) -> Self {
        self.msg.application_message_type = Some(message_type.to_string());
        self
    }

    pub fn with_time_to_live(mut self, ttl: i64) -> Self {
        self.msg.time_to_live = Some(ttl);
        self
    }

    pub fn with_class_of_service(mut self, cos: u8) -> Self {
        self.msg.class_of_service = Some(cos);
        self
    }

    pub fn build(mut self, payload: impl Into<Bytes>) -> OutboundMessage {
        self.msg.payload = payload.into();
        self.msg
    }
}

/// Broker confirmation that a published message was durably accepted
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    /// Correlation token handed to `publish`, echoed back unchanged
    pub token: u64,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    /// Set when the broker refused the message; the publish failed
    pub error: Option<BrokerError>,
}
