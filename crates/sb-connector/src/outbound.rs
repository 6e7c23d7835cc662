//! Outbound message contract between the application and a channel
//!
//! Mirrors the inbound envelope in reverse: the application hands over a
//! payload plus optional publish metadata, and observes the disposition
//! (ack with the broker receipt, or nack with the cause) through a
//! one-shot completion.

use std::collections::HashMap;

use bytes::Bytes;
use sb_broker::{OutboundMessage, PublishReceipt};
use tokio::sync::oneshot;

use crate::error::ConnectorError;

/// Payload accepted by an outgoing channel
#[derive(Debug, Clone)]
pub enum OutgoingPayload {
    /// A pre-built broker message passes through unmodified
    Broker(OutboundMessage),
    Text(String),
    Bytes(Bytes),
    /// Any structured value; serialized to JSON with a JSON content header
    Value(serde_json::Value),
}

/// Per-message publish metadata, copied field by field onto the outbound
/// builder, each field only if present
#[derive(Debug, Clone, Default)]
pub struct PublishMetadata {
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
    /// Override the channel topic for this message only
    pub dynamic_topic: Option<String>,
}

/// How an application message was resolved
#[derive(Debug)]
pub enum Disposition {
    /// Published; carries the broker receipt when one was awaited
    Acked(Option<PublishReceipt>),
    Nacked(ConnectorError),
}

impl Disposition {
    pub fn is_acked(&self) -> bool {
        matches!(self, Disposition::Acked(_))
    }
}

/// One application message submitted to an outgoing channel
#[derive(Debug)]
pub struct AppMessage {
    pub payload: OutgoingPayload,
    pub metadata: Option<PublishMetadata>,
    disposition_tx: Option<oneshot::Sender<Disposition>>,
}

impl AppMessage {
    /// Create a message and the completion on which its disposition
    /// will be observed
    pub fn new(payload: OutgoingPayload) -> (Self, oneshot::Receiver<Disposition>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                payload,
                metadata: None,
                disposition_tx: Some(tx),
            },
            rx,
        )
    }

    pub fn with_metadata(mut self, metadata: PublishMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Resolve the disposition. Consumes the completion; a dropped
    /// receiver is the application declining to observe it.
    pub(crate) fn resolve(mut self, disposition: Disposition) {
        if let Some(tx) = self.disposition_tx.take() {
            let _ = tx.send(disposition);
        }
    }
}
