//! Outgoing channel adapter
//!
//! Consumes the application's outbound sequence and delivers each item to
//! the broker through the bounded-concurrency sender, correlating publish
//! receipts back onto each originating message by an opaque per-publish
//! token. What upstream observes as completion is the ack/nack of its own
//! message, never the raw publish call.
//!
//! The default `elastic` strategy buffers without bound; a sustained
//! broker stall will grow that buffer indefinitely. Pick `wait` or
//! `reject` when that trade-off is unacceptable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sb_broker::{
    BrokerSession, OutboundMessage, OutboundMessageBuilder, PersistentPublisher, PublishReceipt,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{BackPressureStrategy, OutgoingChannelConfig};
use crate::error::{ConnectorError, Result};
use crate::outbound::{AppMessage, OutgoingPayload, PublishMetadata};
use crate::sender::{BoundedConcurrencySender, ReceiptWait, SendOperation, UpstreamSource};

const CONTENT_TYPE_JSON: &str = "application/json";

/// Grace period for draining in-flight publishes and terminating the
/// publisher on close
const CLOSE_GRACE: Duration = Duration::from_secs(5);

type PendingReceipt = oneshot::Sender<Result<PublishReceipt>>;

struct PublishCore {
    channel: String,
    topic: String,
    publisher: Arc<dyn PersistentPublisher>,
    /// Correlation token -> awaiting completion; each entry removed
    /// exactly once by the receipt pump
    pending: DashMap<u64, PendingReceipt>,
    token_seq: AtomicU64,
    started: AtomicBool,
}

impl PublishCore {
    fn ensure_started(&self) -> Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.publisher.start()?;
            info!(channel = %self.channel, "Outgoing channel activated");
        }
        Ok(())
    }

    /// Map an application payload onto a broker message. Metadata is
    /// applied field by field, each field only if present.
    fn build_outbound(&self, message: &AppMessage) -> Result<OutboundMessage> {
        // A pre-built broker message passes through unmodified.
        if let OutgoingPayload::Broker(outbound) = &message.payload {
            return Ok(outbound.clone());
        }

        let mut builder = OutboundMessageBuilder::new();
        if let Some(metadata) = &message.metadata {
            builder = apply_metadata(builder, metadata);
        }

        Ok(match &message.payload {
            OutgoingPayload::Broker(_) => unreachable!("handled above"),
            OutgoingPayload::Text(text) => builder.build(text.clone().into_bytes()),
            OutgoingPayload::Bytes(bytes) => builder.build(bytes.clone()),
            OutgoingPayload::Value(value) => {
                let body = serde_json::to_vec(value)
                    .map_err(|e| ConnectorError::Publish(format!("JSON encoding failed: {e}")))?;
                builder
                    .with_content_header(CONTENT_TYPE_JSON, "")
                    .build(body)
            }
        })
    }

    fn topic_for(&self, message: &AppMessage) -> String {
        message
            .metadata
            .as_ref()
            .and_then(|m| m.dynamic_topic.clone())
            .unwrap_or_else(|| self.topic.clone())
    }

    /// Resolve one receipt against its pending completion, exactly once
    fn resolve_receipt(&self, receipt: PublishReceipt) {
        match self.pending.remove(&receipt.token) {
            Some((_, completion)) => {
                let result = match &receipt.error {
                    Some(error) => Err(ConnectorError::Broker(error.clone())),
                    None => Ok(receipt),
                };
                let _ = completion.send(result);
            }
            None => warn!(
                channel = %self.channel,
                token = receipt.token,
                "Receipt without pending completion, dropping (duplicate or late)"
            ),
        }
    }
}

fn apply_metadata(
    mut builder: OutboundMessageBuilder,
    metadata: &PublishMetadata,
) -> OutboundMessageBuilder {
    if let Some(content_type) = &metadata.content_type {
        builder = builder.with_content_header(
            content_type,
            metadata.content_encoding.as_deref().unwrap_or(""),
        );
    }
    for (key, value) in &metadata.properties {
        builder = builder.with_property(key, value);
    }
    if let Some(expiration) = metadata.expiration {
        builder = builder.with_expiration(expiration);
    }
    if let Some(priority) = metadata.priority {
        builder = builder.with_priority(priority);
    }
    if let Some(sender_id) = &metadata.sender_id {
        builder = builder.with_sender_id(sender_id);
    }
    if let Some(message_type) = &metadata.application_message_type {
        builder = builder.with_application_message_type(message_type);
    }
    if let Some(ttl) = metadata.time_to_live {
        builder = builder.with_time_to_live(ttl);
    }
    if let Some(message_id) = &metadata.application_message_id {
        builder = builder.with_application_message_id(message_id);
    }
    if let Some(cos) = metadata.class_of_service {
        builder = builder.with_class_of_service(cos);
    }
    builder
}

struct PublishOp {
    core: Arc<PublishCore>,
}

#[async_trait]
impl SendOperation for PublishOp {
    async fn send(&self, message: &AppMessage, wait_for_receipt: bool) -> Result<ReceiptWait> {
        self.core.ensure_started()?;
        let outbound = self.core.build_outbound(message)?;
        let topic = self.core.topic_for(message);

        if wait_for_receipt {
            let token = self.core.token_seq.fetch_add(1, Ordering::SeqCst);
            let (completion_tx, completion_rx) = oneshot::channel();
            self.core.pending.insert(token, completion_tx);

            if let Err(e) = self.blocking_publish(outbound, topic.clone(), Some(token)).await {
                self.core.pending.remove(&token);
                return Err(e);
            }
            debug!(channel = %self.core.channel, topic = %topic, "Message published");

            Ok(Box::pin(async move {
                let receipt = completion_rx.await.map_err(|_| ConnectorError::Closed)??;
                Ok(Some(receipt))
            }))
        } else {
            // Fire and forget: no delivery confirmation is awaited.
            self.blocking_publish(outbound, topic.clone(), None).await?;
            debug!(channel = %self.core.channel, topic = %topic, "Message published");
            Ok(Box::pin(std::future::ready(Ok(None))))
        }
    }
}

impl PublishOp {
    /// The publish call may block under the `wait` strategy, so it runs
    /// on the blocking pool.
    async fn blocking_publish(
        &self,
        outbound: OutboundMessage,
        topic: String,
        token: Option<u64>,
    ) -> Result<()> {
        let publisher = self.core.publisher.clone();
        tokio::task::spawn_blocking(move || publisher.publish(outbound, &topic, token))
            .await
            .map_err(|_| ConnectorError::Closed)??;
        Ok(())
    }
}

/// Application-to-broker channel
pub struct OutgoingChannelAdapter {
    config: OutgoingChannelConfig,
    core: Arc<PublishCore>,
    sender: Arc<BoundedConcurrencySender>,
    sink: ChannelSink,
    closed: AtomicBool,
}

impl OutgoingChannelAdapter {
    /// Build the publisher, wire the bounded-concurrency sender, and
    /// unless lazy start is configured, activate immediately.
    /// Configuration problems fail here, before any traffic flows.
    pub fn new(config: OutgoingChannelConfig, session: &dyn BrokerSession) -> Result<Self> {
        config.validate()?;
        let spec = config.publisher_spec()?;
        let publisher = session.persistent_publisher(spec)?;

        let (receipt_tx, mut receipt_rx) = mpsc::unbounded_channel();
        publisher.set_receipt_listener(receipt_tx);

        let core = Arc::new(PublishCore {
            channel: config.channel.clone(),
            topic: config.resolved_topic(),
            publisher,
            pending: DashMap::new(),
            token_seq: AtomicU64::new(0),
            started: AtomicBool::new(false),
        });

        // Receipt pump: receipts arrive on an arbitrary context and are
        // handed back into the pipeline here.
        let pump_core = core.clone();
        tokio::spawn(async move {
            while let Some(receipt) = receipt_rx.recv().await {
                pump_core.resolve_receipt(receipt);
            }
        });

        let sender = Arc::new(BoundedConcurrencySender::new(
            config.channel.clone(),
            config.max_inflight_messages,
            config.wait_for_publish_receipt,
            Arc::new(PublishOp { core: core.clone() }),
        ));

        let (sink, upstream) = ChannelSink::new(
            config.back_pressure_strategy,
            config.back_pressure_buffer_capacity,
        );
        sender.start(upstream);

        if !config.lazy_start {
            core.ensure_started()?;
        }

        Ok(Self {
            config,
            core,
            sender,
            sink,
            closed: AtomicBool::new(false),
        })
    }

    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    /// The consumer end exposed to the application
    pub fn sink(&self) -> ChannelSink {
        self.sink.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.sender.in_flight()
    }

    pub fn is_started(&self) -> bool {
        self.core.started.load(Ordering::SeqCst)
            || (self.config.lazy_start && !self.closed.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.is_started() && !self.closed.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Idempotent close: stop admission, drain in-flight publishes within
    /// the grace period, then terminate the publisher, also bounded.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(channel = %self.config.channel, "Closing outgoing channel");

        self.sender.cancel();
        if !self.sender.drain(CLOSE_GRACE).await {
            warn!(
                channel = %self.config.channel,
                in_flight = self.sender.in_flight(),
                "Grace period expired, abandoning unresolved in-flight publishes"
            );
        }

        let publisher = self.core.publisher.clone();
        let terminate = tokio::task::spawn_blocking(move || publisher.terminate(CLOSE_GRACE));
        match tokio::time::timeout(CLOSE_GRACE + Duration::from_millis(500), terminate).await {
            Ok(Ok(Ok(()))) => debug!(channel = %self.config.channel, "Publisher terminated"),
            Ok(Ok(Err(e))) => {
                warn!(channel = %self.config.channel, error = %e, "Publisher termination failed")
            }
            Ok(Err(_)) | Err(_) => warn!(
                channel = %self.config.channel,
                "Publisher termination exceeded grace period"
            ),
        }
    }
}

enum SinkInner {
    Bounded(mpsc::Sender<AppMessage>),
    Unbounded(mpsc::UnboundedSender<AppMessage>),
}

impl Clone for SinkInner {
    fn clone(&self) -> Self {
        match self {
            SinkInner::Bounded(tx) => SinkInner::Bounded(tx.clone()),
            SinkInner::Unbounded(tx) => SinkInner::Unbounded(tx.clone()),
        }
    }
}

/// Admission point for application messages, applying the configured
/// backpressure strategy
#[derive(Clone)]
pub struct ChannelSink {
    inner: SinkInner,
    strategy: BackPressureStrategy,
}

impl ChannelSink {
    fn new(strategy: BackPressureStrategy, capacity: usize) -> (Self, UpstreamSource) {
        match strategy {
            BackPressureStrategy::Elastic => {
                let (tx, rx) = mpsc::unbounded_channel();
                (
                    Self {
                        inner: SinkInner::Unbounded(tx),
                        strategy,
                    },
                    rx.into(),
                )
            }
            BackPressureStrategy::Reject | BackPressureStrategy::Wait => {
                let (tx, rx) = mpsc::channel(capacity);
                (
                    Self {
                        inner: SinkInner::Bounded(tx),
                        strategy,
                    },
                    rx.into(),
                )
            }
        }
    }

    /// Submit one message. `elastic` buffers without bound, `wait` blocks
    /// until capacity frees, `reject` fails immediately once the buffer
    /// is full.
    pub async fn submit(&self, message: AppMessage) -> Result<()> {
        match (&self.inner, self.strategy) {
            (SinkInner::Unbounded(tx), _) => {
                tx.send(message).map_err(|_| ConnectorError::Closed)
            }
            (SinkInner::Bounded(tx), BackPressureStrategy::Reject) => {
                tx.try_send(message).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => ConnectorError::CapacityExceeded,
                    mpsc::error::TrySendError::Closed(_) => ConnectorError::Closed,
                })
            }
            (SinkInner::Bounded(tx), _) => {
                tx.send(message).await.map_err(|_| ConnectorError::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackPressureStrategy;
    use crate::outbound::Disposition;
    use sb_broker::{
        MemoryBroker, MemoryBrokerOptions, MissingResourcesPolicy, PersistentReceiver,
        QueueSpec, ReceiverSpec,
    };
    use serde_json::json;

    fn subscriber(broker: &MemoryBroker, topic: &str) -> Arc<dyn PersistentReceiver> {
        let receiver = broker
            .persistent_receiver(ReceiverSpec {
                queue: QueueSpec::NonDurableExclusive { name: None },
                subscriptions: vec![topic.to_string()],
                selector: None,
                replay: None,
                missing_resources: MissingResourcesPolicy::CreateOnStart,
            })
            .unwrap();
        receiver.start().unwrap();
        receiver
    }

    #[tokio::test]
    async fn text_publish_resolves_with_receipt() {
        let broker = MemoryBroker::new();
        let receiver = subscriber(&broker, "out");
        let adapter =
            OutgoingChannelAdapter::new(OutgoingChannelConfig::new("out"), &broker).unwrap();

        let (message, disposition) = AppMessage::new(OutgoingPayload::Text("hello".into()));
        adapter.sink().submit(message).await.unwrap();

        match disposition.await.unwrap() {
            Disposition::Acked(Some(receipt)) => assert!(receipt.error.is_none()),
            other => panic!("expected acked with receipt, got {other:?}"),
        }
        let delivered = receiver.receive(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&delivered.payload[..], b"hello");
    }

    #[tokio::test]
    async fn value_payload_carries_json_content_type() {
        let broker = MemoryBroker::new();
        let receiver = subscriber(&broker, "out");
        let adapter =
            OutgoingChannelAdapter::new(OutgoingChannelConfig::new("out"), &broker).unwrap();

        let (message, disposition) =
            AppMessage::new(OutgoingPayload::Value(json!({"count": 3})));
        adapter.sink().submit(message).await.unwrap();
        assert!(disposition.await.unwrap().is_acked());

        let delivered = receiver.receive(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(delivered.content_type.as_deref(), Some("application/json"));
        let value: serde_json::Value = serde_json::from_slice(&delivered.payload).unwrap();
        assert_eq!(value, json!({"count": 3}));
    }

    #[tokio::test]
    async fn metadata_is_copied_onto_the_outbound_message() {
        let broker = MemoryBroker::new();
        let receiver = subscriber(&broker, "out");
        let adapter =
            OutgoingChannelAdapter::new(OutgoingChannelConfig::new("out"), &broker).unwrap();

        let mut metadata = PublishMetadata::default();
        metadata.content_type = Some("text/plain".into());
        metadata.priority = Some(5);
        metadata.properties.insert("region".into(), "emea".into());

        let (message, disposition) = AppMessage::new(OutgoingPayload::Text("tagged".into()));
        let message = message.with_metadata(metadata);
        adapter.sink().submit(message).await.unwrap();
        assert!(disposition.await.unwrap().is_acked());

        let delivered = receiver.receive(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(delivered.content_type.as_deref(), Some("text/plain"));
        assert_eq!(delivered.priority, Some(5));
        assert_eq!(delivered.properties.get("region").map(String::as_str), Some("emea"));
    }

    #[tokio::test]
    async fn dynamic_topic_overrides_the_configured_topic() {
        let broker = MemoryBroker::new();
        let configured = subscriber(&broker, "out");
        let dynamic = subscriber(&broker, "elsewhere");
        let adapter =
            OutgoingChannelAdapter::new(OutgoingChannelConfig::new("out"), &broker).unwrap();

        let mut metadata = PublishMetadata::default();
        metadata.dynamic_topic = Some("elsewhere".into());
        let (message, disposition) = AppMessage::new(OutgoingPayload::Text("routed".into()));
        adapter.sink().submit(message.with_metadata(metadata)).await.unwrap();
        assert!(disposition.await.unwrap().is_acked());

        assert!(configured.receive(Duration::from_millis(50)).unwrap().is_none());
        let delivered = dynamic.receive(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&delivered.payload[..], b"routed");
    }

    #[tokio::test]
    async fn fire_and_forget_acks_without_receipt() {
        let broker = MemoryBroker::new();
        let mut config = OutgoingChannelConfig::new("out");
        config.wait_for_publish_receipt = false;
        let adapter = OutgoingChannelAdapter::new(config, &broker).unwrap();

        let (message, disposition) = AppMessage::new(OutgoingPayload::Text("fast".into()));
        adapter.sink().submit(message).await.unwrap();
        assert!(matches!(disposition.await.unwrap(), Disposition::Acked(None)));
    }

    #[tokio::test]
    async fn publish_failure_nacks_the_message() {
        let broker = MemoryBroker::new();
        let adapter =
            OutgoingChannelAdapter::new(OutgoingChannelConfig::new("out"), &broker).unwrap();
        broker.drop_connection();

        let (message, disposition) = AppMessage::new(OutgoingPayload::Text("doomed".into()));
        adapter.sink().submit(message).await.unwrap();
        assert!(matches!(
            disposition.await.unwrap(),
            Disposition::Nacked(ConnectorError::Broker(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reject_strategy_fails_once_buffer_is_full() {
        // A long receipt delay keeps the single in-flight slot occupied
        // while the bounded buffer fills behind it.
        let broker = MemoryBroker::with_options(MemoryBrokerOptions {
            receipt_delay: Duration::from_secs(30),
        });
        let mut config = OutgoingChannelConfig::new("out");
        config.back_pressure_strategy = BackPressureStrategy::Reject;
        config.back_pressure_buffer_capacity = 2;
        config.max_inflight_messages = 1;
        let adapter = OutgoingChannelAdapter::new(config, &broker).unwrap();
        let sink = adapter.sink();

        let submit = |text: &str| {
            let (message, disposition) =
                AppMessage::new(OutgoingPayload::Text(text.to_string()));
            (message, disposition)
        };

        let (first, _first_rx) = submit("m1");
        sink.submit(first).await.unwrap();
        // Give the pump time to pull m1 out of the buffer and admit it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(adapter.in_flight(), 1);

        let (second, _second_rx) = submit("m2");
        sink.submit(second).await.unwrap();
        let (third, _third_rx) = submit("m3");
        sink.submit(third).await.unwrap();

        let (overflow, _overflow_rx) = submit("m4");
        assert!(matches!(
            sink.submit(overflow).await,
            Err(ConnectorError::CapacityExceeded)
        ));
    }

    #[tokio::test]
    async fn lazy_channel_activates_on_first_message() {
        let broker = MemoryBroker::new();
        let mut config = OutgoingChannelConfig::new("out");
        config.lazy_start = true;
        let adapter = OutgoingChannelAdapter::new(config, &broker).unwrap();

        assert!(!adapter.core.started.load(Ordering::SeqCst));
        assert!(adapter.is_started());

        let (message, disposition) = AppMessage::new(OutgoingPayload::Text("wake".into()));
        adapter.sink().submit(message).await.unwrap();
        assert!(disposition.await.unwrap().is_acked());
        assert!(adapter.core.started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = MemoryBroker::new();
        let adapter =
            OutgoingChannelAdapter::new(OutgoingChannelConfig::new("out"), &broker).unwrap();
        adapter.close().await;
        adapter.close().await;
        assert!(!adapter.is_alive());
        assert!(!adapter.is_ready());
    }
}
