//! In-memory broker for tests and local development
//!
//! Implements the session/receiver/publisher traits over process-local
//! queues: topic-subscription routing with a trailing `/*` wildcard,
//! property selectors, replay from a retained log, publish receipts
//! dispatched from a dedicated scheduler thread (optionally delayed so
//! tests can hold a receipt window open), and connection-loss injection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::BrokerError;
use crate::message::{InboundMessage, OutboundMessage, PublishReceipt, SettlementOutcome};
use crate::session::{
    BackPressure, BrokerSession, MissingResourcesPolicy, PersistentPublisher, PersistentReceiver,
    PublisherSpec, ReceiverSpec, ReceiverState, ReplaySpec,
};
use crate::Result;

/// Tuning knobs for the in-memory broker
#[derive(Debug, Clone)]
pub struct MemoryBrokerOptions {
    /// Delay between a publish and its receipt. A large delay keeps the
    /// outstanding-receipt window open, which the reject backpressure
    /// tests rely on.
    pub receipt_delay: Duration,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            receipt_delay: Duration::ZERO,
        }
    }
}

struct RetainedRecord {
    topic: String,
    message: OutboundMessage,
    published_at: DateTime<Utc>,
    replication_group_message_id: String,
}

/// Process-local broker. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MemoryBroker {
    core: Arc<BrokerCore>,
}

struct BrokerCore {
    options: MemoryBrokerOptions,
    receivers: RwLock<Vec<Arc<MemoryReceiver>>>,
    durable_queues: DashSet<String>,
    retained: Mutex<Vec<RetainedRecord>>,
    connected: AtomicBool,
    message_seq: AtomicU64,
    receipt_tx: std_mpsc::Sender<ScheduledReceipt>,
}

struct ScheduledReceipt {
    due: Instant,
    receipt: PublishReceipt,
    listener: mpsc::UnboundedSender<PublishReceipt>,
    outstanding: Arc<(Mutex<usize>, Condvar)>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_options(MemoryBrokerOptions::default())
    }

    pub fn with_options(options: MemoryBrokerOptions) -> Self {
        let (receipt_tx, receipt_rx) = std_mpsc::channel::<ScheduledReceipt>();

        // Scheduler thread dispatching receipts; exits once every publisher
        // and the broker handle are gone and the channel disconnects.
        std::thread::Builder::new()
            .name("memory-broker-receipts".to_string())
            .spawn(move || {
                while let Ok(scheduled) = receipt_rx.recv() {
                    let now = Instant::now();
                    if scheduled.due > now {
                        std::thread::sleep(scheduled.due - now);
                    }
                    let _ = scheduled.listener.send(scheduled.receipt);
                    let (lock, cv) = &*scheduled.outstanding;
                    let mut count = lock.lock();
                    *count = count.saturating_sub(1);
                    cv.notify_all();
                }
            })
            .expect("failed to spawn receipt scheduler thread");

        Self {
            core: Arc::new(BrokerCore {
                options,
                receivers: RwLock::new(Vec::new()),
                durable_queues: DashSet::new(),
                retained: Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
                message_seq: AtomicU64::new(0),
                receipt_tx,
            }),
        }
    }

    /// Pre-provision a durable queue, as an administrator would
    pub fn provision_queue(&self, name: &str) {
        self.core.durable_queues.insert(name.to_string());
    }

    /// Simulate losing the connection to the broker
    pub fn drop_connection(&self) {
        self.core.connected.store(false, Ordering::SeqCst);
        for receiver in self.core.receivers.read().iter() {
            receiver.on_connection_lost();
        }
    }

    /// Simulate the connection recovering
    pub fn restore_connection(&self) {
        self.core.connected.store(true, Ordering::SeqCst);
        for receiver in self.core.receivers.read().iter() {
            receiver.on_connection_restored();
        }
    }

    /// Receivers created so far, in creation order (test observation point)
    pub fn receivers(&self) -> Vec<Arc<MemoryReceiver>> {
        self.core.receivers.read().clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerCore {
    fn route(&self, topic: &str, message: &OutboundMessage) {
        for receiver in self.receivers.read().iter() {
            receiver.offer(topic, message);
        }
    }
}

fn topic_matches(pattern: &str, topic: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        topic == prefix || topic.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
    } else {
        pattern == topic
    }
}

/// Selector of the form `key = 'value'`, matched against user properties
fn selector_matches(selector: &str, message: &OutboundMessage) -> bool {
    let Some((key, value)) = selector.split_once('=') else {
        return true;
    };
    let key = key.trim();
    let value = value.trim().trim_matches('\'');
    message.properties.get(key).map(String::as_str) == Some(value)
}

impl BrokerSession for MemoryBroker {
    fn persistent_receiver(&self, spec: ReceiverSpec) -> Result<Arc<dyn PersistentReceiver>> {
        if spec.queue.is_durable() {
            let name = spec.queue.name().unwrap_or_default().to_string();
            match spec.missing_resources {
                MissingResourcesPolicy::CreateOnStart => {
                    self.core.durable_queues.insert(name);
                }
                MissingResourcesPolicy::DoNotCreate => {
                    if !self.core.durable_queues.contains(&name) {
                        return Err(BrokerError::MissingResource(name));
                    }
                }
            }
        }

        let receiver = Arc::new(MemoryReceiver::new(spec, Arc::downgrade(&self.core)));
        self.core.receivers.write().push(receiver.clone());
        Ok(receiver)
    }

    fn persistent_publisher(&self, spec: PublisherSpec) -> Result<Arc<dyn PersistentPublisher>> {
        Ok(Arc::new(MemoryPublisher {
            spec,
            core: self.core.clone(),
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            listener: Mutex::new(None),
            outstanding: Arc::new((Mutex::new(0), Condvar::new())),
        }))
    }
}

/// Receiver bound to one queue with a set of topic subscriptions
pub struct MemoryReceiver {
    spec: ReceiverSpec,
    // Weak because the core owns every receiver
    core: Weak<BrokerCore>,
    started: AtomicBool,
    terminated: AtomicBool,
    delivery_seq: AtomicU64,
    queue: Mutex<VecDeque<InboundMessage>>,
    available: Condvar,
    state_tx: watch::Sender<ReceiverState>,
    acked: Mutex<Vec<u64>>,
    settled: Mutex<Vec<(u64, SettlementOutcome)>>,
}

impl MemoryReceiver {
    fn new(spec: ReceiverSpec, core: Weak<BrokerCore>) -> Self {
        let (state_tx, _) = watch::channel(ReceiverState::Constructed);
        Self {
            spec,
            core,
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            delivery_seq: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            state_tx,
            acked: Mutex::new(Vec::new()),
            settled: Mutex::new(Vec::new()),
        }
    }

    fn offer(&self, topic: &str, message: &OutboundMessage) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }
        if !self.spec.subscriptions.iter().any(|s| topic_matches(s, topic)) {
            return;
        }
        if let Some(selector) = &self.spec.selector {
            if !selector_matches(selector, message) {
                return;
            }
        }
        self.enqueue(topic, message, None);
    }

    fn enqueue(&self, topic: &str, message: &OutboundMessage, rgmid: Option<String>) {
        let delivery_id = self.delivery_seq.fetch_add(1, Ordering::SeqCst);
        let inbound = InboundMessage {
            delivery_id,
            topic: topic.to_string(),
            payload: message.payload.clone(),
            content_type: message.content_type.clone(),
            content_encoding: message.content_encoding.clone(),
            properties: message.properties.clone(),
            expiration: message.expiration,
            priority: message.priority,
            sender_id: message.sender_id.clone(),
            application_message_id: message.application_message_id.clone(),
            application_message_type: message.application_message_type.clone(),
            time_to_live: message.time_to_live,
            class_of_service: message.class_of_service,
            replication_group_message_id: rgmid,
        };
        self.queue.lock().push_back(inbound);
        self.available.notify_one();
    }

    /// Re-enqueue retained records selected by the replay spec
    fn apply_replay(&self) -> Result<()> {
        let Some(replay) = self.spec.replay.clone() else {
            return Ok(());
        };
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        let retained = core.retained.lock();

        let start_index = match &replay {
            ReplaySpec::AllMessages => 0,
            ReplaySpec::TimeBased { start } => retained
                .iter()
                .position(|r| r.published_at >= *start)
                .unwrap_or(retained.len()),
            ReplaySpec::ReplicationGroupMessageId { id } => {
                retained
                    .iter()
                    .position(|r| r.replication_group_message_id == *id)
                    .ok_or_else(|| BrokerError::Replay(format!("unknown message id {id}")))?
                    + 1
            }
        };

        for record in retained.iter().skip(start_index) {
            if self.spec.subscriptions.iter().any(|s| topic_matches(s, &record.topic)) {
                self.enqueue(
                    &record.topic,
                    &record.message,
                    Some(record.replication_group_message_id.clone()),
                );
            }
        }
        Ok(())
    }

    fn on_connection_lost(&self) {
        let _ = self.state_tx.send(ReceiverState::ConnectionLost);
        self.available.notify_all();
    }

    fn on_connection_restored(&self) {
        if self.started.load(Ordering::SeqCst) && !self.terminated.load(Ordering::SeqCst) {
            let _ = self.state_tx.send(ReceiverState::Activated);
        }
        self.available.notify_all();
    }

    fn connected(&self) -> bool {
        self.core
            .upgrade()
            .map(|c| c.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Delivery ids acked so far, in ack order (test observation point)
    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().clone()
    }

    /// Settlements recorded so far, in settle order (test observation point)
    pub fn settlements(&self) -> Vec<(u64, SettlementOutcome)> {
        self.settled.lock().clone()
    }

    /// Messages currently queued, without consuming them
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl PersistentReceiver for MemoryReceiver {
    fn start(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(BrokerError::Terminated);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.apply_replay()?;
        let _ = self.state_tx.send(ReceiverState::Activated);
        self.available.notify_all();
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(BrokerError::Terminated);
            }
            if !self.connected() {
                return Err(BrokerError::NotConnected);
            }
            if self.started.load(Ordering::SeqCst) {
                if let Some(message) = queue.pop_front() {
                    return Ok(Some(message));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.available.wait_until(&mut queue, deadline);
        }
    }

    fn ack(&self, message: &InboundMessage) -> Result<()> {
        if !self.connected() {
            return Err(BrokerError::NotConnected);
        }
        self.acked.lock().push(message.delivery_id);
        Ok(())
    }

    fn settle(&self, message: &InboundMessage, outcome: SettlementOutcome) -> Result<()> {
        if !self.connected() {
            return Err(BrokerError::NotConnected);
        }
        self.settled.lock().push((message.delivery_id, outcome));
        Ok(())
    }

    fn terminate(&self, _grace: Duration) -> Result<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.state_tx.send(ReceiverState::Terminated);
        self.available.notify_all();
        debug!(queue = ?self.spec.queue.name(), "memory receiver terminated");
        Ok(())
    }

    fn state_changes(&self) -> watch::Receiver<ReceiverState> {
        self.state_tx.subscribe()
    }
}

/// Publisher enforcing the configured backpressure against the
/// outstanding-receipt window
pub struct MemoryPublisher {
    spec: PublisherSpec,
    core: Arc<BrokerCore>,
    started: AtomicBool,
    terminated: AtomicBool,
    listener: Mutex<Option<mpsc::UnboundedSender<PublishReceipt>>>,
    outstanding: Arc<(Mutex<usize>, Condvar)>,
}

const OUTSTANDING_WAIT_SLICE: Duration = Duration::from_millis(10);

impl MemoryPublisher {
    fn admit(&self) -> Result<()> {
        match self.spec.back_pressure {
            BackPressure::Elastic => Ok(()),
            BackPressure::Reject { capacity } => {
                let (lock, _) = &*self.outstanding;
                if *lock.lock() >= capacity {
                    Err(BrokerError::InsufficientResources)
                } else {
                    Ok(())
                }
            }
            BackPressure::Wait { capacity } => {
                let (lock, cv) = &*self.outstanding;
                let mut count = lock.lock();
                while *count >= capacity {
                    if self.terminated.load(Ordering::SeqCst) {
                        return Err(BrokerError::Terminated);
                    }
                    cv.wait_for(&mut count, OUTSTANDING_WAIT_SLICE);
                }
                Ok(())
            }
        }
    }
}

impl PersistentPublisher for MemoryPublisher {
    fn start(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(BrokerError::Terminated);
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn publish(&self, message: OutboundMessage, topic: &str, token: Option<u64>) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(BrokerError::Terminated);
        }
        if !self.core.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        self.admit()?;

        let message_id = self.core.message_seq.fetch_add(1, Ordering::SeqCst);
        let rgmid = format!("rmid-{message_id}");
        self.core.retained.lock().push(RetainedRecord {
            topic: topic.to_string(),
            message: message.clone(),
            published_at: Utc::now(),
            replication_group_message_id: rgmid,
        });
        self.core.route(topic, &message);

        if let Some(token) = token {
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                {
                    let (lock, _) = &*self.outstanding;
                    *lock.lock() += 1;
                }
                let scheduled = ScheduledReceipt {
                    due: Instant::now() + self.core.options.receipt_delay,
                    receipt: PublishReceipt {
                        token,
                        message_id: format!("mid-{message_id}"),
                        timestamp: Utc::now(),
                        error: None,
                    },
                    listener,
                    outstanding: self.outstanding.clone(),
                };
                self.core
                    .receipt_tx
                    .send(scheduled)
                    .map_err(|_| BrokerError::Terminated)?;
            }
        }
        Ok(())
    }

    fn set_receipt_listener(&self, listener: mpsc::UnboundedSender<PublishReceipt>) {
        *self.listener.lock() = Some(listener);
    }

    fn terminate(&self, grace: Duration) -> Result<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Wait up to the grace period for outstanding receipts to drain.
        let (lock, cv) = &*self.outstanding;
        let deadline = Instant::now() + grace;
        let mut count = lock.lock();
        while *count > 0 && Instant::now() < deadline {
            cv.wait_until(&mut count, deadline);
        }
        cv.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OutboundMessageBuilder;
    use crate::session::QueueSpec;

    fn receiver_spec(subscriptions: &[&str]) -> ReceiverSpec {
        ReceiverSpec {
            queue: QueueSpec::NonDurableExclusive { name: None },
            subscriptions: subscriptions.iter().map(|s| s.to_string()).collect(),
            selector: None,
            replay: None,
            missing_resources: MissingResourcesPolicy::CreateOnStart,
        }
    }

    fn elastic_spec() -> PublisherSpec {
        PublisherSpec {
            back_pressure: BackPressure::Elastic,
            ack_timeout: None,
            ack_window_size: None,
        }
    }

    #[test]
    fn topic_wildcard_matching() {
        assert!(topic_matches("orders/*", "orders/created"));
        assert!(topic_matches("orders/*", "orders/eu/created"));
        assert!(topic_matches("orders", "orders"));
        assert!(!topic_matches("orders/*", "invoices/created"));
        assert!(!topic_matches("orders", "orders/created"));
    }

    #[test]
    fn routes_publish_to_matching_subscriber() {
        let broker = MemoryBroker::new();
        let receiver = broker.persistent_receiver(receiver_spec(&["greetings"])).unwrap();
        receiver.start().unwrap();

        let publisher = broker.persistent_publisher(elastic_spec()).unwrap();
        publisher.start().unwrap();

        let msg = OutboundMessageBuilder::new().build("hello".as_bytes().to_vec());
        publisher.publish(msg, "greetings", None).unwrap();

        let received = receiver.receive(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&received.payload[..], b"hello");
        assert_eq!(received.topic, "greetings");
    }

    #[test]
    fn missing_durable_queue_fails_without_creation() {
        let broker = MemoryBroker::new();
        let spec = ReceiverSpec {
            queue: QueueSpec::DurableExclusive {
                name: "absent".to_string(),
            },
            subscriptions: vec!["t".to_string()],
            selector: None,
            replay: None,
            missing_resources: MissingResourcesPolicy::DoNotCreate,
        };
        let err = match broker.persistent_receiver(spec) {
            Ok(_) => panic!("receiver construction should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, BrokerError::MissingResource(name) if name == "absent"));
    }

    #[test]
    fn reject_backpressure_fails_when_window_full() {
        let broker = MemoryBroker::with_options(MemoryBrokerOptions {
            receipt_delay: Duration::from_secs(30),
        });
        let publisher = broker
            .persistent_publisher(PublisherSpec {
                back_pressure: BackPressure::Reject { capacity: 2 },
                ack_timeout: None,
                ack_window_size: None,
            })
            .unwrap();
        publisher.start().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        publisher.set_receipt_listener(tx);

        let build = || OutboundMessageBuilder::new().build("x".as_bytes().to_vec());
        publisher.publish(build(), "t", Some(1)).unwrap();
        publisher.publish(build(), "t", Some(2)).unwrap();
        let err = publisher.publish(build(), "t", Some(3)).unwrap_err();
        assert!(matches!(err, BrokerError::InsufficientResources));
    }

    #[test]
    fn selector_filters_on_properties() {
        let broker = MemoryBroker::new();
        let mut spec = receiver_spec(&["t"]);
        spec.selector = Some("region = 'emea'".to_string());
        let receiver = broker.persistent_receiver(spec).unwrap();
        receiver.start().unwrap();

        let publisher = broker.persistent_publisher(elastic_spec()).unwrap();
        let matching = OutboundMessageBuilder::new()
            .with_property("region", "emea")
            .build("yes".as_bytes().to_vec());
        let other = OutboundMessageBuilder::new()
            .with_property("region", "apac")
            .build("no".as_bytes().to_vec());
        publisher.publish(other, "t", None).unwrap();
        publisher.publish(matching, "t", None).unwrap();

        let received = receiver.receive(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&received.payload[..], b"yes");
    }

    #[test]
    fn replay_all_messages_redelivers_retained_log() {
        let broker = MemoryBroker::new();
        let publisher = broker.persistent_publisher(elastic_spec()).unwrap();
        for i in 0..3 {
            let msg = OutboundMessageBuilder::new().build(format!("m{i}").into_bytes());
            publisher.publish(msg, "t", None).unwrap();
        }

        let mut spec = receiver_spec(&["t"]);
        spec.replay = Some(ReplaySpec::AllMessages);
        let late = broker.persistent_receiver(spec).unwrap();
        late.start().unwrap();

        for i in 0..3 {
            let received = late.receive(Duration::from_secs(1)).unwrap().unwrap();
            assert_eq!(received.payload, bytes::Bytes::from(format!("m{i}")));
        }
    }
}
