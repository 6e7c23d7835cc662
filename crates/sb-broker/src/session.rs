use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::message::{InboundMessage, OutboundMessage, PublishReceipt, SettlementOutcome};
use crate::Result;

/// Durability and exclusivity of the queue a receiver binds to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSpec {
    DurableNonExclusive { name: String },
    DurableExclusive { name: String },
    NonDurableExclusive { name: Option<String> },
}

impl QueueSpec {
    pub fn name(&self) -> Option<&str> {
        match self {
            QueueSpec::DurableNonExclusive { name } | QueueSpec::DurableExclusive { name } => {
                Some(name)
            }
            QueueSpec::NonDurableExclusive { name } => name.as_deref(),
        }
    }

    pub fn is_durable(&self) -> bool {
        !matches!(self, QueueSpec::NonDurableExclusive { .. })
    }
}

/// What to do when the queue a receiver binds to does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingResourcesPolicy {
    CreateOnStart,
    DoNotCreate,
}

/// Where replay of previously delivered messages should begin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaySpec {
    AllMessages,
    TimeBased { start: DateTime<Utc> },
    ReplicationGroupMessageId { id: String },
}

/// Admission policy for outbound messages beyond available capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackPressure {
    /// Fail the publish call once `capacity` messages are outstanding
    Reject { capacity: usize },
    /// Block the publish call until capacity frees
    Wait { capacity: usize },
    /// Buffer without bound
    Elastic,
}

/// Everything needed to build a persistent receiver
#[derive(Debug, Clone)]
pub struct ReceiverSpec {
    pub queue: QueueSpec,
    pub subscriptions: Vec<String>,
    pub selector: Option<String>,
    pub replay: Option<ReplaySpec>,
    pub missing_resources: MissingResourcesPolicy,
}

/// Everything needed to build a persistent publisher
#[derive(Debug, Clone)]
pub struct PublisherSpec {
    pub back_pressure: BackPressure,
    pub ack_timeout: Option<Duration>,
    pub ack_window_size: Option<u32>,
}

/// Receiver lifecycle as reported by the broker client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Constructed,
    Activated,
    Passivated,
    ConnectionLost,
    Terminated,
}

/// Receiving side of the broker client.
///
/// `receive` blocks the calling thread and must only be driven from a
/// dedicated blocking context. `ack` and `settle` are only safe from the
/// context that owns the delivery, which the connector isolates behind a
/// settlement worker.
pub trait PersistentReceiver: Send + Sync {
    fn start(&self) -> Result<()>;

    /// Blocking receive; `Ok(None)` means the timeout elapsed with no message.
    fn receive(&self, timeout: Duration) -> Result<Option<InboundMessage>>;

    fn ack(&self, message: &InboundMessage) -> Result<()>;

    fn settle(&self, message: &InboundMessage, outcome: SettlementOutcome) -> Result<()>;

    /// Terminate the receiver, waiting up to `grace` for in-flight work.
    fn terminate(&self, grace: Duration) -> Result<()>;

    /// State-change notifications, current state always observable.
    fn state_changes(&self) -> watch::Receiver<ReceiverState>;
}

/// Publishing side of the broker client.
///
/// When a correlation token is supplied the broker reports the outcome as a
/// `PublishReceipt` carrying that token on the registered listener channel,
/// on an arbitrary context and in no particular order.
pub trait PersistentPublisher: Send + Sync {
    fn start(&self) -> Result<()>;

    fn publish(&self, message: OutboundMessage, topic: &str, token: Option<u64>) -> Result<()>;

    fn set_receipt_listener(&self, listener: mpsc::UnboundedSender<PublishReceipt>);

    /// Terminate the publisher, waiting up to `grace` for pending receipts.
    fn terminate(&self, grace: Duration) -> Result<()>;
}

/// A connected broker session able to build receivers and publishers
pub trait BrokerSession: Send + Sync {
    fn persistent_receiver(&self, spec: ReceiverSpec) -> Result<Arc<dyn PersistentReceiver>>;

    fn persistent_publisher(&self, spec: PublisherSpec) -> Result<Arc<dyn PersistentPublisher>>;
}
