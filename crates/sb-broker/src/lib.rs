//! Broker client abstraction for StreamBridge
//!
//! Models the surface of a persistent-messaging broker SDK:
//! - Blocking `receive` with client acknowledgement and settlement outcomes
//! - Asynchronous publish with per-call receipt correlation tokens
//! - Receiver state-change notifications for health reporting
//! - An in-memory broker used by tests and local development
//!
//! The traits here are the seam between the connector and a real broker
//! client; the in-memory implementation is not a wire protocol.

mod error;
mod memory;
mod message;
mod session;

pub use error::BrokerError;
pub use memory::{MemoryBroker, MemoryBrokerOptions};
pub use message::{
    InboundMessage, OutboundMessage, OutboundMessageBuilder, PublishReceipt, SettlementOutcome,
};
pub use session::{
    BackPressure, BrokerSession, MissingResourcesPolicy, PersistentPublisher, PersistentReceiver,
    PublisherSpec, QueueSpec, ReceiverSpec, ReceiverState, ReplaySpec,
};

pub type Result<T> = std::result::Result<T, BrokerError>;
