//! StreamBridge connector
//!
//! Bridges an application's message channels to a persistent broker:
//! - Incoming channels turn broker deliveries into a stream of
//!   acknowledgeable envelopes, with payload type detection and
//!   settlement routed back to the originating receiver
//! - Outgoing channels consume application messages and publish them
//!   under a bounded in-flight window, resolving each message against
//!   its own broker receipt
//! - A registry aggregates per-channel health for liveness and
//!   readiness probes
//!
//! The default outgoing backpressure strategy is `elastic`, which
//! buffers submitted messages without bound; configure `wait` or
//! `reject` where that memory trade-off is unacceptable.

mod ack;
pub mod config;
mod envelope;
mod error;
mod incoming;
mod outbound;
mod outgoing;
mod registry;
mod sender;

pub use envelope::{Envelope, InboundMetadata, Payload, SettleMetadata};
pub use error::{ConnectorError, Result};
pub use incoming::{EnvelopeStream, IncomingChannelAdapter};
pub use outbound::{AppMessage, Disposition, OutgoingPayload, PublishMetadata};
pub use outgoing::{ChannelSink, OutgoingChannelAdapter};
pub use registry::ChannelRegistry;
pub use sender::{BoundedConcurrencySender, ReceiptWait, SendOperation, UpstreamSource};

pub use config::{IncomingChannelConfig, OutgoingChannelConfig};
