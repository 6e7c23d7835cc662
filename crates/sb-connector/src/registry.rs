//! Channel registry
//!
//! Tracks every channel the connector has opened and aggregates their
//! health. A probe over the registry answers for the connector as a
//! whole: all channels must report positively, and a registry with no
//! channels is healthy by definition.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::incoming::IncomingChannelAdapter;
use crate::outgoing::OutgoingChannelAdapter;

#[derive(Default)]
pub struct ChannelRegistry {
    incoming: Mutex<Vec<Arc<IncomingChannelAdapter>>>,
    outgoing: Mutex<Vec<Arc<OutgoingChannelAdapter>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_incoming(&self, adapter: Arc<IncomingChannelAdapter>) {
        info!(channel = %adapter.channel(), "Registered incoming channel");
        self.incoming.lock().push(adapter);
    }

    pub fn register_outgoing(&self, adapter: Arc<OutgoingChannelAdapter>) {
        info!(channel = %adapter.channel(), "Registered outgoing channel");
        self.outgoing.lock().push(adapter);
    }

    pub fn incoming(&self, channel: &str) -> Option<Arc<IncomingChannelAdapter>> {
        self.incoming
            .lock()
            .iter()
            .find(|a| a.channel() == channel)
            .cloned()
    }

    pub fn outgoing(&self, channel: &str) -> Option<Arc<OutgoingChannelAdapter>> {
        self.outgoing
            .lock()
            .iter()
            .find(|a| a.channel() == channel)
            .cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.incoming.lock().len() + self.outgoing.lock().len()
    }

    /// All channels started
    pub fn is_started(&self) -> bool {
        self.incoming.lock().iter().all(|a| a.is_started())
            && self.outgoing.lock().iter().all(|a| a.is_started())
    }

    /// All channels ready to move traffic
    pub fn is_ready(&self) -> bool {
        self.incoming.lock().iter().all(|a| a.is_ready())
            && self.outgoing.lock().iter().all(|a| a.is_ready())
    }

    /// No channel has observed an unrecovered connection loss or an
    /// unexpected termination
    pub fn is_alive(&self) -> bool {
        self.incoming.lock().iter().all(|a| a.is_alive())
            && self.outgoing.lock().iter().all(|a| a.is_alive())
    }

    /// Close every registered channel. Each close is idempotent and
    /// bounded by its own grace period.
    pub async fn close_all(&self) {
        let incoming: Vec<_> = self.incoming.lock().clone();
        let outgoing: Vec<_> = self.outgoing.lock().clone();
        if !incoming.is_empty() || !outgoing.is_empty() {
            info!(
                incoming = incoming.len(),
                outgoing = outgoing.len(),
                "Closing all channels"
            );
        }
        for adapter in incoming {
            adapter.close().await;
        }
        for adapter in outgoing {
            adapter.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IncomingChannelConfig, OutgoingChannelConfig};
    use sb_broker::MemoryBroker;

    #[tokio::test]
    async fn empty_registry_is_healthy() {
        let registry = ChannelRegistry::new();
        assert!(registry.is_started());
        assert!(registry.is_ready());
        assert!(registry.is_alive());
    }

    #[tokio::test]
    async fn aggregates_health_across_channels() {
        let broker = MemoryBroker::new();
        let registry = ChannelRegistry::new();
        registry.register_incoming(Arc::new(
            IncomingChannelAdapter::new(IncomingChannelConfig::new("in"), &broker).unwrap(),
        ));
        registry.register_outgoing(Arc::new(
            OutgoingChannelAdapter::new(OutgoingChannelConfig::new("out"), &broker).unwrap(),
        ));
        assert_eq!(registry.channel_count(), 2);
        assert!(registry.is_ready());

        broker.drop_connection();
        assert!(!registry.is_alive());
        assert!(!registry.is_ready());

        broker.restore_connection();
        assert!(registry.is_alive());
    }

    #[tokio::test]
    async fn close_all_closes_every_channel() {
        let broker = MemoryBroker::new();
        let registry = ChannelRegistry::new();
        registry.register_incoming(Arc::new(
            IncomingChannelAdapter::new(IncomingChannelConfig::new("in"), &broker).unwrap(),
        ));
        registry.register_outgoing(Arc::new(
            OutgoingChannelAdapter::new(OutgoingChannelConfig::new("out"), &broker).unwrap(),
        ));

        registry.close_all().await;
        assert!(!registry.is_ready());
        assert!(registry.incoming("in").is_some());
        assert!(registry.outgoing("missing").is_none());
    }
}
