//! Acknowledgement and failure coordination
//!
//! Broker ack/settle calls are only safe from the context owning the
//! delivery. Each incoming adapter therefore runs one settlement worker on
//! a dedicated blocking context, and every envelope carries a handle to
//! it; `ack`/`fail` marshal the broker call onto that worker and await the
//! outcome. The worker is never the poll loop's thread, so settling can
//! make progress while a receive call is blocked.

use std::sync::Arc;

use sb_broker::{InboundMessage, PersistentReceiver, SettlementOutcome};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::envelope::{Envelope, SettleMetadata};
use crate::error::{ConnectorError, Result};

enum SettlementOp {
    Ack,
    Settle(SettlementOutcome),
}

struct SettlementJob {
    message: Arc<InboundMessage>,
    op: SettlementOp,
    done: oneshot::Sender<Result<()>>,
}

/// Capability to run broker settlement calls on the delivery's origin
/// context. Cloned into every envelope of the owning channel.
#[derive(Clone)]
pub(crate) struct SettlementHandle {
    tx: mpsc::UnboundedSender<SettlementJob>,
}

impl SettlementHandle {
    /// Spawn the settlement worker for a receiver
    pub(crate) fn spawn(receiver: Arc<dyn PersistentReceiver>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SettlementJob>();
        tokio::task::spawn_blocking(move || {
            while let Some(job) = rx.blocking_recv() {
                let result = match job.op {
                    SettlementOp::Ack => receiver.ack(&job.message),
                    SettlementOp::Settle(outcome) => receiver.settle(&job.message, outcome),
                };
                let _ = job.done.send(result.map_err(ConnectorError::from));
            }
        });
        Self { tx }
    }

    async fn run(&self, message: Arc<InboundMessage>, op: SettlementOp) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.tx
            .send(SettlementJob { message, op, done })
            .map_err(|_| ConnectorError::Closed)?;
        done_rx.await.map_err(|_| ConnectorError::Closed)?
    }
}

/// Positive acknowledgement path for one incoming channel
#[derive(Clone)]
pub struct AckCoordinator {
    handle: SettlementHandle,
}

impl AckCoordinator {
    pub(crate) fn new(handle: SettlementHandle) -> Self {
        Self { handle }
    }

    /// Acknowledge the envelope's message on its origin context.
    /// Broker-call failures propagate to the caller.
    pub async fn ack(&self, envelope: &Envelope) -> Result<()> {
        self.handle
            .run(envelope.raw_message(), SettlementOp::Ack)
            .await
    }
}

/// Negative acknowledgement path for one incoming channel
#[derive(Clone)]
pub struct FailureCoordinator {
    channel: String,
    handle: SettlementHandle,
}

impl FailureCoordinator {
    pub(crate) fn new(channel: String, handle: SettlementHandle) -> Self {
        Self { channel, handle }
    }

    /// Settle the envelope's message negatively. The outcome comes from
    /// explicit [`SettleMetadata`] when present, Rejected otherwise.
    pub async fn fail(
        &self,
        envelope: &Envelope,
        reason: &anyhow::Error,
        metadata: Option<&SettleMetadata>,
    ) -> Result<()> {
        let outcome = metadata
            .map(SettleMetadata::outcome)
            .unwrap_or(SettlementOutcome::Rejected);
        error!(
            channel = %self.channel,
            outcome = outcome.as_str(),
            reason = %reason,
            "Message nacked"
        );
        self.handle
            .run(envelope.raw_message(), SettlementOp::Settle(outcome))
            .await
    }
}
