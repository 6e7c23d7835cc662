//! Incoming channel adapter
//!
//! Presents broker deliveries as a cancellable stream of envelopes. One
//! dedicated blocking context drives the receive loop; settlement runs on
//! its own worker so an in-progress receive can never deadlock an ack.
//! Lazy start defers receiver activation to the first downstream poll.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use sb_broker::{BrokerError, BrokerSession, PersistentReceiver, ReceiverState};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::ack::{AckCoordinator, FailureCoordinator, SettlementHandle};
use crate::config::IncomingChannelConfig;
use crate::envelope::Envelope;
use crate::error::Result;

/// How long one blocking receive call may wait before re-checking the
/// closed flag. Bounds close latency to one receive attempt.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Backoff while the connection is down; health reports not-alive.
const DISCONNECTED_BACKOFF: Duration = Duration::from_millis(200);

/// Grace period for receiver termination on close
const CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Envelopes buffered between the poll loop and the consumer
const DELIVERY_BUFFER: usize = 128;

struct IncomingShared {
    channel: String,
    receiver: Arc<dyn PersistentReceiver>,
    ack: AckCoordinator,
    fail: FailureCoordinator,
    closed: AtomicBool,
    activated: AtomicBool,
    // Taken by the first activation to spawn the poll loop
    delivery_tx: Mutex<Option<mpsc::Sender<Envelope>>>,
}

impl IncomingShared {
    /// Start the receiver and spawn the poll loop, exactly once
    fn activate(self: &Arc<Self>) -> Result<()> {
        if self.activated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.receiver.start()?;
        let Some(tx) = self.delivery_tx.lock().take() else {
            return Ok(());
        };
        let shared = self.clone();
        tokio::task::spawn_blocking(move || shared.run_poll_loop(tx));
        info!(channel = %self.channel, "Incoming channel activated");
        Ok(())
    }

    fn run_poll_loop(self: Arc<Self>, tx: mpsc::Sender<Envelope>) {
        while !self.closed.load(Ordering::SeqCst) {
            match self.receiver.receive(POLL_TIMEOUT) {
                Ok(Some(message)) => {
                    let envelope = Envelope::new(
                        self.channel.clone(),
                        message,
                        self.ack.clone(),
                        self.fail.clone(),
                    );
                    // blocking_send applies downstream backpressure to the
                    // poller; a closed channel means the consumer is gone.
                    if tx.blocking_send(envelope).is_err() {
                        debug!(channel = %self.channel, "Envelope stream dropped, stopping poll loop");
                        break;
                    }
                }
                // An idle timeout is the chance to notice the consumer
                // went away without a close() call.
                Ok(None) => {
                    if tx.is_closed() {
                        debug!(channel = %self.channel, "Envelope stream dropped, stopping poll loop");
                        break;
                    }
                }
                Err(BrokerError::Terminated) => break,
                Err(BrokerError::NotConnected) => {
                    std::thread::sleep(DISCONNECTED_BACKOFF);
                }
                Err(e) => {
                    error!(channel = %self.channel, error = %e, "Receive failed");
                    std::thread::sleep(DISCONNECTED_BACKOFF);
                }
            }
        }
        debug!(channel = %self.channel, "Poll loop exited");
    }
}

/// Broker-to-application channel
pub struct IncomingChannelAdapter {
    config: IncomingChannelConfig,
    shared: Arc<IncomingShared>,
    state_rx: watch::Receiver<ReceiverState>,
    // Handed out once via `stream()`
    delivery_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
}

impl IncomingChannelAdapter {
    /// Build the receiver and, unless lazy start is configured, activate
    /// it immediately. Configuration problems fail here, before any
    /// traffic flows.
    pub fn new(config: IncomingChannelConfig, session: &dyn BrokerSession) -> Result<Self> {
        config.validate()?;
        let spec = config.receiver_spec()?;
        let receiver = session.persistent_receiver(spec)?;
        let state_rx = receiver.state_changes();

        let settlement = SettlementHandle::spawn(receiver.clone());
        let ack = AckCoordinator::new(settlement.clone());
        let fail = FailureCoordinator::new(config.channel.clone(), settlement);

        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_BUFFER);
        let shared = Arc::new(IncomingShared {
            channel: config.channel.clone(),
            receiver,
            ack,
            fail,
            closed: AtomicBool::new(false),
            activated: AtomicBool::new(false),
            delivery_tx: Mutex::new(Some(delivery_tx)),
        });

        if !config.lazy_start {
            shared.activate()?;
        }

        Ok(Self {
            config,
            shared,
            state_rx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
        })
    }

    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    /// The envelope stream. Can be taken once; with lazy start the
    /// receiver activates on the stream's first poll.
    pub fn stream(&self) -> Option<EnvelopeStream> {
        let rx = self.delivery_rx.lock().take()?;
        Some(EnvelopeStream {
            rx,
            activator: Some(self.shared.clone()),
        })
    }

    /// Whether the receiver has been activated. Lazy channels count as
    /// started before first demand; they are intentionally dormant.
    pub fn is_started(&self) -> bool {
        self.shared.activated.load(Ordering::SeqCst)
            || (self.config.lazy_start && !self.shared.closed.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.is_started() && self.is_alive() && !self.shared.closed.load(Ordering::SeqCst)
    }

    /// Not-alive from a connection loss until recovery is observed, or
    /// from a termination the adapter did not initiate
    pub fn is_alive(&self) -> bool {
        match *self.state_rx.borrow() {
            ReceiverState::ConnectionLost => false,
            ReceiverState::Terminated => self.shared.closed.load(Ordering::SeqCst),
            _ => true,
        }
    }

    /// Idempotent close: the poll loop observes the flag within one
    /// receive attempt, and termination is bounded by the grace period.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(channel = %self.config.channel, "Closing incoming channel");

        let receiver = self.shared.receiver.clone();
        let terminate = tokio::task::spawn_blocking(move || receiver.terminate(CLOSE_GRACE));
        match tokio::time::timeout(CLOSE_GRACE + POLL_TIMEOUT, terminate).await {
            Ok(Ok(Ok(()))) => debug!(channel = %self.config.channel, "Receiver terminated"),
            Ok(Ok(Err(e))) => {
                warn!(channel = %self.config.channel, error = %e, "Receiver termination failed")
            }
            Ok(Err(_)) | Err(_) => warn!(
                channel = %self.config.channel,
                "Receiver termination exceeded grace period, abandoning in-flight deliveries"
            ),
        }
    }
}

impl Drop for IncomingChannelAdapter {
    /// An adapter dropped without `close()` must still release its poll
    /// loop; the flag is observed within one receive timeout.
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

/// Stream of envelopes produced by an incoming channel
pub struct EnvelopeStream {
    rx: mpsc::Receiver<Envelope>,
    activator: Option<Arc<IncomingShared>>,
}

impl Stream for EnvelopeStream {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        if let Some(shared) = self.activator.take() {
            if let Err(e) = shared.activate() {
                error!(channel = %shared.channel, error = %e, "Lazy activation failed");
                return Poll::Ready(None);
            }
        }
        self.rx.poll_recv(cx)
    }
}
