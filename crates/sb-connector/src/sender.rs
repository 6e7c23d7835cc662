//! Bounded-concurrency sender, the outgoing concurrency core
//!
//! Caps the number of published-but-unresolved messages while
//! guaranteeing exactly-once disposition per admitted message. An
//! admission slot (owned semaphore permit) is reserved *before* the next
//! upstream item is requested, so demand toward the application is
//! completion-driven rather than a fixed prefetch window. Publish
//! initiation runs on the pump task itself, one message at a time, so
//! broker submission order matches upstream order; only the receipt
//! waits overlap, and a late resolution for one message never touches
//! another's slot.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use sb_broker::PublishReceipt;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use crate::error::{ConnectorError, Result};
use crate::outbound::{AppMessage, Disposition};

/// Resolves when the broker reports the outcome of one initiated publish
pub type ReceiptWait = BoxFuture<'static, Result<Option<PublishReceipt>>>;

/// The broker-facing send half the sender fans into; implemented by the
/// outgoing channel adapter over its publisher
#[async_trait]
pub trait SendOperation: Send + Sync {
    /// Initiate the publish of one message. Initiations are awaited in
    /// admission order; the returned wait resolves with the receipt (or
    /// `None` when no receipt was requested) and may complete in any
    /// order relative to other messages.
    async fn send(&self, message: &AppMessage, wait_for_receipt: bool) -> Result<ReceiptWait>;
}

/// Upstream sequence feeding the sender. Elastic channels hand over an
/// unbounded receiver, the other strategies a bounded one.
pub enum UpstreamSource {
    Bounded(mpsc::Receiver<AppMessage>),
    Unbounded(mpsc::UnboundedReceiver<AppMessage>),
}

impl UpstreamSource {
    async fn recv(&mut self) -> Option<AppMessage> {
        match self {
            UpstreamSource::Bounded(rx) => rx.recv().await,
            UpstreamSource::Unbounded(rx) => rx.recv().await,
        }
    }
}

impl From<mpsc::Receiver<AppMessage>> for UpstreamSource {
    fn from(rx: mpsc::Receiver<AppMessage>) -> Self {
        UpstreamSource::Bounded(rx)
    }
}

impl From<mpsc::UnboundedReceiver<AppMessage>> for UpstreamSource {
    fn from(rx: mpsc::UnboundedReceiver<AppMessage>) -> Self {
        UpstreamSource::Unbounded(rx)
    }
}

pub struct BoundedConcurrencySender {
    channel: String,
    wait_for_receipt: bool,
    /// None when max_in_flight is 0 (unbounded)
    semaphore: Option<Arc<Semaphore>>,
    send_op: Arc<dyn SendOperation>,
    /// Admission instant per unresolved sequence; each entry removed
    /// exactly once by the resolution task
    slots: Arc<DashMap<u64, Instant>>,
    sequence: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
}

impl BoundedConcurrencySender {
    pub fn new(
        channel: impl Into<String>,
        max_in_flight: usize,
        wait_for_receipt: bool,
        send_op: Arc<dyn SendOperation>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            channel: channel.into(),
            wait_for_receipt,
            semaphore: (max_in_flight > 0).then(|| Arc::new(Semaphore::new(max_in_flight))),
            send_op,
            slots: Arc::new(DashMap::new()),
            sequence: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_tx,
        }
    }

    /// Wire the sender between the upstream sequence and the broker-facing
    /// send operation. Consumes upstream until it ends or `cancel` is
    /// called.
    pub fn start(self: &Arc<Self>, upstream: impl Into<UpstreamSource>) {
        let mut upstream = upstream.into();
        let sender = self.clone();
        tokio::spawn(async move {
            let mut cancel_rx = sender.cancel_tx.subscribe();
            loop {
                if sender.cancelled.load(Ordering::SeqCst) {
                    break;
                }

                // Reserve the slot first: upstream demand is completion-driven.
                let permit = match &sender.semaphore {
                    Some(semaphore) => {
                        let acquired = tokio::select! {
                            permit = semaphore.clone().acquire_owned() => permit,
                            _ = cancel_rx.changed() => break,
                        };
                        match acquired {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        }
                    }
                    None => None,
                };

                let message = tokio::select! {
                    item = upstream.recv() => match item {
                        Some(message) => message,
                        None => {
                            debug!(channel = %sender.channel, "Upstream sequence ended");
                            break;
                        }
                    },
                    _ = cancel_rx.changed() => break,
                };

                // Initiation is awaited here, not spawned, so messages
                // reach the broker in upstream order.
                let initiated = tokio::select! {
                    result = sender.send_op.send(&message, sender.wait_for_receipt) => result,
                    _ = cancel_rx.changed() => {
                        message.resolve(Disposition::Nacked(ConnectorError::Closed));
                        break;
                    }
                };
                match initiated {
                    Ok(wait) => sender.track(message, wait, permit),
                    // A failed initiation nacks this message only; the
                    // pipeline continues.
                    Err(e) => message.resolve(Disposition::Nacked(e)),
                }
            }
            debug!(channel = %sender.channel, "Sender pump exited");
        });
    }

    /// Account one initiated message and resolve its disposition when the
    /// receipt wait completes, off the pump task
    fn track(
        self: &Arc<Self>,
        message: AppMessage,
        wait: ReceiptWait,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.slots.insert(sequence, Instant::now());
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let sender = self.clone();
        tokio::spawn(async move {
            let outcome = wait.await;

            // Releasing the slot replenishes the concurrency budget; a
            // missing entry would mean a double completion and must never
            // double-decrement.
            let Some((_, admitted_at)) = sender.slots.remove(&sequence) else {
                error!(
                    channel = %sender.channel,
                    sequence,
                    "In-flight slot already released, ignoring duplicate completion"
                );
                return;
            };
            sender.in_flight.fetch_sub(1, Ordering::SeqCst);
            debug!(
                channel = %sender.channel,
                sequence,
                elapsed_ms = admitted_at.elapsed().as_millis() as u64,
                "Publish resolved"
            );

            match outcome {
                Ok(receipt) => message.resolve(Disposition::Acked(receipt)),
                Err(e) => message.resolve(Disposition::Nacked(e)),
            }
            drop(permit);
        });
    }

    /// Stop requesting upstream items. In-flight operations resolve on
    /// their own; nothing is forcibly failed. The owning channel's
    /// bounded close is the backstop.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cancel_tx.send(true);
        info!(channel = %self.channel, "Sender cancelled");
    }

    /// Wait up to `grace` for in-flight operations to resolve.
    /// Returns whether the pipeline fully drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectorError;
    use crate::outbound::OutgoingPayload;
    use parking_lot::Mutex;
    use tokio::sync::{oneshot, Notify};

    struct RecordingSend {
        concurrent: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
        initiated: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl RecordingSend {
        fn new(delay: Duration) -> Self {
            Self {
                concurrent: Arc::new(AtomicUsize::new(0)),
                max_concurrent: Arc::new(AtomicUsize::new(0)),
                initiated: Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    #[async_trait]
    impl SendOperation for RecordingSend {
        async fn send(&self, message: &AppMessage, _wait: bool) -> Result<ReceiptWait> {
            let text = match &message.payload {
                OutgoingPayload::Text(text) => text.clone(),
                _ => String::new(),
            };
            if text == "poison" {
                return Err(ConnectorError::Publish("poisoned".into()));
            }
            self.initiated.lock().push(text);

            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            let concurrent = self.concurrent.clone();
            let delay = self.delay;
            Ok(Box::pin(async move {
                tokio::time::sleep(delay).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(None)
            }))
        }
    }

    fn submit(tx: &mpsc::Sender<AppMessage>, text: &str) -> oneshot::Receiver<Disposition> {
        let (message, disposition) = AppMessage::new(OutgoingPayload::Text(text.to_string()));
        tx.try_send(message).unwrap();
        disposition
    }

    #[tokio::test]
    async fn never_exceeds_max_in_flight() {
        let send_op = Arc::new(RecordingSend::new(Duration::from_millis(10)));
        let sender = Arc::new(BoundedConcurrencySender::new("out", 3, true, send_op.clone()));
        let (tx, rx) = mpsc::channel(64);
        sender.start(rx);

        let dispositions: Vec<_> = (0..20).map(|i| submit(&tx, &format!("m{i}"))).collect();
        for disposition in dispositions {
            assert!(disposition.await.unwrap().is_acked());
        }
        assert!(send_op.max_concurrent.load(Ordering::SeqCst) <= 3);
        assert_eq!(sender.in_flight(), 0);
    }

    #[tokio::test]
    async fn initiation_follows_submission_order_at_a_wide_window() {
        let send_op = Arc::new(RecordingSend::new(Duration::from_millis(3)));
        let sender = Arc::new(BoundedConcurrencySender::new("out", 1024, true, send_op.clone()));
        let (tx, rx) = mpsc::channel(64);
        sender.start(rx);

        let expected: Vec<String> = (0..50).map(|i| format!("m{i}")).collect();
        let dispositions: Vec<_> = expected.iter().map(|text| submit(&tx, text)).collect();
        for disposition in dispositions {
            assert!(disposition.await.unwrap().is_acked());
        }

        // Receipt waits overlapped, but initiation never reordered.
        assert!(send_op.max_concurrent.load(Ordering::SeqCst) > 1);
        assert_eq!(*send_op.initiated.lock(), expected);
    }

    #[tokio::test]
    async fn unbounded_when_max_in_flight_is_zero() {
        let send_op = Arc::new(RecordingSend::new(Duration::from_millis(5)));
        let sender = Arc::new(BoundedConcurrencySender::new("out", 0, true, send_op.clone()));
        let (tx, rx) = mpsc::channel(64);
        sender.start(rx);

        let dispositions: Vec<_> = (0..10).map(|i| submit(&tx, &format!("m{i}"))).collect();
        for disposition in dispositions {
            assert!(disposition.await.unwrap().is_acked());
        }
        assert!(send_op.max_concurrent.load(Ordering::SeqCst) > 1);
    }

    struct HoldFirstSend {
        release_first: Arc<Notify>,
        sent: AtomicU64,
    }

    #[async_trait]
    impl SendOperation for HoldFirstSend {
        async fn send(&self, _message: &AppMessage, _wait: bool) -> Result<ReceiptWait> {
            let held = self.sent.fetch_add(1, Ordering::SeqCst) == 0;
            let release = self.release_first.clone();
            Ok(Box::pin(async move {
                if held {
                    // First message completes only after someone releases it
                    release.notified().await;
                }
                Ok(None)
            }))
        }
    }

    #[tokio::test]
    async fn late_completion_does_not_affect_later_slots() {
        let release_first = Arc::new(Notify::new());
        let send_op = Arc::new(HoldFirstSend {
            release_first: release_first.clone(),
            sent: AtomicU64::new(0),
        });
        let sender = Arc::new(BoundedConcurrencySender::new("out", 8, true, send_op));
        let (tx, rx) = mpsc::channel(8);
        sender.start(rx);

        let first = submit(&tx, "first");
        let second = submit(&tx, "second");

        // Message 2 resolves while message 1 is still outstanding
        let second = second.await.unwrap();
        assert!(second.is_acked());
        assert_eq!(sender.in_flight(), 1);

        release_first.notify_one();
        assert!(first.await.unwrap().is_acked());
        assert_eq!(sender.in_flight(), 0);
        assert!(sender.slots.is_empty());
    }

    #[tokio::test]
    async fn send_failure_nacks_only_that_message() {
        let send_op = Arc::new(RecordingSend::new(Duration::ZERO));
        let sender = Arc::new(BoundedConcurrencySender::new("out", 4, true, send_op));
        let (tx, rx) = mpsc::channel(8);
        sender.start(rx);

        let good_before = submit(&tx, "ok-1");
        let poisoned = submit(&tx, "poison");
        let good_after = submit(&tx, "ok-2");

        assert!(good_before.await.unwrap().is_acked());
        assert!(matches!(
            poisoned.await.unwrap(),
            Disposition::Nacked(ConnectorError::Publish(_))
        ));
        assert!(good_after.await.unwrap().is_acked());
    }

    #[tokio::test]
    async fn cancel_stops_admission() {
        let send_op = Arc::new(RecordingSend::new(Duration::from_millis(50)));
        let sender = Arc::new(BoundedConcurrencySender::new("out", 1, true, send_op));
        let (tx, rx) = mpsc::channel(8);
        sender.start(rx);

        let admitted = submit(&tx, "admitted");
        tokio::time::sleep(Duration::from_millis(10)).await;
        sender.cancel();
        sender.cancel();

        let mut starved = submit(&tx, "starved");
        // The admitted message resolves; the one behind the cancel never
        // gets a slot.
        assert!(admitted.await.unwrap().is_acked());
        assert!(sender.drain(Duration::from_millis(200)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(starved.try_recv().is_err());
    }
}
