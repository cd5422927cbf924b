//! Delivery of invoice state transitions to subscribers.
//!
//! Each subscription owns a bounded queue drained by a dispatcher thread of
//! its own, which invokes the subscriber's callback. Callbacks may block.
//! The decision loop only ever `try_send`s into those queues: a subscriber
//! that falls a full queue behind is disconnected instead of stalling every
//! other invoice.

use chrono::{DateTime, Utc};
use lnmux_core::{CancelledReason, InvoiceRecord, InvoiceState, MilliSatoshi, PaymentHash};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RegistryError;

/// Immutable snapshot of an invoice after a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceUpdate {
    pub payment_hash: PaymentHash,
    pub state: InvoiceState,
    pub cancelled_reason: Option<CancelledReason>,
    pub amount_paid: MilliSatoshi,
    pub timestamp: DateTime<Utc>,
}

impl InvoiceUpdate {
    pub fn from_record(record: &InvoiceRecord) -> Self {
        Self {
            payment_hash: record.hash,
            state: record.state,
            cancelled_reason: record.cancelled_reason,
            amount_paid: record.amount_paid,
            timestamp: record.updated_at,
        }
    }
}

/// Unique identifier for a subscription (UUID v7, time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An item on a subscription queue.
#[derive(Debug)]
pub(crate) enum Delivery {
    Update(InvoiceUpdate),
    /// Wakes the dispatcher after the handle was cancelled.
    Stop,
}

/// The loop-side end of a subscription.
#[derive(Debug)]
pub(crate) struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Delivery>,
    cancelled: Arc<AtomicBool>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    fn is_gone(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// Queue an update without waiting. Returns `false` if the subscriber
    /// must be dropped.
    fn offer(&self, hash: &PaymentHash, update: InvoiceUpdate) -> bool {
        match self.tx.try_send(Delivery::Update(update)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%hash, subscription = %self.id, "subscriber queue full, disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Caller-side handle of a subscription.
///
/// Once [`cancel`](Self::cancel) returns, no new callback invocation starts.
/// An invocation already running is allowed to finish. Dropping the handle
/// cancels the subscription.
#[must_use = "dropping the handle cancels the subscription"]
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    payment_hash: PaymentHash,
    cancelled: Arc<AtomicBool>,
    wake: mpsc::WeakSender<Delivery>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn payment_hash(&self) -> PaymentHash {
        self.payment_hash
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stop deliveries to this subscription.
    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // A full queue needs no wake-up: the dispatcher checks the flag
        // before every callback.
        if let Some(tx) = self.wake.upgrade() {
            let _ = tx.try_send(Delivery::Stop);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create a subscription and start its dispatcher thread.
///
/// The thread exits once the subscription is cancelled or the registry
/// drops its end of the queue.
pub(crate) fn subscription<F>(
    payment_hash: PaymentHash,
    queue_depth: usize,
    mut callback: F,
) -> Result<(Subscriber, SubscriptionHandle), RegistryError>
where
    F: FnMut(InvoiceUpdate) + Send + 'static,
{
    let id = SubscriptionId::new();
    let (tx, mut rx) = mpsc::channel::<Delivery>(queue_depth);
    let cancelled = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&cancelled);
    std::thread::Builder::new()
        .name("lnmux-subscription".into())
        .spawn(move || {
            while let Some(Delivery::Update(update)) = rx.blocking_recv() {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                callback(update);
            }
            tracing::trace!(hash = %payment_hash, subscription = %id, "subscription dispatcher exited");
        })
        .map_err(|e| RegistryError::Subscription(e.to_string()))?;

    let handle = SubscriptionHandle {
        id,
        payment_hash,
        cancelled: Arc::clone(&cancelled),
        wake: tx.downgrade(),
    };
    let subscriber = Subscriber { id, tx, cancelled };
    Ok((subscriber, handle))
}

/// Per-invoice subscriber sets.
#[derive(Debug, Default)]
pub(crate) struct FanOut {
    subscribers: HashMap<PaymentHash, Vec<Subscriber>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber, delivering `snapshot` first when the invoice
    /// already exists. Subscribers to a final invoice get the snapshot and
    /// are not retained, since nothing follows it.
    pub fn add(&mut self, hash: PaymentHash, subscriber: Subscriber, snapshot: Option<InvoiceUpdate>) {
        let mut is_final = false;
        if let Some(update) = snapshot {
            is_final = update.state.is_final();
            if !subscriber.offer(&hash, update) {
                return;
            }
        }
        if is_final {
            return;
        }
        tracing::debug!(%hash, subscription = %subscriber.id(), "subscriber registered");
        let subscribers = self.subscribers.entry(hash).or_default();
        subscribers.retain(|s| !s.is_gone());
        subscribers.push(subscriber);
    }

    /// Deliver an update to every live subscriber of the invoice.
    ///
    /// Returns the number of subscribers the update was queued for.
    pub fn publish(&mut self, update: &InvoiceUpdate) -> usize {
        let hash = update.payment_hash;
        let Some(subscribers) = self.subscribers.get_mut(&hash) else {
            return 0;
        };

        subscribers.retain(|s| !s.is_gone() && s.offer(&hash, update.clone()));
        let delivered = subscribers.len();

        // No transition follows a final state.
        if update.state.is_final() || subscribers.is_empty() {
            self.subscribers.remove(&hash);
        }
        delivered
    }

    /// Drop cancelled subscribers of every invoice, including invoices
    /// that never publish. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let mut removed = 0;
        self.subscribers.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| !s.is_gone());
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        if removed > 0 {
            tracing::debug!(subscribers = removed, "pruned cancelled subscribers");
        }
        removed
    }

    pub fn subscriber_count(&self, hash: &PaymentHash) -> usize {
        self.subscribers.get(hash).map(|s| s.len()).unwrap_or(0)
    }
}
