//! Commands dispatched from the public API to the decision loop.

use lnmux_core::{InvoiceCreationData, PaymentHash};
use tokio::sync::oneshot;

use crate::error::RegistryError;
use crate::fanout::{InvoiceUpdate, Subscriber};
use crate::htlc::{ExitHopHtlc, FailReason, HtlcResolver};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, RegistryError>>;

/// A request handled by the registry's decision loop.
#[derive(Debug)]
pub(crate) enum RegistryCommand {
    /// Register a new invoice.
    NewInvoice {
        data: InvoiceCreationData,
        reply: Reply<()>,
    },
    /// Attach a subscriber to an invoice.
    Subscribe {
        hash: PaymentHash,
        subscriber: Subscriber,
        reply: Reply<()>,
    },
    /// Decide an HTLC arriving at the exit hop. The decision goes to the
    /// resolver rather than a reply channel.
    NotifyExitHopHtlc {
        htlc: ExitHopHtlc,
        resolver: HtlcResolver,
    },
    /// Release the preimage of a fully paid hold invoice.
    Settle {
        hash: PaymentHash,
        reply: Reply<()>,
    },
    /// Operator cancellation of an invoice that has not settled.
    CancelInvoice {
        hash: PaymentHash,
        reply: Reply<()>,
    },
    /// Read the current state of an invoice.
    LookupInvoice {
        hash: PaymentHash,
        reply: Reply<Option<InvoiceUpdate>>,
    },
}

impl RegistryCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewInvoice { .. } => "new_invoice",
            Self::Subscribe { .. } => "subscribe",
            Self::NotifyExitHopHtlc { .. } => "notify_exit_hop_htlc",
            Self::Settle { .. } => "settle",
            Self::CancelInvoice { .. } => "cancel_invoice",
            Self::LookupInvoice { .. } => "lookup_invoice",
        }
    }

    /// Give up on a command the loop will never process.
    ///
    /// HTLCs are failed back; reply channels are dropped, which callers
    /// observe as [`RegistryError::Shutdown`].
    pub fn abort(self) {
        if let Self::NotifyExitHopHtlc { htlc, resolver } = self {
            tracing::debug!(hash = %htlc.payment_hash, circuit = %htlc.circuit_key, "failing htlc, registry stopping");
            let _ = resolver.fail(FailReason::Unavailable);
        }
    }
}
