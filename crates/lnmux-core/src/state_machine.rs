use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle states of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceState {
    /// Created and awaiting payment.
    Open,
    /// At least one HTLC is held against the invoice.
    Accepted,
    /// The full amount is held; settlement has been requested.
    SettleRequested,
    /// The preimage was released. Final state.
    Settled,
    /// The invoice will never be paid. Final state.
    Cancelled,
}

impl InvoiceState {
    /// Whether this is a final (terminal) state.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Settled | Self::Cancelled)
    }
}

impl fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Accepted => write!(f, "Accepted"),
            Self::SettleRequested => write!(f, "SettleRequested"),
            Self::Settled => write!(f, "Settled"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Why an invoice ended up `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelledReason {
    /// The invoice expiry passed while it was still open.
    Expired,
    /// Held HTLCs were not completed or settled in time.
    Timeout,
    /// Cancelled on request of the operator.
    External,
}

impl fmt::Display for CancelledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "Expired"),
            Self::Timeout => write!(f, "Timeout"),
            Self::External => write!(f, "External"),
        }
    }
}

/// Events that drive invoice transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceEvent {
    /// The first HTLC of a payment was accepted.
    Accept,
    /// Accepted HTLCs cover the invoice amount.
    RequestSettle,
    /// Settlement committed; the preimage may be released.
    Settle,
    /// Expiry, timeout, or operator cancellation.
    Cancel,
}

/// Invoice transition table.
///
/// Valid transitions:
/// - Open → Accepted (Accept)
/// - Open → Cancelled (Cancel)
/// - Accepted → SettleRequested (RequestSettle)
/// - Accepted → Cancelled (Cancel)
/// - SettleRequested → Settled (Settle)
/// - SettleRequested → Cancelled (Cancel)
pub struct InvoiceStateMachine;

impl InvoiceStateMachine {
    /// Apply `event` to `current`, returning the next state.
    pub fn transition(
        current: InvoiceState,
        event: InvoiceEvent,
    ) -> Result<InvoiceState, CoreError> {
        let next = match (current, event) {
            (InvoiceState::Open, InvoiceEvent::Accept) => InvoiceState::Accepted,
            (InvoiceState::Open, InvoiceEvent::Cancel) => InvoiceState::Cancelled,

            (InvoiceState::Accepted, InvoiceEvent::RequestSettle) => InvoiceState::SettleRequested,
            (InvoiceState::Accepted, InvoiceEvent::Cancel) => InvoiceState::Cancelled,

            (InvoiceState::SettleRequested, InvoiceEvent::Settle) => InvoiceState::Settled,
            (InvoiceState::SettleRequested, InvoiceEvent::Cancel) => InvoiceState::Cancelled,

            _ => {
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    event,
                })
            }
        };

        tracing::trace!(from = %current, to = %next, event = ?event, "invoice state transition");

        Ok(next)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: InvoiceState, event: InvoiceEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
