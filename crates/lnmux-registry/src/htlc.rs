//! Incoming HTLC attempts and their single-use resolution handle.

use lnmux_core::{MilliSatoshi, PaymentAddr, PaymentHash, Preimage};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// Identifies an incoming HTLC on a specific channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CircuitKey {
    pub channel_id: u64,
    pub htlc_id: u64,
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.htlc_id)
    }
}

/// The multi-path payment record from the final hop payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MppRecord {
    /// Total amount of the payment across all parts.
    pub total_amount: MilliSatoshi,
    pub payment_addr: PaymentAddr,
}

/// An HTLC arriving at the exit hop, already decoded by the wire layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitHopHtlc {
    pub circuit_key: CircuitKey,
    pub payment_hash: PaymentHash,
    pub amount_paid: MilliSatoshi,
    /// Absolute block height at which the HTLC times out.
    pub expiry: u32,
    pub current_height: u32,
    /// Absent for legacy single-part payloads, which are rejected.
    pub mpp: Option<MppRecord>,
}

/// Why an HTLC was failed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailReason {
    /// No such invoice, or it is already settled or cancelled.
    UnknownOrTerminalInvoice,
    /// Payment address or total amount does not match the invoice.
    InvalidPayload,
    /// The HTLC expires too close to the current height.
    InsufficientCltvDelta,
    /// The payment was not completed or settled in time.
    Timeout,
    /// The invoice was cancelled by the operator.
    InvoiceCancelled,
    /// The registry was not running when the HTLC was offered.
    Unavailable,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOrTerminalInvoice => write!(f, "UnknownOrTerminalInvoice"),
            Self::InvalidPayload => write!(f, "InvalidPayload"),
            Self::InsufficientCltvDelta => write!(f, "InsufficientCltvDelta"),
            Self::Timeout => write!(f, "Timeout"),
            Self::InvoiceCancelled => write!(f, "InvoiceCancelled"),
            Self::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// The final decision for one HTLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtlcResolution {
    Settle { preimage: Preimage },
    Fail { reason: FailReason },
}

/// Single-use handle through which the registry delivers an HTLC's fate.
///
/// Resolving consumes the handle, so an HTLC can be resolved at most once.
/// The registry resolves every handle it is given while it runs; handles
/// still held when it stops are dropped, which the receiving side observes
/// as a closed channel and must treat as "undecided".
#[derive(Debug)]
pub struct HtlcResolver {
    tx: oneshot::Sender<HtlcResolution>,
}

impl HtlcResolver {
    /// Create a resolver and the receiver on which the decision arrives.
    pub fn channel() -> (Self, oneshot::Receiver<HtlcResolution>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Deliver the resolution. Returns `false` if the receiver is gone.
    pub fn resolve(self, resolution: HtlcResolution) -> bool {
        self.tx.send(resolution).is_ok()
    }

    pub fn settle(self, preimage: Preimage) -> bool {
        self.resolve(HtlcResolution::Settle { preimage })
    }

    pub fn fail(self, reason: FailReason) -> bool {
        self.resolve(HtlcResolution::Fail { reason })
    }
}
