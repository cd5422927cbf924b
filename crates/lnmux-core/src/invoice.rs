use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::{CancelledReason, InvoiceState};
use crate::types::{MilliSatoshi, PaymentAddr, PaymentHash, Preimage};

/// Everything needed to register a new invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCreationData {
    /// Caller-assigned identifier.
    pub id: u64,
    pub payment_preimage: Preimage,
    pub payment_addr: PaymentAddr,
    /// Expected amount. Zero accepts any amount.
    pub value: MilliSatoshi,
    pub final_cltv_delta: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Settle as soon as the full amount is held, without an external trigger.
    pub auto_settle: bool,
    /// Encoded payment request. Opaque to the registry.
    pub payment_request: String,
}

impl InvoiceCreationData {
    pub fn payment_hash(&self) -> PaymentHash {
        self.payment_preimage.hash()
    }
}

/// An invoice together with its lifecycle state, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub hash: PaymentHash,
    pub data: InvoiceCreationData,
    pub state: InvoiceState,
    pub cancelled_reason: Option<CancelledReason>,
    pub accepted_at: Option<DateTime<Utc>>,
    /// Total HTLC amount held at the last transition.
    pub amount_paid: MilliSatoshi,
    pub updated_at: DateTime<Utc>,
}

impl InvoiceRecord {
    /// Build the initial `Open` record for freshly created invoice data.
    pub fn open(data: InvoiceCreationData) -> Self {
        Self {
            hash: data.payment_hash(),
            updated_at: data.created_at,
            data,
            state: InvoiceState::Open,
            cancelled_reason: None,
            accepted_at: None,
            amount_paid: MilliSatoshi::ZERO,
        }
    }

    /// Apply a persisted state update to this record.
    pub fn apply(&mut self, update: &StateUpdate) {
        self.state = update.state;
        self.cancelled_reason = update.cancelled_reason;
        self.accepted_at = update.accepted_at;
        self.amount_paid = update.amount_paid;
        self.updated_at = update.updated_at;
    }
}

/// The delta written to storage on every invoice transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub state: InvoiceState,
    pub cancelled_reason: Option<CancelledReason>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub amount_paid: MilliSatoshi,
    pub updated_at: DateTime<Utc>,
}
