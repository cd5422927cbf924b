use lnmux_core::{InvoiceState, PaymentHash};
use lnmux_persistence::PersistenceError;

/// Errors returned by the registry API and by [`crate::InvoiceRegistry::run`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invoice already exists: {0}")]
    DuplicateInvoice(PaymentHash),

    #[error("unknown invoice: {0}")]
    UnknownInvoice(PaymentHash),

    #[error("invoice {hash} is in state {state}")]
    InvalidState {
        hash: PaymentHash,
        state: InvoiceState,
    },

    /// The invoice requested settlement but its HTLCs are not all held,
    /// typically after a restart before the parts are replayed.
    #[error("invoice {0} does not hold a complete htlc set")]
    HtlcsNotHeld(PaymentHash),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("persistence error: {0}")]
    Persistence(PersistenceError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("registry is already running")]
    AlreadyRunning,

    #[error("registry is not running")]
    Shutdown,
}

impl RegistryError {
    /// Whether the error stops the decision loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

impl From<PersistenceError> for RegistryError {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::DuplicateInvoice(hash) => RegistryError::DuplicateInvoice(hash),
            other => RegistryError::Persistence(other),
        }
    }
}
