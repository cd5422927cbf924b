use crate::state_machine::{InvoiceEvent, InvoiceState};

/// Core domain errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid invoice state transition from {from} on {event:?}")]
    InvalidStateTransition {
        from: InvoiceState,
        event: InvoiceEvent,
    },

    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
