use lnmux_core::PaymentHash;

/// Persistence-layer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("invoice already exists: {0}")]
    DuplicateInvoice(PaymentHash),

    #[error("invoice not found: {0}")]
    NotFound(PaymentHash),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
