use async_trait::async_trait;
use lnmux_core::{InvoiceRecord, PaymentHash, StateUpdate};

use crate::error::PersistenceError;

/// Durable invoice storage used by the registry.
///
/// The registry calls into the store from its single decision loop, one
/// operation at a time. Every write must be durable when the returned future
/// resolves: the registry releases preimages and HTLC resolutions right after.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Insert a newly created invoice.
    ///
    /// Fails with [`PersistenceError::DuplicateInvoice`] if the hash is taken.
    async fn add_invoice(&self, record: &InvoiceRecord) -> Result<(), PersistenceError>;

    /// Load every invoice that has not reached a final state.
    async fn load_pending(&self) -> Result<Vec<InvoiceRecord>, PersistenceError>;

    /// Fetch a single invoice, in any state.
    async fn get_invoice(
        &self,
        hash: &PaymentHash,
    ) -> Result<Option<InvoiceRecord>, PersistenceError>;

    /// Record a state transition.
    ///
    /// Fails with [`PersistenceError::NotFound`] for unknown hashes.
    async fn persist_transition(
        &self,
        hash: &PaymentHash,
        update: &StateUpdate,
    ) -> Result<(), PersistenceError>;
}
