use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lnmux_core::{InvoiceRecord, PaymentHash, StateUpdate};

use crate::error::PersistenceError;
use crate::traits::InvoiceStore;

/// In-memory invoice store.
///
/// Nothing survives the process, but the store can be shared between
/// successive registry instances to exercise restart recovery. Writes can be
/// made to fail on demand to exercise the registry's fatal-error path.
pub struct MemoryStore {
    invoices: DashMap<PaymentHash, InvoiceRecord>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            invoices: DashMap::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Get the number of stored invoices.
    pub fn len(&self) -> usize {
        self.invoices.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.invoices.is_empty()
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend("write rejected".into()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn add_invoice(&self, record: &InvoiceRecord) -> Result<(), PersistenceError> {
        self.check_writable()?;
        match self.invoices.entry(record.hash) {
            Entry::Occupied(_) => Err(PersistenceError::DuplicateInvoice(record.hash)),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                tracing::debug!(hash = %record.hash, "invoice stored");
                Ok(())
            }
        }
    }

    async fn load_pending(&self) -> Result<Vec<InvoiceRecord>, PersistenceError> {
        Ok(self
            .invoices
            .iter()
            .filter(|entry| !entry.state.is_final())
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_invoice(
        &self,
        hash: &PaymentHash,
    ) -> Result<Option<InvoiceRecord>, PersistenceError> {
        Ok(self.invoices.get(hash).map(|entry| entry.value().clone()))
    }

    async fn persist_transition(
        &self,
        hash: &PaymentHash,
        update: &StateUpdate,
    ) -> Result<(), PersistenceError> {
        self.check_writable()?;
        let mut entry = self
            .invoices
            .get_mut(hash)
            .ok_or(PersistenceError::NotFound(*hash))?;
        entry.value_mut().apply(update);
        Ok(())
    }
}
