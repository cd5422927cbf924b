//! In-memory invoice table owned by the decision loop.

use lnmux_core::{InvoiceRecord, PaymentHash};
use std::collections::HashMap;

use crate::engine::HtlcSet;

/// An invoice together with the HTLCs currently held for it.
#[derive(Debug)]
pub(crate) struct InvoiceEntry {
    pub record: InvoiceRecord,
    pub htlcs: HtlcSet,
}

impl InvoiceEntry {
    pub fn new(record: InvoiceRecord) -> Self {
        Self {
            record,
            htlcs: HtlcSet::new(),
        }
    }
}

/// Authoritative in-memory state, rebuilt from storage at startup.
///
/// Invoices stay resident after reaching a final state so late subscribers
/// and replayed HTLCs see the outcome without a storage round-trip.
#[derive(Debug, Default)]
pub(crate) struct InvoiceTable {
    entries: HashMap<PaymentHash, InvoiceEntry>,
}

impl InvoiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: InvoiceRecord) {
        self.entries.insert(record.hash, InvoiceEntry::new(record));
    }

    pub fn get(&self, hash: &PaymentHash) -> Option<&InvoiceEntry> {
        self.entries.get(hash)
    }

    pub fn get_mut(&mut self, hash: &PaymentHash) -> Option<&mut InvoiceEntry> {
        self.entries.get_mut(hash)
    }

    pub fn contains(&self, hash: &PaymentHash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Number of HTLCs held across all invoices.
    pub fn held_htlcs(&self) -> usize {
        self.entries.values().map(|e| e.htlcs.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
