//! RocksDB-backed invoice store.

use async_trait::async_trait;
use lnmux_core::{InvoiceRecord, PaymentHash, StateUpdate};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteOptions, DB};
use std::path::Path;
use std::sync::Arc;

use crate::error::PersistenceError;
use crate::traits::InvoiceStore;

/// Column family holding invoice records keyed by payment hash.
const CF_INVOICES: &str = "invoices";

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

/// RocksDB invoice store. Records are stored as JSON; writes are synced.
///
/// Every database call runs on tokio's blocking pool so a synced write
/// never stalls the runtime driving the registry loop.
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(path).map_err(|e| PersistenceError::Backend(e.to_string()))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = vec![ColumnFamilyDescriptor::new(CF_INVOICES, Options::default())];
        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;

        tracing::info!(path = %path.display(), "invoice store opened");
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&DB) -> Result<T, PersistenceError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| PersistenceError::Backend(format!("storage task failed: {}", e)))?
    }
}

fn invoices(db: &DB) -> Result<&ColumnFamily, PersistenceError> {
    db.cf_handle(CF_INVOICES)
        .ok_or_else(|| PersistenceError::Backend(format!("column family '{}' not found", CF_INVOICES)))
}

fn read(db: &DB, hash: &PaymentHash) -> Result<Option<InvoiceRecord>, PersistenceError> {
    let cf = invoices(db)?;
    match db.get_cf(cf, hash.as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn write(db: &DB, record: &InvoiceRecord) -> Result<(), PersistenceError> {
    let cf = invoices(db)?;
    let value = serde_json::to_vec(record)?;
    let mut write_opts = WriteOptions::default();
    write_opts.set_sync(true);
    db.put_cf_opt(cf, record.hash.as_bytes(), value, &write_opts)?;
    Ok(())
}

#[async_trait]
impl InvoiceStore for RocksStore {
    async fn add_invoice(&self, record: &InvoiceRecord) -> Result<(), PersistenceError> {
        let record = record.clone();
        self.blocking(move |db| {
            // The registry issues writes one at a time, so check-then-put is safe.
            if read(db, &record.hash)?.is_some() {
                return Err(PersistenceError::DuplicateInvoice(record.hash));
            }
            write(db, &record)
        })
        .await
    }

    async fn load_pending(&self) -> Result<Vec<InvoiceRecord>, PersistenceError> {
        self.blocking(|db| {
            let cf = invoices(db)?;
            let mut pending = Vec::new();
            for item in db.iterator_cf(cf, IteratorMode::Start) {
                let (_, value) = item?;
                let record: InvoiceRecord = serde_json::from_slice(&value)?;
                if !record.state.is_final() {
                    pending.push(record);
                }
            }
            Ok(pending)
        })
        .await
    }

    async fn get_invoice(
        &self,
        hash: &PaymentHash,
    ) -> Result<Option<InvoiceRecord>, PersistenceError> {
        let hash = *hash;
        self.blocking(move |db| read(db, &hash)).await
    }

    async fn persist_transition(
        &self,
        hash: &PaymentHash,
        update: &StateUpdate,
    ) -> Result<(), PersistenceError> {
        let hash = *hash;
        let update = update.clone();
        self.blocking(move |db| {
            let mut record = read(db, &hash)?.ok_or(PersistenceError::NotFound(hash))?;
            record.apply(&update);
            write(db, &record)
        })
        .await
    }
}
