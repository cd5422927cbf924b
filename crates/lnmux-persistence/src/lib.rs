//! lnmux persistence
//!
//! The storage seam of the invoice registry. The registry only talks to the
//! [`InvoiceStore`] trait; this crate ships an in-memory store for tests and
//! embedded use, and a RocksDB store behind the `rocksdb` feature.

pub mod error;
pub mod traits;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use error::PersistenceError;
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;
pub use traits::InvoiceStore;
