//! lnmux core
//!
//! Domain types shared by the persistence layer and the invoice registry:
//! hashes and preimages, millisatoshi amounts, invoice records, and the
//! invoice lifecycle state machine.

pub mod error;
pub mod types;
pub mod invoice;
pub mod state_machine;

pub use error::CoreError;
pub use invoice::{InvoiceCreationData, InvoiceRecord, StateUpdate};
pub use state_machine::{CancelledReason, InvoiceEvent, InvoiceState, InvoiceStateMachine};
pub use types::{MilliSatoshi, PaymentAddr, PaymentHash, Preimage};
