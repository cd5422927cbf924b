//! lnmux invoice registry
//!
//! The settlement core of a Lightning payment receiver. An
//! [`InvoiceRegistry`] owns every invoice addressed to this node, decides the
//! fate of each incoming HTLC, fires expiry and accept-timeout deadlines, and
//! streams state transitions to subscribers.
//!
//! All invoice mutations are applied by one decision loop (see
//! [`InvoiceRegistry::run`]); the public API talks to it over a command
//! channel, so callers on any task observe a single linear history per
//! invoice.

pub mod clock;
pub mod config;
pub mod error;
pub mod htlc;
pub mod fanout;
pub mod scheduler;
pub mod registry;

mod commands;
mod engine;
mod state;

pub use clock::{Clock, SystemClock, TestClock};
pub use config::RegistryConfig;
pub use error::RegistryError;
pub use fanout::{InvoiceUpdate, SubscriptionHandle, SubscriptionId};
pub use htlc::{CircuitKey, ExitHopHtlc, FailReason, HtlcResolution, HtlcResolver, MppRecord};
pub use registry::InvoiceRegistry;
