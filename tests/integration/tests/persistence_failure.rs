//! Integration test: a storage failure is fatal to the registry loop.

use std::sync::Arc;
use std::time::Duration;

use lnmux_core::InvoiceState;
use lnmux_integration_tests::{htlc_part, invoice, TestContext, WAIT};
use lnmux_persistence::{InvoiceStore, MemoryStore, PersistenceError};
use lnmux_registry::{FailReason, HtlcResolution, RegistryError, TestClock};

#[tokio::test]
async fn test_failed_transition_stops_run() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(TestClock::default());
    let ctx = TestContext::start_with(store.clone(), clock.clone());

    let data = invoice(1, clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    let hash = data.payment_hash();
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    store.set_fail_writes(true);
    let rx = ctx.pay(htlc_part(&data, 0, 10_000, 10_000)).await;

    let registry = Arc::clone(&ctx.registry);
    let result = ctx.join().await;
    assert!(matches!(
        result,
        Err(RegistryError::Persistence(PersistenceError::Backend(_)))
    ));

    // The HTLC was never decided and the preimage was never released.
    let outcome = tokio::time::timeout(WAIT, rx).await.unwrap();
    assert!(outcome.is_err());

    // Nothing was committed past Open.
    let stored = store.get_invoice(&hash).await.unwrap().unwrap();
    assert_eq!(stored.state, InvoiceState::Open);

    // The stopped registry refuses further work.
    assert_eq!(
        registry.lookup_invoice(hash).await,
        Err(RegistryError::Shutdown)
    );
    let (resolver, rx) = lnmux_registry::HtlcResolver::channel();
    registry
        .notify_exit_hop_htlc(htlc_part(&data, 1, 10_000, 10_000), resolver)
        .await;
    assert_eq!(
        rx.await.unwrap(),
        HtlcResolution::Fail {
            reason: FailReason::Unavailable
        }
    );
}

#[tokio::test]
async fn test_failed_creation_reported_to_caller() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(TestClock::default());
    let ctx = TestContext::start_with(store.clone(), clock.clone());
    store.set_fail_writes(true);

    let data = invoice(2, clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    let result = ctx.registry.new_invoice(data).await;
    assert!(matches!(result, Err(RegistryError::Persistence(_))));
    assert!(result.unwrap_err().is_fatal());

    assert!(matches!(
        ctx.join().await,
        Err(RegistryError::Persistence(_))
    ));
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_restart_after_failure_recovers() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(TestClock::default());
    let ctx = TestContext::start_with(store.clone(), clock.clone());

    let data = invoice(3, clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    let hash = data.payment_hash();
    ctx.registry.new_invoice(data.clone()).await.unwrap();
    store.set_fail_writes(true);
    let _ = ctx.pay(htlc_part(&data, 0, 10_000, 10_000)).await;
    assert!(ctx.join().await.is_err());

    store.set_fail_writes(false);
    let ctx = TestContext::start_with(store, clock);
    let rx = ctx.pay(htlc_part(&data, 0, 10_000, 10_000)).await;
    assert_eq!(
        lnmux_integration_tests::resolution(rx).await,
        HtlcResolution::Settle {
            preimage: data.payment_preimage
        }
    );
    let update = ctx.registry.lookup_invoice(hash).await.unwrap().unwrap();
    assert_eq!(update.state, InvoiceState::Settled);
    ctx.stop().await.unwrap();
}
