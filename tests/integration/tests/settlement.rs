//! Integration test: auto-settle and hold invoices.

use std::sync::Arc;
use std::time::Duration;

use lnmux_core::{CancelledReason, InvoiceState};
use lnmux_integration_tests::{htlc_part, invoice, resolution, TestContext};
use lnmux_persistence::{InvoiceStore, MemoryStore};
use lnmux_registry::{FailReason, HtlcResolution, RegistryError, TestClock};

#[tokio::test]
async fn test_auto_settle_single_htlc() {
    let ctx = TestContext::start();
    let data = invoice(1, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    let hash = data.payment_hash();

    let (_handle, mut updates) = ctx.subscribe(hash).await;
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    let rx = ctx.pay(htlc_part(&data, 0, 10_000, 10_000)).await;
    assert_eq!(
        resolution(rx).await,
        HtlcResolution::Settle {
            preimage: data.payment_preimage
        }
    );

    let mut states = Vec::new();
    for _ in 0..4 {
        states.push(updates.next().await.state);
    }
    assert_eq!(
        states,
        vec![
            InvoiceState::Open,
            InvoiceState::Accepted,
            InvoiceState::SettleRequested,
            InvoiceState::Settled,
        ]
    );
    assert!(updates.is_quiet(Duration::from_millis(100)).await);

    let settled = ctx.registry.lookup_invoice(hash).await.unwrap().unwrap();
    assert_eq!(settled.amount_paid.as_u64(), 10_000);
    assert_eq!(settled.cancelled_reason, None);
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_overpayment_settles() {
    let ctx = TestContext::start();
    let data = invoice(2, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    let rx = ctx.pay(htlc_part(&data, 0, 12_000, 10_000)).await;
    assert!(matches!(resolution(rx).await, HtlcResolution::Settle { .. }));
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_htlc_after_settle_rejected() {
    let ctx = TestContext::start();
    let data = invoice(3, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    ctx.registry.new_invoice(data.clone()).await.unwrap();
    resolution(ctx.pay(htlc_part(&data, 0, 10_000, 10_000)).await).await;

    let rx = ctx.pay(htlc_part(&data, 1, 10_000, 10_000)).await;
    assert_eq!(
        resolution(rx).await,
        HtlcResolution::Fail {
            reason: FailReason::UnknownOrTerminalInvoice
        }
    );
    ctx.stop().await.unwrap();
}

// =========================================================================
// Hold invoices
// =========================================================================

#[tokio::test]
async fn test_hold_invoice_waits_for_settle() {
    let ctx = TestContext::start();
    let data = invoice(4, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), false);
    let hash = data.payment_hash();
    let (_handle, mut updates) = ctx.subscribe(hash).await;
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    let mut rx = ctx.pay(htlc_part(&data, 0, 10_000, 10_000)).await;
    assert_eq!(updates.next().await.state, InvoiceState::Open);
    assert_eq!(updates.next().await.state, InvoiceState::Accepted);
    assert_eq!(updates.next().await.state, InvoiceState::SettleRequested);

    // Held until the explicit trigger.
    assert!(tokio::time::timeout(Duration::from_millis(100), &mut rx)
        .await
        .is_err());

    ctx.registry.settle(hash).await.unwrap();
    assert_eq!(
        resolution(rx).await,
        HtlcResolution::Settle {
            preimage: data.payment_preimage
        }
    );
    assert_eq!(updates.next().await.state, InvoiceState::Settled);

    assert_eq!(
        ctx.registry.settle(hash).await,
        Err(RegistryError::InvalidState {
            hash,
            state: InvoiceState::Settled
        })
    );
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_settle_rejected_before_full_payment() {
    let ctx = TestContext::start();
    let data = invoice(5, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), false);
    let hash = data.payment_hash();
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    assert_eq!(
        ctx.registry.settle(hash).await,
        Err(RegistryError::InvalidState {
            hash,
            state: InvoiceState::Open
        })
    );

    let _rx = ctx.pay(htlc_part(&data, 0, 4_000, 10_000)).await;
    assert_eq!(
        ctx.registry.settle(hash).await,
        Err(RegistryError::InvalidState {
            hash,
            state: InvoiceState::Accepted
        })
    );
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsettled_hold_invoice_times_out() {
    let (ctx, clock) = TestContext::start_virtual();
    let data = invoice(6, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), false);
    let hash = data.payment_hash();
    let (_handle, mut updates) = ctx.subscribe(hash).await;
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    let rx = ctx.pay(htlc_part(&data, 0, 10_000, 10_000)).await;
    assert_eq!(updates.next().await.state, InvoiceState::Open);
    assert_eq!(updates.next().await.state, InvoiceState::Accepted);
    assert_eq!(updates.next().await.state, InvoiceState::SettleRequested);

    // Past the partial hold time but within the accept timeout.
    clock.advance(Duration::from_millis(1_500));
    assert!(updates.is_quiet(Duration::from_millis(100)).await);

    clock.advance(Duration::from_millis(1_000));
    let cancelled = updates.next().await;
    assert_eq!(cancelled.state, InvoiceState::Cancelled);
    assert_eq!(cancelled.cancelled_reason, Some(CancelledReason::Timeout));
    assert_eq!(
        resolution(rx).await,
        HtlcResolution::Fail {
            reason: FailReason::Timeout
        }
    );
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_settle_after_restart_waits_for_replayed_parts() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(TestClock::default());

    let ctx = TestContext::start_with(store.clone(), clock.clone());
    let data = invoice(7, clock.as_ref(), 10_000, Duration::from_secs(3600), false);
    let hash = data.payment_hash();
    ctx.registry.new_invoice(data.clone()).await.unwrap();
    let _part = ctx.pay(htlc_part(&data, 0, 10_000, 10_000)).await;
    let (_handle, mut updates) = ctx.subscribe(hash).await;
    assert_eq!(updates.next().await.state, InvoiceState::Accepted);
    assert_eq!(updates.next().await.state, InvoiceState::SettleRequested);
    ctx.stop().await.unwrap();

    // Nothing is held until the node replays the part.
    let ctx = TestContext::start_with(store.clone(), clock.clone());
    assert_eq!(
        ctx.registry.settle(hash).await,
        Err(RegistryError::HtlcsNotHeld(hash))
    );
    let update = ctx.registry.lookup_invoice(hash).await.unwrap().unwrap();
    assert_eq!(update.state, InvoiceState::SettleRequested);

    let rx = ctx.pay(htlc_part(&data, 0, 10_000, 10_000)).await;
    ctx.registry.settle(hash).await.unwrap();
    assert_eq!(
        resolution(rx).await,
        HtlcResolution::Settle {
            preimage: data.payment_preimage
        }
    );

    let settled = ctx.registry.lookup_invoice(hash).await.unwrap().unwrap();
    assert_eq!(settled.state, InvoiceState::Settled);
    assert_eq!(settled.amount_paid.as_u64(), 10_000);
    ctx.stop().await.unwrap();

    let stored = store.get_invoice(&hash).await.unwrap().unwrap();
    assert_eq!(stored.amount_paid.as_u64(), 10_000);
}

