//! Integration test: multi-part payments, payload checks and cancellation.

use std::time::Duration;

use lnmux_core::{CancelledReason, InvoiceState, PaymentAddr};
use lnmux_integration_tests::{htlc_part, invoice, resolution, TestContext};
use lnmux_registry::{FailReason, HtlcResolution, MppRecord};

#[tokio::test]
async fn test_two_parts_settle_together() {
    let ctx = TestContext::start();
    let data = invoice(1, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    let hash = data.payment_hash();
    let (_handle, mut updates) = ctx.subscribe(hash).await;
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    let mut r1 = ctx.pay(htlc_part(&data, 0, 5_000, 10_000)).await;
    assert_eq!(updates.next().await.state, InvoiceState::Open);
    assert_eq!(updates.next().await.state, InvoiceState::Accepted);
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut r1)
        .await
        .is_err());

    let r2 = ctx.pay(htlc_part(&data, 1, 5_000, 10_000)).await;
    let settle = HtlcResolution::Settle {
        preimage: data.payment_preimage,
    };
    assert_eq!(resolution(r1).await, settle);
    assert_eq!(resolution(r2).await, settle);

    assert_eq!(updates.next().await.state, InvoiceState::SettleRequested);
    let settled = updates.next().await;
    assert_eq!(settled.state, InvoiceState::Settled);
    assert_eq!(settled.amount_paid.as_u64(), 10_000);
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_single_part_times_out() {
    let (ctx, clock) = TestContext::start_virtual();
    let data = invoice(2, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    let hash = data.payment_hash();
    let (_handle, mut updates) = ctx.subscribe(hash).await;
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    let rx = ctx.pay(htlc_part(&data, 0, 5_000, 10_000)).await;
    assert_eq!(updates.next().await.state, InvoiceState::Open);
    let accepted = updates.next().await;
    assert_eq!(accepted.state, InvoiceState::Accepted);
    assert_eq!(accepted.amount_paid.as_u64(), 5_000);

    clock.advance(Duration::from_millis(1_001));
    assert_eq!(
        resolution(rx).await,
        HtlcResolution::Fail {
            reason: FailReason::Timeout
        }
    );
    let cancelled = updates.next().await;
    assert_eq!(cancelled.state, InvoiceState::Cancelled);
    assert_eq!(cancelled.cancelled_reason, Some(CancelledReason::Timeout));
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_parts_leave_invoice_untouched() {
    let ctx = TestContext::start();
    let data = invoice(3, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    let hash = data.payment_hash();
    let (_handle, mut updates) = ctx.subscribe(hash).await;
    ctx.registry.new_invoice(data.clone()).await.unwrap();
    assert_eq!(updates.next().await.state, InvoiceState::Open);

    let mut wrong_addr = htlc_part(&data, 0, 10_000, 10_000);
    wrong_addr.mpp = Some(MppRecord {
        total_amount: data.value,
        payment_addr: PaymentAddr([0u8; 32]),
    });

    let wrong_total = htlc_part(&data, 1, 10_000, 20_000);

    let mut no_mpp = htlc_part(&data, 2, 10_000, 10_000);
    no_mpp.mpp = None;

    let mut close_expiry = htlc_part(&data, 3, 10_000, 10_000);
    close_expiry.expiry = close_expiry.current_height + 10;

    let cases = [
        (wrong_addr, FailReason::InvalidPayload),
        (wrong_total, FailReason::InvalidPayload),
        (no_mpp, FailReason::InvalidPayload),
        (close_expiry, FailReason::InsufficientCltvDelta),
    ];
    for (htlc, reason) in cases {
        let rx = ctx.pay(htlc).await;
        assert_eq!(resolution(rx).await, HtlcResolution::Fail { reason });
    }

    assert!(updates.is_quiet(Duration::from_millis(100)).await);
    let update = ctx.registry.lookup_invoice(hash).await.unwrap().unwrap();
    assert_eq!(update.state, InvoiceState::Open);
    assert_eq!(update.amount_paid.as_u64(), 0);
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_zero_value_invoice_takes_payer_total() {
    let ctx = TestContext::start();
    let data = invoice(4, ctx.clock.as_ref(), 0, Duration::from_secs(3600), true);
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    let r1 = ctx.pay(htlc_part(&data, 0, 3_000, 7_000)).await;
    // Disagrees with the total fixed by the first part.
    let bad = ctx.pay(htlc_part(&data, 1, 4_000, 8_000)).await;
    assert_eq!(
        resolution(bad).await,
        HtlcResolution::Fail {
            reason: FailReason::InvalidPayload
        }
    );

    let r2 = ctx.pay(htlc_part(&data, 2, 4_000, 7_000)).await;
    assert!(matches!(resolution(r1).await, HtlcResolution::Settle { .. }));
    assert!(matches!(resolution(r2).await, HtlcResolution::Settle { .. }));

    let update = ctx
        .registry
        .lookup_invoice(data.payment_hash())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.amount_paid.as_u64(), 7_000);
    ctx.stop().await.unwrap();
}

#[tokio::test]
async fn test_operator_cancel_fails_held_parts() {
    let ctx = TestContext::start();
    let data = invoice(5, ctx.clock.as_ref(), 10_000, Duration::from_secs(3600), true);
    let hash = data.payment_hash();
    let (_handle, mut updates) = ctx.subscribe(hash).await;
    ctx.registry.new_invoice(data.clone()).await.unwrap();

    let r1 = ctx.pay(htlc_part(&data, 0, 3_000, 10_000)).await;
    let r2 = ctx.pay(htlc_part(&data, 1, 3_000, 10_000)).await;
    ctx.registry.cancel_invoice(hash).await.unwrap();

    let cancelled = HtlcResolution::Fail {
        reason: FailReason::InvoiceCancelled,
    };
    assert_eq!(resolution(r1).await, cancelled);
    assert_eq!(resolution(r2).await, cancelled);

    assert_eq!(updates.next().await.state, InvoiceState::Open);
    assert_eq!(updates.next().await.state, InvoiceState::Accepted);
    let update = updates.next().await;
    assert_eq!(update.state, InvoiceState::Cancelled);
    assert_eq!(update.cancelled_reason, Some(CancelledReason::External));

    // A late part for the cancelled invoice is refused.
    let r3 = ctx.pay(htlc_part(&data, 2, 4_000, 10_000)).await;
    assert_eq!(
        resolution(r3).await,
        HtlcResolution::Fail {
            reason: FailReason::UnknownOrTerminalInvoice
        }
    );
    ctx.stop().await.unwrap();
}
