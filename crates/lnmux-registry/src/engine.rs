//! HTLC resolution engine.
//!
//! Decides the fate of each HTLC arriving at the exit hop: reject it,
//! hold it until the payment set is complete, or settle the complete set.

use lnmux_core::{
    InvoiceEvent, InvoiceRecord, InvoiceState, MilliSatoshi, PaymentHash, Preimage,
};

use crate::error::RegistryError;
use crate::htlc::{CircuitKey, ExitHopHtlc, FailReason, HtlcResolver};
use crate::registry::RegistryLoop;
use crate::scheduler::DeadlineKind;

/// Validate an HTLC against the invoice it pays.
///
/// Returns the amount the payment set must reach before it can settle.
pub(crate) fn check_htlc(
    record: &InvoiceRecord,
    set: &HtlcSet,
    htlc: &ExitHopHtlc,
    final_cltv_reject_delta: u32,
) -> Result<MilliSatoshi, FailReason> {
    let mpp = htlc.mpp.ok_or(FailReason::InvalidPayload)?;
    if mpp.payment_addr != record.data.payment_addr {
        return Err(FailReason::InvalidPayload);
    }

    // Zero-value invoices take their amount from the first accepted part.
    let required = if record.data.value.is_zero() {
        set.set_total.unwrap_or(mpp.total_amount)
    } else {
        record.data.value
    };
    if required.is_zero() || mpp.total_amount != required {
        return Err(FailReason::InvalidPayload);
    }

    if htlc.expiry.saturating_sub(htlc.current_height) <= final_cltv_reject_delta {
        return Err(FailReason::InsufficientCltvDelta);
    }

    Ok(required)
}

#[derive(Debug)]
struct HeldHtlc {
    circuit_key: CircuitKey,
    amount: MilliSatoshi,
    resolver: HtlcResolver,
}

/// HTLCs held for one invoice, pending a settle or fail decision.
#[derive(Debug, Default)]
pub(crate) struct HtlcSet {
    held: Vec<HeldHtlc>,
    total: MilliSatoshi,
    set_total: Option<MilliSatoshi>,
}

impl HtlcSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold an HTLC that passed [`check_htlc`] with the given required amount.
    pub fn hold(&mut self, htlc: &ExitHopHtlc, resolver: HtlcResolver, required: MilliSatoshi) {
        self.set_total.get_or_insert(required);
        self.total += htlc.amount_paid;
        self.held.push(HeldHtlc {
            circuit_key: htlc.circuit_key,
            amount: htlc.amount_paid,
            resolver,
        });
    }

    /// Whether the held amount covers the payment.
    pub fn is_complete(&self) -> bool {
        self.set_total.is_some_and(|required| self.total >= required)
    }

    pub fn total(&self) -> MilliSatoshi {
        self.total
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// Settle every held HTLC with the preimage. Returns how many were resolved.
    pub fn settle_all(&mut self, hash: &PaymentHash, preimage: Preimage) -> usize {
        let held = std::mem::take(&mut self.held);
        let count = held.len();
        for htlc in held {
            tracing::debug!(%hash, circuit = %htlc.circuit_key, amount_msat = htlc.amount.as_u64(), "settling htlc");
            if !htlc.resolver.settle(preimage) {
                tracing::warn!(%hash, circuit = %htlc.circuit_key, "htlc receiver gone before settle");
            }
        }
        count
    }

    /// Fail every held HTLC. Returns how many were resolved.
    pub fn fail_all(&mut self, hash: &PaymentHash, reason: FailReason) -> usize {
        let held = std::mem::take(&mut self.held);
        let count = held.len();
        for htlc in held {
            tracing::debug!(%hash, circuit = %htlc.circuit_key, %reason, "failing htlc");
            if !htlc.resolver.fail(reason) {
                tracing::warn!(%hash, circuit = %htlc.circuit_key, "htlc receiver gone before fail");
            }
        }
        count
    }
}

impl RegistryLoop {
    /// Decide an incoming HTLC. Only persistence failures are returned;
    /// every rejection goes to the HTLC's resolver.
    pub(crate) async fn process_htlc(
        &mut self,
        htlc: ExitHopHtlc,
        resolver: HtlcResolver,
    ) -> Result<(), RegistryError> {
        let hash = htlc.payment_hash;
        let now = self.clock.now();

        // An open invoice past its expiry is expired here rather than
        // waiting for the next scheduler tick.
        let overdue = self.invoices.get(&hash).is_some_and(|entry| {
            entry.record.state == InvoiceState::Open && entry.record.data.expires_at <= now
        });
        if overdue {
            self.expire_invoice(hash).await?;
        }

        let Some(entry) = self.invoices.get_mut(&hash) else {
            reject(&htlc, resolver, FailReason::UnknownOrTerminalInvoice);
            return Ok(());
        };
        if entry.record.state.is_final() {
            reject(&htlc, resolver, FailReason::UnknownOrTerminalInvoice);
            return Ok(());
        }

        let required = match check_htlc(
            &entry.record,
            &entry.htlcs,
            &htlc,
            self.config.final_cltv_reject_delta,
        ) {
            Ok(required) => required,
            Err(reason) => {
                reject(&htlc, resolver, reason);
                return Ok(());
            }
        };

        entry.htlcs.hold(&htlc, resolver, required);
        let state = entry.record.state;
        let auto_settle = entry.record.data.auto_settle;
        let complete = entry.htlcs.is_complete();

        tracing::debug!(
            %hash,
            circuit = %htlc.circuit_key,
            amount_msat = htlc.amount_paid.as_u64(),
            held_msat = entry.htlcs.total().as_u64(),
            required_msat = required.as_u64(),
            "htlc accepted"
        );

        if state == InvoiceState::Open {
            self.commit(hash, InvoiceEvent::Accept, None).await?;
            self.deadlines.cancel(&hash, DeadlineKind::InvoiceExpiry);
            self.deadlines
                .schedule(hash, DeadlineKind::AcceptTimeout, now + self.hold_delta);
        }

        if !complete {
            return Ok(());
        }

        match state {
            InvoiceState::Open | InvoiceState::Accepted => {
                self.commit(hash, InvoiceEvent::RequestSettle, None).await?;
                if auto_settle {
                    self.settle_invoice(hash).await?;
                } else {
                    self.arm_settle_timeout(hash);
                    tracing::info!(%hash, "invoice fully paid, awaiting settle");
                }
            }
            // Parts replayed after a restart of an auto-settle invoice that
            // had already requested settlement.
            InvoiceState::SettleRequested if auto_settle => {
                self.settle_invoice(hash).await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Commit `Settled` and release the preimage to every held HTLC.
    pub(crate) async fn settle_invoice(&mut self, hash: PaymentHash) -> Result<(), RegistryError> {
        self.commit(hash, InvoiceEvent::Settle, None).await?;
        if let Some(entry) = self.invoices.get_mut(&hash) {
            let amount = entry.htlcs.total();
            let preimage = entry.record.data.payment_preimage;
            let count = entry.htlcs.settle_all(&hash, preimage);
            tracing::info!(%hash, htlcs = count, amount_msat = amount.as_u64(), "invoice settled");
        }
        Ok(())
    }

    /// Arm the deadline by which a fully paid hold invoice must be settled.
    fn arm_settle_timeout(&mut self, hash: PaymentHash) {
        let Some(entry) = self.invoices.get(&hash) else {
            return;
        };
        let accepted_at = entry.record.accepted_at.unwrap_or(entry.record.updated_at);
        self.deadlines
            .schedule(hash, DeadlineKind::AcceptTimeout, accepted_at + self.accept_delta);
    }
}

fn reject(htlc: &ExitHopHtlc, resolver: HtlcResolver, reason: FailReason) {
    tracing::warn!(
        hash = %htlc.payment_hash,
        circuit = %htlc.circuit_key,
        amount_msat = htlc.amount_paid.as_u64(),
        %reason,
        "htlc rejected"
    );
    if !resolver.fail(reason) {
        tracing::warn!(hash = %htlc.payment_hash, circuit = %htlc.circuit_key, "htlc receiver gone before fail");
    }
}
