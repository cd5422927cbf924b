//! The invoice registry and its decision loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lnmux_core::{
    CancelledReason, InvoiceCreationData, InvoiceEvent, InvoiceRecord, InvoiceState,
    InvoiceStateMachine, PaymentHash, StateUpdate,
};
use lnmux_persistence::InvoiceStore;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::commands::{RegistryCommand, Reply};
use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::fanout::{self, FanOut, InvoiceUpdate, SubscriptionHandle};
use crate::htlc::{ExitHopHtlc, FailReason, HtlcResolver};
use crate::scheduler::{DeadlineKind, DeadlineQueue};
use crate::state::InvoiceTable;

/// Registry of invoices payable to this node.
///
/// Construct it with [`InvoiceRegistry::new`], drive it with
/// [`InvoiceRegistry::run`] on a task of its own, and call the remaining
/// methods from anywhere. Calls made before `run` starts are queued; calls
/// made after it returns fail with [`RegistryError::Shutdown`].
pub struct InvoiceRegistry {
    command_tx: mpsc::Sender<RegistryCommand>,
    service: Mutex<Option<RegistryLoop>>,
    config: RegistryConfig,
}

impl InvoiceRegistry {
    pub fn new(
        store: Arc<dyn InvoiceStore>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Result<Self, RegistryError> {
        config.validate()?;
        let (command_tx, commands) = mpsc::channel(config.command_queue_depth);

        let service = RegistryLoop {
            commands,
            store,
            clock,
            invoices: InvoiceTable::new(),
            fanout: FanOut::new(),
            deadlines: DeadlineQueue::new(),
            hold_delta: config.hold_delta()?,
            accept_delta: config.accept_delta()?,
            config: config.clone(),
        };

        Ok(Self {
            command_tx,
            service: Mutex::new(Some(service)),
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Run the decision loop until `cancel` fires.
    ///
    /// Pending invoices are loaded from the store first; those already past
    /// their expiry are cancelled before any command is served. On
    /// cancellation the commands already queued are processed before
    /// returning. A persistence failure stops the loop and is returned.
    ///
    /// The loop can be run once per registry.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RegistryError> {
        let service = self
            .service
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(RegistryError::AlreadyRunning)?;
        service.run(cancel).await
    }

    /// Register a new invoice. It starts `Open` with its expiry armed.
    pub async fn new_invoice(&self, data: InvoiceCreationData) -> Result<(), RegistryError> {
        self.request(|reply| RegistryCommand::NewInvoice { data, reply })
            .await
    }

    /// Subscribe to the state transitions of an invoice.
    ///
    /// If the invoice exists its current state is delivered first. The
    /// invoice does not have to exist yet. `callback` runs on a thread of its
    /// own and may block without holding up the registry, but a subscriber
    /// that falls `subscriber_queue_depth` updates behind is disconnected.
    pub async fn subscribe<F>(
        &self,
        payment_hash: PaymentHash,
        callback: F,
    ) -> Result<SubscriptionHandle, RegistryError>
    where
        F: FnMut(InvoiceUpdate) + Send + 'static,
    {
        let (subscriber, handle) =
            fanout::subscription(payment_hash, self.config.subscriber_queue_depth, callback)?;
        self.request(|reply| RegistryCommand::Subscribe {
            hash: payment_hash,
            subscriber,
            reply,
        })
        .await?;
        Ok(handle)
    }

    /// Hand an incoming HTLC to the registry.
    ///
    /// The decision arrives through `resolver`. If the registry is not
    /// running the HTLC is failed with [`FailReason::Unavailable`].
    pub async fn notify_exit_hop_htlc(&self, htlc: ExitHopHtlc, resolver: HtlcResolver) {
        let command = RegistryCommand::NotifyExitHopHtlc { htlc, resolver };
        if let Err(mpsc::error::SendError(command)) = self.command_tx.send(command).await {
            command.abort();
        }
    }

    /// Settle a fully paid hold invoice, releasing its preimage.
    pub async fn settle(&self, payment_hash: PaymentHash) -> Result<(), RegistryError> {
        self.request(|reply| RegistryCommand::Settle {
            hash: payment_hash,
            reply,
        })
        .await
    }

    /// Cancel an invoice that has not settled, failing any HTLCs it holds.
    pub async fn cancel_invoice(&self, payment_hash: PaymentHash) -> Result<(), RegistryError> {
        self.request(|reply| RegistryCommand::CancelInvoice {
            hash: payment_hash,
            reply,
        })
        .await
    }

    pub async fn lookup_invoice(
        &self,
        payment_hash: PaymentHash,
    ) -> Result<Option<InvoiceUpdate>, RegistryError> {
        self.request(|reply| RegistryCommand::LookupInvoice {
            hash: payment_hash,
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| RegistryError::Shutdown)?;
        rx.await.map_err(|_| RegistryError::Shutdown)?
    }
}

/// State owned by the decision loop. Nothing else touches it.
pub(crate) struct RegistryLoop {
    commands: mpsc::Receiver<RegistryCommand>,
    store: Arc<dyn InvoiceStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) invoices: InvoiceTable,
    fanout: FanOut,
    pub(crate) deadlines: DeadlineQueue,
    pub(crate) config: RegistryConfig,
    pub(crate) hold_delta: chrono::Duration,
    pub(crate) accept_delta: chrono::Duration,
}

impl RegistryLoop {
    async fn run(mut self, cancel: CancellationToken) -> Result<(), RegistryError> {
        tracing::info!("starting invoice registry");

        let result = match self.recover().await {
            Ok(()) => self.event_loop(&cancel).await,
            Err(e) => Err(e),
        };

        let result = match result {
            Ok(()) => self.drain().await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => tracing::info!("invoice registry stopped"),
            Err(e) => {
                tracing::error!(error = %e, "invoice registry stopped on fatal error");
                self.abort_queued();
            }
        }
        if self.invoices.held_htlcs() > 0 {
            tracing::info!(
                htlcs = self.invoices.held_htlcs(),
                "leaving held htlcs unresolved"
            );
        }
        result
    }

    async fn event_loop(&mut self, cancel: &CancellationToken) -> Result<(), RegistryError> {
        tracing::info!(
            invoices = self.invoices.len(),
            deadlines = self.deadlines.len(),
            "entering decision loop"
        );

        loop {
            self.fire_deadlines().await?;
            let wake = self.next_wake();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("shutdown requested");
                    return Ok(());
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await?,
                    None => {
                        tracing::info!("command channel closed");
                        return Ok(());
                    }
                },
                _ = tokio::time::sleep(wake) => {
                    self.fanout.prune();
                }
            }
        }
    }

    /// Refuse new commands and process the ones already queued.
    async fn drain(&mut self) -> Result<(), RegistryError> {
        self.commands.close();
        let mut drained = 0usize;
        while let Some(command) = self.commands.recv().await {
            self.handle_command(command).await?;
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!(commands = drained, "drained queued commands");
        }
        Ok(())
    }

    /// Fail queued HTLCs and drop queued replies after a fatal error.
    fn abort_queued(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.abort();
        }
    }

    fn next_wake(&mut self) -> Duration {
        let tick = self.config.tick_interval();
        match self.deadlines.next_deadline() {
            Some(at) => (at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(tick),
            None => tick,
        }
    }

    /// Handle one command. Only fatal errors are returned; everything else
    /// goes back to the caller.
    async fn handle_command(&mut self, command: RegistryCommand) -> Result<(), RegistryError> {
        tracing::trace!(command = command.name(), "handling command");
        match command {
            RegistryCommand::NewInvoice { data, reply } => {
                let result = self.new_invoice(data).await;
                respond(reply, result)
            }
            RegistryCommand::Subscribe {
                hash,
                subscriber,
                reply,
            } => {
                let result = self.subscribe(hash, subscriber).await;
                respond(reply, result)
            }
            RegistryCommand::NotifyExitHopHtlc { htlc, resolver } => {
                fatal_only(self.process_htlc(htlc, resolver).await)
            }
            RegistryCommand::Settle { hash, reply } => {
                let result = self.settle(hash).await;
                respond(reply, result)
            }
            RegistryCommand::CancelInvoice { hash, reply } => {
                let result = self.cancel_invoice(hash).await;
                respond(reply, result)
            }
            RegistryCommand::LookupInvoice { hash, reply } => {
                let result = self.lookup(hash).await;
                respond(reply, result)
            }
        }
    }

    /// Load pending invoices and re-arm their deadlines.
    async fn recover(&mut self) -> Result<(), RegistryError> {
        let pending = self.store.load_pending().await?;
        let now = self.clock.now();
        let mut expired = Vec::new();

        for record in pending {
            let hash = record.hash;
            let accepted_at = record.accepted_at.unwrap_or(record.updated_at);
            match record.state {
                InvoiceState::Open if record.data.expires_at <= now => expired.push(hash),
                InvoiceState::Open => {
                    self.deadlines
                        .schedule(hash, DeadlineKind::InvoiceExpiry, record.data.expires_at);
                }
                InvoiceState::Accepted => {
                    self.deadlines.schedule(
                        hash,
                        DeadlineKind::AcceptTimeout,
                        accepted_at + self.hold_delta,
                    );
                }
                InvoiceState::SettleRequested => {
                    self.deadlines.schedule(
                        hash,
                        DeadlineKind::AcceptTimeout,
                        accepted_at + self.accept_delta,
                    );
                }
                InvoiceState::Settled | InvoiceState::Cancelled => continue,
            }
            self.invoices.insert(record);
        }

        let expired_count = expired.len();
        for hash in expired {
            self.expire_invoice(hash).await?;
        }

        tracing::info!(
            invoices = self.invoices.len(),
            expired = expired_count,
            "recovered pending invoices"
        );
        Ok(())
    }

    async fn new_invoice(&mut self, data: InvoiceCreationData) -> Result<(), RegistryError> {
        let hash = data.payment_hash();
        if self.invoices.contains(&hash) || self.store.get_invoice(&hash).await?.is_some() {
            return Err(RegistryError::DuplicateInvoice(hash));
        }

        let record = InvoiceRecord::open(data);
        self.store.add_invoice(&record).await?;

        let update = InvoiceUpdate::from_record(&record);
        let expires_at = record.data.expires_at;
        tracing::info!(
            %hash,
            amount_msat = record.data.value.as_u64(),
            auto_settle = record.data.auto_settle,
            %expires_at,
            "invoice created"
        );
        self.invoices.insert(record);
        self.deadlines
            .schedule(hash, DeadlineKind::InvoiceExpiry, expires_at);
        self.fanout.publish(&update);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        hash: PaymentHash,
        subscriber: fanout::Subscriber,
    ) -> Result<(), RegistryError> {
        let snapshot = self.lookup(hash).await?;
        self.fanout.add(hash, subscriber, snapshot);
        Ok(())
    }

    async fn lookup(&self, hash: PaymentHash) -> Result<Option<InvoiceUpdate>, RegistryError> {
        if let Some(entry) = self.invoices.get(&hash) {
            return Ok(Some(InvoiceUpdate::from_record(&entry.record)));
        }
        Ok(self
            .store
            .get_invoice(&hash)
            .await?
            .map(|record| InvoiceUpdate::from_record(&record)))
    }

    async fn current_state(&self, hash: PaymentHash) -> Result<InvoiceState, RegistryError> {
        self.lookup(hash)
            .await?
            .map(|update| update.state)
            .ok_or(RegistryError::UnknownInvoice(hash))
    }

    async fn settle(&mut self, hash: PaymentHash) -> Result<(), RegistryError> {
        let state = self.current_state(hash).await?;
        if state != InvoiceState::SettleRequested {
            return Err(RegistryError::InvalidState { hash, state });
        }
        // After a restart the parts are only in memory once replayed.
        let complete = self
            .invoices
            .get(&hash)
            .is_some_and(|entry| entry.htlcs.is_complete());
        if !complete {
            tracing::warn!(%hash, "settle refused, htlc set not held");
            return Err(RegistryError::HtlcsNotHeld(hash));
        }
        self.settle_invoice(hash).await
    }

    async fn cancel_invoice(&mut self, hash: PaymentHash) -> Result<(), RegistryError> {
        let state = self.current_state(hash).await?;
        if state.is_final() {
            return Err(RegistryError::InvalidState { hash, state });
        }
        let failed = self
            .cancel_with(hash, CancelledReason::External, FailReason::InvoiceCancelled)
            .await?;
        tracing::info!(%hash, htlcs = failed, "invoice cancelled by operator");
        Ok(())
    }

    /// Cancel an invoice still `Open`. Anything else is left alone.
    pub(crate) async fn expire_invoice(&mut self, hash: PaymentHash) -> Result<(), RegistryError> {
        let open = self
            .invoices
            .get(&hash)
            .is_some_and(|entry| entry.record.state == InvoiceState::Open);
        if !open {
            return Ok(());
        }
        self.cancel_with(
            hash,
            CancelledReason::Expired,
            FailReason::UnknownOrTerminalInvoice,
        )
        .await?;
        tracing::info!(%hash, "invoice expired");
        Ok(())
    }

    async fn accept_timeout(&mut self, hash: PaymentHash) -> Result<(), RegistryError> {
        let waiting = self.invoices.get(&hash).is_some_and(|entry| {
            matches!(
                entry.record.state,
                InvoiceState::Accepted | InvoiceState::SettleRequested
            )
        });
        if !waiting {
            return Ok(());
        }
        let failed = self
            .cancel_with(hash, CancelledReason::Timeout, FailReason::Timeout)
            .await?;
        tracing::info!(%hash, htlcs = failed, "invoice accept timeout");
        Ok(())
    }

    /// Commit `Cancelled` and fail every held HTLC. Returns how many failed.
    async fn cancel_with(
        &mut self,
        hash: PaymentHash,
        reason: CancelledReason,
        fail: FailReason,
    ) -> Result<usize, RegistryError> {
        self.commit(hash, InvoiceEvent::Cancel, Some(reason)).await?;
        Ok(self
            .invoices
            .get_mut(&hash)
            .map(|entry| entry.htlcs.fail_all(&hash, fail))
            .unwrap_or(0))
    }

    async fn fire_deadlines(&mut self) -> Result<(), RegistryError> {
        let now = self.clock.now();
        for deadline in self.deadlines.pop_due(now) {
            tracing::debug!(hash = %deadline.hash, kind = ?deadline.kind, at = %deadline.at, "deadline fired");
            let result = match deadline.kind {
                DeadlineKind::InvoiceExpiry => self.expire_invoice(deadline.hash).await,
                DeadlineKind::AcceptTimeout => self.accept_timeout(deadline.hash).await,
            };
            fatal_only(result)?;
        }
        Ok(())
    }

    /// Persist a transition, then apply it and notify subscribers.
    ///
    /// Nothing is observable until the store accepted the update.
    pub(crate) async fn commit(
        &mut self,
        hash: PaymentHash,
        event: InvoiceEvent,
        reason: Option<CancelledReason>,
    ) -> Result<InvoiceState, RegistryError> {
        let now = self.clock.now();
        let (from, update) = {
            let entry = self
                .invoices
                .get(&hash)
                .ok_or(RegistryError::UnknownInvoice(hash))?;
            let from = entry.record.state;
            let to = InvoiceStateMachine::transition(from, event)
                .map_err(|_| RegistryError::InvalidState { hash, state: from })?;
            let update = StateUpdate {
                state: to,
                cancelled_reason: if to == InvoiceState::Cancelled {
                    reason
                } else {
                    None
                },
                accepted_at: if event == InvoiceEvent::Accept {
                    Some(now)
                } else {
                    entry.record.accepted_at
                },
                // A recovered invoice holds nothing until its parts are
                // replayed; keep the persisted amount meanwhile.
                amount_paid: entry.htlcs.total().max(entry.record.amount_paid),
                updated_at: now,
            };
            (from, update)
        };

        if let Err(e) = self.store.persist_transition(&hash, &update).await {
            tracing::error!(%hash, from = %from, to = %update.state, error = %e, "failed to persist invoice transition");
            return Err(e.into());
        }

        let to = update.state;
        let snapshot = match self.invoices.get_mut(&hash) {
            Some(entry) => {
                entry.record.apply(&update);
                InvoiceUpdate::from_record(&entry.record)
            }
            None => return Err(RegistryError::UnknownInvoice(hash)),
        };
        if to.is_final() {
            self.deadlines.cancel_all(&hash);
        }

        tracing::debug!(%hash, from = %from, to = %to, amount_msat = update.amount_paid.as_u64(), "invoice transition");
        let notified = self.fanout.publish(&snapshot);
        if notified > 0 {
            tracing::trace!(%hash, subscribers = notified, "transition published");
        }
        Ok(to)
    }
}

/// Send a command's result back, passing fatal errors on to the loop.
fn respond<T>(reply: Reply<T>, result: Result<T, RegistryError>) -> Result<(), RegistryError> {
    let fatal = match &result {
        Err(e) if e.is_fatal() => Some(e.clone()),
        _ => None,
    };
    let _ = reply.send(result);
    fatal.map_or(Ok(()), Err)
}

fn fatal_only(result: Result<(), RegistryError>) -> Result<(), RegistryError> {
    match result {
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "command failed");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
