use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use uuid::Uuid;

use crate::lightning::decode_invoice;

use super::quote::QuoteEngine;
use super::store::SqliteInvoiceStore;
use super::{
    unix_now, AddressValidator, BridgeConfig, BridgeError, InvoiceRecord, InvoiceState,
    SubaddressAllocator,
};

/// Owns the invoice state machine. Every mutation of a single invoice goes
/// through its slot mutex, so at most one transition commits at a time and
/// terminal states are checked before anything is applied. Poller and timer
/// tasks call back into `record_observation` and `expire`; user actions come
/// in through `create_quote`, `accept` and `reject`. A slot is dropped from
/// the registry once its invoice is terminal and holds no subaddress; the
/// store keeps serving the record after that.
pub struct LifecycleEngine {
    cfg: BridgeConfig,
    quotes: QuoteEngine,
    allocator: Arc<SubaddressAllocator>,
    validator: Arc<dyn AddressValidator>,
    store: Arc<Mutex<SqliteInvoiceStore>>,
    invoices: Mutex<HashMap<String, Arc<Mutex<InvoiceRecord>>>>,
}

/// In-flight invoices found in the store at startup, so the caller can
/// re-arm their timers and pollers.
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub quoted: Vec<String>,
    pub monitoring: Vec<String>,
}

impl LifecycleEngine {
    pub fn new(
        cfg: BridgeConfig,
        quotes: QuoteEngine,
        allocator: Arc<SubaddressAllocator>,
        validator: Arc<dyn AddressValidator>,
        store: Arc<Mutex<SqliteInvoiceStore>>,
    ) -> Self {
        Self {
            cfg,
            quotes,
            allocator,
            validator,
            store,
            invoices: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    pub fn allocator(&self) -> &Arc<SubaddressAllocator> {
        &self.allocator
    }

    /// Decode a Lightning invoice, price it at the current rate and persist
    /// the resulting quote. The quote is valid until `quote_expires_at`;
    /// nothing is allocated yet.
    pub async fn create_quote(
        &self,
        bolt11: &str,
        refund_address: &str,
    ) -> Result<InvoiceRecord, BridgeError> {
        let decoded =
            decode_invoice(bolt11).map_err(|e| BridgeError::InvalidInvoice(format!("{e:#}")))?;

        if decoded.amount_msat > self.cfg.max_amount_msat {
            return Err(BridgeError::AmountTooLarge);
        }

        match self.validator.is_valid_address(refund_address).await {
            Ok(true) => {}
            Ok(false) => return Err(BridgeError::InvalidRefundAddress),
            // The wallet RPC backs both validation and balance reads; if it
            // cannot be reached there is no point issuing a quote.
            Err(err) => {
                tracing::warn!(error = %err, "refund address validation unreachable");
                return Err(BridgeError::ObserverUnavailable);
            }
        }

        let outcome = self.quotes.quote(decoded.amount_msat).await?;

        let now = unix_now();
        let record = InvoiceRecord {
            id: Uuid::new_v4().to_string(),
            bolt11: decoded.bolt11,
            payment_hash: decoded.payment_hash,
            description: decoded.description,
            refund_address: refund_address.to_string(),
            amount_msat: decoded.amount_msat,
            fee_bps: self.cfg.fee_bps,
            rate_pico_per_sat: outcome.rate.pico_per_sat,
            xmr_amount_due: outcome.xmr_amount_due,
            subaddress: None,
            observed_balance: 0,
            created_at: now,
            quote_expires_at: now + self.cfg.quote_ttl_secs,
            payment_expires_at: None,
            terminal_at: None,
            state: InvoiceState::Quoted,
            attention: false,
            released: false,
        };

        self.store
            .lock()
            .expect("store mutex poisoned")
            .insert_invoice(&record)
            .context("persist quote")?;

        self.invoices
            .lock()
            .expect("invoice registry poisoned")
            .insert(record.id.clone(), Arc::new(Mutex::new(record.clone())));

        tracing::info!(
            invoice_id = %record.id,
            amount_msat = record.amount_msat,
            xmr_amount_due = record.xmr_amount_due,
            rate_pico_per_sat = record.rate_pico_per_sat,
            "quoted lightning invoice"
        );

        Ok(record)
    }

    /// Accept a quote: bind a subaddress and open the settlement window.
    /// Idempotent: a second accept returns the same subaddress and amount
    /// without allocating again. The boolean is true when the invoice newly
    /// entered Monitoring and needs its poller and timer started.
    pub fn accept(&self, id: &str, now: u64) -> Result<(InvoiceRecord, bool), BridgeError> {
        let Some(slot) = self.slot(id) else {
            // Evicted slots are terminal; report them from the store.
            let record = self.stored(id)?;
            return match record.state {
                InvoiceState::Paid | InvoiceState::Overpaid | InvoiceState::UnderpaidExpired => {
                    Ok((record, false))
                }
                _ => Err(BridgeError::QuoteExpired),
            };
        };
        let mut invoice = slot.lock().expect("invoice mutex poisoned");

        match invoice.state {
            InvoiceState::Accepted | InvoiceState::Monitoring => Ok((invoice.clone(), false)),
            InvoiceState::Quoted if now > invoice.quote_expires_at => Err(BridgeError::QuoteExpired),
            InvoiceState::Quoted => {
                // Persist the intent before touching the pool; a crash here
                // resumes as a plain re-acceptable quote.
                invoice.state = InvoiceState::Accepted;
                self.persist_state(&invoice)?;

                let subaddress = match self.allocator.allocate() {
                    Ok(sub) => sub,
                    Err(e) => {
                        invoice.state = InvoiceState::Quoted;
                        self.persist_state(&invoice)?;
                        return Err(e);
                    }
                };

                invoice.subaddress = Some(subaddress.clone());
                invoice.payment_expires_at = Some(now + self.cfg.payment_ttl_secs);
                invoice.state = InvoiceState::Monitoring;

                self.store
                    .lock()
                    .expect("store mutex poisoned")
                    .set_monitoring(&invoice.id, &subaddress, now + self.cfg.payment_ttl_secs)
                    .context("persist acceptance")?;

                tracing::info!(
                    invoice_id = %invoice.id,
                    subaddress_index = subaddress.minor_index,
                    payment_expires_at = now + self.cfg.payment_ttl_secs,
                    "accepted quote, monitoring subaddress"
                );

                Ok((invoice.clone(), true))
            }
            // A settled invoice has nothing left to accept; report it as is.
            InvoiceState::Paid | InvoiceState::Overpaid | InvoiceState::UnderpaidExpired => {
                Ok((invoice.clone(), false))
            }
            InvoiceState::Rejected | InvoiceState::Expired => Err(BridgeError::QuoteExpired),
        }
    }

    /// Reject a quote. A no-op on any terminal state, and on an invoice the
    /// payer already accepted.
    pub fn reject(&self, id: &str, now: u64) -> Result<InvoiceState, BridgeError> {
        let Some(slot) = self.slot(id) else {
            // Already terminal and evicted; rejecting stays a no-op.
            return self.stored(id).map(|record| record.state);
        };
        let mut invoice = slot.lock().expect("invoice mutex poisoned");

        if invoice.state == InvoiceState::Quoted {
            invoice.state = InvoiceState::Rejected;
            invoice.terminal_at = Some(now);
            self.persist_state(&invoice)?;
            tracing::info!(invoice_id = %invoice.id, "quote rejected");
        }
        let state = invoice.state;
        drop(invoice);

        // A rejected quote never held a subaddress; its slot can go now.
        if state == InvoiceState::Rejected {
            self.evict_slot(id);
        }
        Ok(state)
    }

    /// Feed one balance observation from the poller. The stored balance only
    /// ever moves up; a settling balance commits Paid or Overpaid while the
    /// invoice is still Monitoring, even in the same instant the deadline
    /// passes. A satisfied payment always beats expiry.
    pub fn record_observation(
        &self,
        id: &str,
        total_pico: u64,
        now: u64,
    ) -> Result<InvoiceState, BridgeError> {
        let Some(slot) = self.slot(id) else {
            return self.stored(id).map(|record| record.state);
        };
        let mut invoice = slot.lock().expect("invoice mutex poisoned");

        if invoice.state.is_terminal() {
            return Ok(invoice.state);
        }

        if total_pico > invoice.observed_balance {
            invoice.observed_balance = total_pico;
            self.store
                .lock()
                .expect("store mutex poisoned")
                .update_observed_balance(&invoice.id, total_pico)
                .context("persist observed balance")?;
        }

        if invoice.state == InvoiceState::Monitoring {
            if let Some(settled) = settle_verdict(
                invoice.observed_balance,
                invoice.xmr_amount_due,
                self.cfg.epsilon_pico,
            ) {
                invoice.state = settled;
                invoice.terminal_at = Some(now);
                self.persist_state(&invoice)?;
                tracing::info!(
                    invoice_id = %invoice.id,
                    observed_balance = invoice.observed_balance,
                    xmr_amount_due = invoice.xmr_amount_due,
                    state = ?settled,
                    "payment settled"
                );
            }
        }

        Ok(invoice.state)
    }

    /// Apply a deadline. While Quoted this voids the quote; while Monitoring
    /// the last observed balance is re-checked first so a payment that has
    /// already arrived is never lost to a clock race.
    pub fn expire(&self, id: &str, now: u64) -> Result<InvoiceState, BridgeError> {
        let Some(slot) = self.slot(id) else {
            return self.stored(id).map(|record| record.state);
        };
        let mut invoice = slot.lock().expect("invoice mutex poisoned");

        match invoice.state {
            InvoiceState::Quoted if now > invoice.quote_expires_at => {
                invoice.state = InvoiceState::Expired;
                invoice.terminal_at = Some(now);
                self.persist_state(&invoice)?;
                tracing::info!(invoice_id = %invoice.id, "quote expired");
            }
            InvoiceState::Monitoring
                if invoice.payment_expires_at.is_some_and(|at| now >= at) =>
            {
                let verdict = settle_verdict(
                    invoice.observed_balance,
                    invoice.xmr_amount_due,
                    self.cfg.epsilon_pico,
                );

                match verdict {
                    Some(settled) => {
                        invoice.state = settled;
                    }
                    None if invoice.observed_balance == 0 => {
                        invoice.state = InvoiceState::Expired;
                    }
                    None => {
                        invoice.state = InvoiceState::UnderpaidExpired;
                        invoice.attention = true;
                    }
                }
                invoice.terminal_at = Some(now);
                self.persist_state(&invoice)?;
                if invoice.attention {
                    self.store
                        .lock()
                        .expect("store mutex poisoned")
                        .set_attention(&invoice.id)
                        .context("persist attention flag")?;
                }

                tracing::info!(
                    invoice_id = %invoice.id,
                    observed_balance = invoice.observed_balance,
                    xmr_amount_due = invoice.xmr_amount_due,
                    state = ?invoice.state,
                    "payment deadline reached"
                );

                // Nothing ever arrived, so no late funds can be
                // misattributed: the subaddress goes straight back.
                if invoice.state == InvoiceState::Expired {
                    self.release_subaddress(&mut invoice)?;
                }
            }
            _ => {}
        }

        let state = invoice.state;
        let done = state.is_terminal() && (invoice.released || invoice.subaddress.is_none());
        drop(invoice);
        if done {
            self.evict_slot(id);
        }
        Ok(state)
    }

    /// Mark an invoice for operator attention without touching its state.
    pub fn flag_for_attention(&self, id: &str) -> Result<(), BridgeError> {
        let slot = self.slot(id).ok_or(BridgeError::InvoiceNotFound)?;
        let mut invoice = slot.lock().expect("invoice mutex poisoned");
        if !invoice.attention {
            invoice.attention = true;
            self.store
                .lock()
                .expect("store mutex poisoned")
                .set_attention(&invoice.id)
                .context("persist attention flag")?;
            tracing::warn!(invoice_id = %invoice.id, "invoice flagged for operator attention");
        }
        Ok(())
    }

    /// Return a settled invoice's subaddress to the pool once its grace
    /// period is over (the release worker drives this).
    pub fn release_settled(&self, id: &str) -> Result<(), BridgeError> {
        let slot = self.slot(id).ok_or(BridgeError::InvoiceNotFound)?;
        let mut invoice = slot.lock().expect("invoice mutex poisoned");
        if !invoice.state.is_terminal() {
            return Err(BridgeError::Internal(anyhow::anyhow!(
                "release before terminal state: {}",
                invoice.id
            )));
        }
        self.release_subaddress(&mut invoice)?;
        drop(invoice);
        self.evict_slot(id);
        Ok(())
    }

    /// Current snapshot of an invoice, for views. Falls back to the store
    /// for invoices that predate this process.
    pub fn get(&self, id: &str) -> Result<InvoiceRecord, BridgeError> {
        if let Some(slot) = self.slot(id) {
            return Ok(slot.lock().expect("invoice mutex poisoned").clone());
        }
        self.stored(id)
    }

    /// Number of invoices currently held in memory.
    pub fn live_slots(&self) -> usize {
        self.invoices
            .lock()
            .expect("invoice registry poisoned")
            .len()
    }

    /// Reload in-flight invoices after a restart. An invoice caught mid-
    /// accept (Accepted, no subaddress committed) drops back to Quoted and
    /// can be accepted again.
    pub fn resume(&self) -> Result<ResumeReport> {
        let in_flight = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .list_in_flight()
            .context("list in-flight invoices")?;

        let mut report = ResumeReport::default();
        let mut resumed = Vec::with_capacity(in_flight.len());

        for mut record in in_flight {
            if record.state == InvoiceState::Accepted {
                record.state = InvoiceState::Quoted;
                self.store
                    .lock()
                    .expect("store mutex poisoned")
                    .update_state(&record.id, InvoiceState::Quoted, None)
                    .context("revert interrupted accept")?;
            }

            match record.state {
                InvoiceState::Quoted => report.quoted.push(record.id.clone()),
                InvoiceState::Monitoring => {
                    // Its subaddress is still bound; the pool must not hand
                    // it out again.
                    if let Some(sub) = &record.subaddress {
                        self.allocator.mark_loaned(sub);
                    }
                    report.monitoring.push(record.id.clone());
                }
                _ => {}
            }

            resumed.push(record);
        }

        let mut registry = self.invoices.lock().expect("invoice registry poisoned");
        for record in resumed {
            registry.insert(record.id.clone(), Arc::new(Mutex::new(record)));
        }
        drop(registry);

        tracing::info!(
            quoted = report.quoted.len(),
            monitoring = report.monitoring.len(),
            "resumed in-flight invoices"
        );
        Ok(report)
    }

    fn release_subaddress(&self, invoice: &mut InvoiceRecord) -> Result<()> {
        if invoice.released {
            return Ok(());
        }
        if let Some(sub) = invoice.subaddress.clone() {
            self.allocator.release(sub.clone());
            invoice.released = true;
            self.store
                .lock()
                .expect("store mutex poisoned")
                .mark_released(&invoice.id)
                .context("persist release")?;
            tracing::info!(
                invoice_id = %invoice.id,
                subaddress_index = sub.minor_index,
                "subaddress released"
            );
        }
        Ok(())
    }

    fn persist_state(&self, invoice: &InvoiceRecord) -> Result<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .update_state(&invoice.id, invoice.state, invoice.terminal_at)
            .context("persist state transition")
    }

    fn slot(&self, id: &str) -> Option<Arc<Mutex<InvoiceRecord>>> {
        self.invoices
            .lock()
            .expect("invoice registry poisoned")
            .get(id)
            .cloned()
    }

    fn stored(&self, id: &str) -> Result<InvoiceRecord, BridgeError> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .get_invoice(id)
            .context("load invoice")?
            .ok_or(BridgeError::InvoiceNotFound)
    }

    /// Drop a terminal invoice's slot. Callers only do this once the state
    /// is terminal and no subaddress remains bound, so nothing can mutate
    /// the record afterwards and `get` keeps serving it from the store.
    fn evict_slot(&self, id: &str) {
        self.invoices
            .lock()
            .expect("invoice registry poisoned")
            .remove(id);
        tracing::debug!(invoice_id = %id, "invoice slot dropped");
    }
}

/// Settlement verdict for an observed balance, or `None` while the amount
/// still falls short by more than epsilon.
fn settle_verdict(balance: u64, due: u64, epsilon: u64) -> Option<InvoiceState> {
    if balance.saturating_add(epsilon) >= due {
        if balance > due.saturating_add(epsilon) {
            Some(InvoiceState::Overpaid)
        } else {
            Some(InvoiceState::Paid)
        }
    } else {
        None
    }
}
