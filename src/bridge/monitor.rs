use std::sync::Arc;
use std::time::Duration;

use super::{unix_now, BalanceObserver, LifecycleEngine};

/// Guard a Quoted invoice's validity window. The task fires once at the
/// deadline; `expire` no-ops if the invoice left the Quoted state first, so
/// acceptance or rejection cancels it for free.
pub fn spawn_quote_timer(engine: Arc<LifecycleEngine>, invoice_id: String) {
    tokio::spawn(async move {
        let deadline = match engine.get(&invoice_id) {
            Ok(invoice) => invoice.quote_expires_at,
            Err(err) => {
                tracing::warn!(invoice_id = %invoice_id, error = %err, "quote timer: lookup failed");
                return;
            }
        };

        sleep_until_unix(deadline + 1).await;

        if let Err(err) = engine.expire(&invoice_id, unix_now()) {
            tracing::warn!(invoice_id = %invoice_id, error = %err, "quote timer: expire failed");
        }
    });
}

/// Start the poller/timer pair for a Monitoring invoice. Exactly one pair
/// per invoice: callers only invoke this when `accept` reports the invoice
/// newly entered Monitoring, or once per invoice on resume.
pub fn spawn_monitor(
    engine: Arc<LifecycleEngine>,
    observer: Arc<dyn BalanceObserver>,
    invoice_id: String,
) {
    spawn_expiry_timer(engine.clone(), invoice_id.clone());
    spawn_poller(engine, observer, invoice_id);
}

fn spawn_expiry_timer(engine: Arc<LifecycleEngine>, invoice_id: String) {
    tokio::spawn(async move {
        let deadline = match engine.get(&invoice_id) {
            Ok(invoice) => match invoice.payment_expires_at {
                Some(at) => at,
                None => {
                    tracing::warn!(invoice_id = %invoice_id, "expiry timer: no payment deadline");
                    return;
                }
            },
            Err(err) => {
                tracing::warn!(invoice_id = %invoice_id, error = %err, "expiry timer: lookup failed");
                return;
            }
        };

        sleep_until_unix(deadline).await;

        if let Err(err) = engine.expire(&invoice_id, unix_now()) {
            tracing::warn!(invoice_id = %invoice_id, error = %err, "expiry timer: expire failed");
        }
    });
}

fn spawn_poller(
    engine: Arc<LifecycleEngine>,
    observer: Arc<dyn BalanceObserver>,
    invoice_id: String,
) {
    tokio::spawn(async move {
        let poll_interval = Duration::from_secs(engine.config().poll_interval_secs);
        let failure_ceiling = engine.config().observer_failure_ceiling;
        let zero_conf_cap = engine.config().zero_conf_cap_pico;

        let mut consecutive_failures: u32 = 0;

        loop {
            let invoice = match engine.get(&invoice_id) {
                Ok(invoice) => invoice,
                Err(err) => {
                    tracing::warn!(invoice_id = %invoice_id, error = %err, "poller: lookup failed");
                    return;
                }
            };
            if invoice.state.is_terminal() {
                tracing::debug!(invoice_id = %invoice_id, state = ?invoice.state, "poller done");
                return;
            }
            let Some(subaddress) = invoice.subaddress else {
                tracing::warn!(invoice_id = %invoice_id, "poller: no subaddress bound");
                return;
            };

            // Small invoices settle against txpool transfers too; larger
            // ones wait for confirmed funds.
            let include_unconfirmed = invoice.xmr_amount_due < zero_conf_cap;

            match observer
                .received_total(subaddress.minor_index, include_unconfirmed)
                .await
            {
                Ok(total_pico) => {
                    consecutive_failures = 0;
                    match engine.record_observation(&invoice_id, total_pico, unix_now()) {
                        Ok(state) if state.is_terminal() => {
                            tracing::debug!(invoice_id = %invoice_id, state = ?state, "poller done");
                            return;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(
                                invoice_id = %invoice_id,
                                error = %err,
                                "poller: recording observation failed"
                            );
                        }
                    }
                    tokio::time::sleep(poll_interval).await;
                }
                Err(err) => {
                    // A failed read changes nothing: the balance stands and
                    // the deadline keeps running. Retry with backoff, and
                    // flag the invoice once failures persist.
                    consecutive_failures += 1;
                    tracing::warn!(
                        invoice_id = %invoice_id,
                        error = %err,
                        consecutive_failures,
                        "poller: balance read failed"
                    );
                    if consecutive_failures == failure_ceiling {
                        if let Err(err) = engine.flag_for_attention(&invoice_id) {
                            tracing::warn!(invoice_id = %invoice_id, error = %err, "poller: flag failed");
                        }
                    }
                    tokio::time::sleep(backoff_delay(consecutive_failures, poll_interval)).await;
                }
            }
        }
    });
}

/// Exponential backoff from one second, capped at the poll interval.
fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let secs = 1u64 << attempt.min(6);
    Duration::from_secs(secs).min(cap)
}

async fn sleep_until_unix(deadline: u64) {
    let now = unix_now();
    if deadline > now {
        tokio::time::sleep(Duration::from_secs(deadline - now)).await;
    }
}
