use std::sync::Arc;

use crate::rate::{ExchangeRate, RateProvider};

use super::{unix_now, BridgeError};

/// Outcome of a quote: the amount due and the rate it was computed at. The
/// lifecycle engine applies it; the quote engine itself mutates nothing.
#[derive(Debug, Clone)]
pub struct QuoteOutcome {
    pub xmr_amount_due: u64,
    pub rate: ExchangeRate,
}

pub struct QuoteEngine {
    provider: Arc<dyn RateProvider>,
    fee_bps: u32,
    max_rate_age_secs: u64,
    display_precision: u32,
}

impl QuoteEngine {
    pub fn new(
        provider: Arc<dyn RateProvider>,
        fee_bps: u32,
        max_rate_age_secs: u64,
        display_precision: u32,
    ) -> Self {
        Self {
            provider,
            fee_bps,
            max_rate_age_secs,
            display_precision,
        }
    }

    /// Convert a Lightning amount into the XMR amount due, fee included.
    pub async fn quote(&self, amount_msat: u64) -> Result<QuoteOutcome, BridgeError> {
        let rate = self.provider.current_rate().await?;

        let now = unix_now();
        if rate.is_stale(now, self.max_rate_age_secs) {
            return Err(BridgeError::StaleRate {
                age_secs: rate.age_secs(now),
                max_age_secs: self.max_rate_age_secs,
            });
        }

        let xmr_amount_due = xmr_due_pico(
            amount_msat,
            rate.pico_per_sat,
            self.fee_bps,
            self.display_precision,
        )
        .ok_or_else(|| anyhow::anyhow!("quote overflow: {amount_msat} msat"))?;

        Ok(QuoteOutcome {
            xmr_amount_due,
            rate,
        })
    }
}

/// Amount due in piconero for `amount_msat` at `pico_per_sat`, marked up by
/// `fee_bps` and quantized upward to `display_precision` decimal places.
/// Every division rounds up, so the result never under-collects the fee.
/// `None` on overflow.
pub fn xmr_due_pico(
    amount_msat: u64,
    pico_per_sat: u64,
    fee_bps: u32,
    display_precision: u32,
) -> Option<u64> {
    let sats = div_ceil_u128(amount_msat as u128, 1_000);
    let base = sats.checked_mul(pico_per_sat as u128)?;
    let with_fee = div_ceil_u128(base.checked_mul(10_000 + fee_bps as u128)?, 10_000);

    let granularity = 10u128.checked_pow(12u32.checked_sub(display_precision.min(12))?)?;
    let quantized = div_ceil_u128(with_fee, granularity).checked_mul(granularity)?;

    u64::try_from(quantized).ok()
}

fn div_ceil_u128(n: u128, d: u128) -> u128 {
    (n + d - 1) / d
}
