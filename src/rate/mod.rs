pub mod http;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpRateProvider;

/// Piconero per satoshi. One full XMR-per-BTC unit is 10^4 in this scale
/// (10^12 piconero over 10^8 sat), so 150 XMR/BTC is 1_500_000.
pub const PICO_PER_SAT_PER_XMR_BTC: u64 = 10_000;

/// A BTC->XMR conversion rate observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub pair: String,
    /// Piconero received per satoshi converted.
    pub pico_per_sat: u64,
    /// Unix seconds at which the rate was observed.
    pub observed_at: u64,
}

impl ExchangeRate {
    pub fn xmr_per_btc(pico_per_sat: u64, observed_at: u64) -> Self {
        Self {
            pair: "XMR/BTC".to_string(),
            pico_per_sat,
            observed_at,
        }
    }

    /// Whether the observation is older than `max_age_secs` at `now`.
    pub fn is_stale(&self, now: u64, max_age_secs: u64) -> bool {
        now.saturating_sub(self.observed_at) > max_age_secs
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.observed_at)
    }
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    /// Fetch the current BTC->XMR rate. A failed or timed-out fetch is
    /// retryable; callers must not treat it as fatal to an invoice.
    async fn current_rate(&self) -> Result<ExchangeRate>;
}
