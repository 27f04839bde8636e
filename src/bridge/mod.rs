pub mod allocator;
pub mod engine;
pub mod monitor;
pub mod quote;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monero::Subaddress;

pub use allocator::SubaddressAllocator;
pub use engine::LifecycleEngine;
pub use quote::QuoteEngine;
pub use store::SqliteInvoiceStore;

/// Seconds since the unix epoch. All persisted deadlines use this scale so a
/// restart can resume them.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    Quoted,
    Accepted,
    Monitoring,
    Paid,
    Overpaid,
    UnderpaidExpired,
    Expired,
    Rejected,
}

impl InvoiceState {
    /// Terminal states admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvoiceState::Paid
                | InvoiceState::Overpaid
                | InvoiceState::UnderpaidExpired
                | InvoiceState::Expired
                | InvoiceState::Rejected
        )
    }
}

/// The invoice entity. One row in the store, one slot in the engine's
/// registry while live. Amounts are millisatoshi on the Lightning side and
/// piconero on the Monero side; `xmr_amount_due` is fixed at quote time and
/// never recomputed from a later rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: String,
    pub bolt11: String,
    pub payment_hash: String,
    pub description: String,
    pub refund_address: String,

    pub amount_msat: u64,
    pub fee_bps: u32,
    /// Rate the quote was computed at, piconero per satoshi.
    pub rate_pico_per_sat: u64,
    pub xmr_amount_due: u64,

    pub subaddress: Option<Subaddress>,
    /// Monotonically non-decreasing total observed at the subaddress.
    pub observed_balance: u64,

    pub created_at: u64,
    pub quote_expires_at: u64,
    /// Set on acceptance; `None` while the invoice is only quoted.
    pub payment_expires_at: Option<u64>,
    /// Set when a terminal state commits.
    pub terminal_at: Option<u64>,

    pub state: InvoiceState,
    /// Operator-attention flag (persistent observer failures, refunds due).
    pub attention: bool,
    /// Whether the subaddress has been returned to the pool.
    pub released: bool,
}

/// Errors surfaced at the quote/accept boundary. Everything inside the
/// poller and timer loops is handled internally and never reaches callers.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("exchange rate is stale ({age_secs}s old, max {max_age_secs}s)")]
    StaleRate { age_secs: u64, max_age_secs: u64 },
    #[error("quote has expired")]
    QuoteExpired,
    #[error("no subaddress available")]
    PoolExhausted,
    #[error("monero wallet unreachable")]
    ObserverUnavailable,
    #[error("unknown invoice")]
    InvoiceNotFound,
    #[error("invalid lightning invoice: {0}")]
    InvalidInvoice(String),
    #[error("invalid refund address")]
    InvalidRefundAddress,
    #[error("invoice amount exceeds the per-quote limit")]
    AmountTooLarge,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Reports the cumulative amount received at a subaddress. Implemented by
/// the Monero wallet RPC client; mocked in tests.
#[async_trait]
pub trait BalanceObserver: Send + Sync {
    /// Total piconero received at the subaddress with the given minor index.
    /// `include_unconfirmed` extends the count to txpool transfers, used for
    /// small invoices accepted at zero confirmations.
    async fn received_total(&self, minor_index: u32, include_unconfirmed: bool) -> Result<u64>;
}

/// Validates payer-supplied refund addresses against the wallet's network.
#[async_trait]
pub trait AddressValidator: Send + Sync {
    async fn is_valid_address(&self, address: &str) -> Result<bool>;
}

/// Policy knobs for the bridge core. Populated from the binary's flags.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Markup applied at quote time, basis points (200 = 2%).
    pub fee_bps: u32,
    /// Validity window of an unaccepted quote, seconds.
    pub quote_ttl_secs: u64,
    /// Settlement window starting at acceptance, seconds.
    pub payment_ttl_secs: u64,
    /// A rate observation older than this cannot back a quote.
    pub max_rate_age_secs: u64,
    /// Fixed tolerance below the amount due that still counts as paid in
    /// full, piconero.
    pub epsilon_pico: u64,
    /// Decimal places the amount due is quantized (upward) to, 0..=12.
    pub display_precision: u32,
    /// Largest Lightning invoice the bridge will quote, millisatoshi.
    pub max_amount_msat: u64,
    /// Invoices due less than this settle against unconfirmed transfers.
    pub zero_conf_cap_pico: u64,
    /// Reconciliation poll cadence, seconds.
    pub poll_interval_secs: u64,
    /// Consecutive observer failures before the invoice is flagged.
    pub observer_failure_ceiling: u32,
    /// Delay between a settled terminal state and subaddress release.
    pub release_grace_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fee_bps: 200,
            quote_ttl_secs: 120,
            payment_ttl_secs: 1_200,
            max_rate_age_secs: 60,
            epsilon_pico: 10_000_000,
            display_precision: 12,
            max_amount_msat: 150_000_000,
            zero_conf_cap_pico: 250_000_000_000,
            poll_interval_secs: 30,
            observer_failure_ceiling: 10,
            release_grace_secs: 3_600,
        }
    }
}
