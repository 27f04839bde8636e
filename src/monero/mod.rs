pub mod rpc;

use serde::{Deserialize, Serialize};

pub use rpc::MoneroRpcClient;

/// Piconero per XMR (atomic units, 10^12).
pub const PICO_PER_XMR: u64 = 1_000_000_000_000;

/// A wallet subaddress together with its minor index in account 0. The index
/// is what the wallet RPC keys transfer queries and sweeps on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subaddress {
    pub address: String,
    pub minor_index: u32,
}

/// Render a piconero amount as a decimal XMR string with all 12 fractional
/// digits, the form wallet software expects in payment URIs.
pub fn format_xmr(pico: u64) -> String {
    format!("{}.{:012}", pico / PICO_PER_XMR, pico % PICO_PER_XMR)
}

/// `monero:<address>?tx_amount=<xmr>` payment URI; the amount is omitted
/// when `None`.
pub fn payment_uri(address: &str, amount_pico: Option<u64>) -> String {
    match amount_pico {
        Some(pico) => format!("monero:{address}?tx_amount={}", format_xmr(pico)),
        None => format!("monero:{address}"),
    }
}
