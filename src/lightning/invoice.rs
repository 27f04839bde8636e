use std::str::FromStr as _;

use anyhow::Result;
use bitcoin::hashes::Hash as _;
use lightning_invoice::{Bolt11Invoice, Bolt11InvoiceDescriptionRef};
use serde::{Deserialize, Serialize};

/// The fields of a BOLT11 invoice the bridge needs, extracted once at quote
/// time. The raw invoice string is kept verbatim for display and records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedInvoice {
    pub bolt11: String,
    pub payment_hash: String,
    pub amount_msat: u64,
    pub description: String,
}

pub fn decode_invoice(bolt11: &str) -> Result<DecodedInvoice> {
    let invoice = Bolt11Invoice::from_str(bolt11)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;

    let amount_msat = invoice
        .amount_milli_satoshis()
        .ok_or_else(|| anyhow::anyhow!("invoice carries no amount"))?;

    let description = match invoice.description() {
        Bolt11InvoiceDescriptionRef::Direct(d) => d.to_string(),
        Bolt11InvoiceDescriptionRef::Hash(_) => String::new(),
    };

    Ok(DecodedInvoice {
        bolt11: bolt11.to_string(),
        payment_hash: hex::encode(invoice.payment_hash().to_byte_array()),
        amount_msat,
        description,
    })
}
