pub mod invoice;

pub use invoice::{decode_invoice, DecodedInvoice};
