use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::bridge::monitor::{spawn_monitor, spawn_quote_timer};
use crate::bridge::{
    unix_now, BalanceObserver, BridgeError, InvoiceRecord, InvoiceState, LifecycleEngine,
};
use crate::monero::{format_xmr, payment_uri};

/// Millisatoshi per BTC, for display formatting.
const MSAT_PER_BTC: u64 = 100_000_000_000;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LifecycleEngine>,
    pub observer: Arc<dyn BalanceObserver>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    Router::new()
        .route("/quote", post(create_quote))
        .route("/invoice", post(accept_invoice))
        .route("/reject_rate", post(reject_rate))
        .route("/checking/:id", get(checking))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    pub bolt11: String,
    pub refund_address: String,
}

#[derive(Debug, Serialize)]
pub struct QuoteView {
    pub id: String,
    /// The raw invoice plus its description, the lines the payer reviews.
    pub invoice_lines: Vec<String>,
    pub refund_address: String,
    pub amount_btc: String,
    pub xmr_amount_with_fee: String,
    pub quote_expires_at: u64,
}

#[derive(Debug, Deserialize)]
pub struct InvoiceActionRequest {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct RejectView {
    pub id: String,
    pub state: InvoiceState,
}

/// The polling view the client re-requests every 30 seconds until the
/// invoice reaches a terminal state. Everything is read from the entity;
/// nothing is recomputed from a live rate.
#[derive(Debug, Serialize)]
pub struct CheckingView {
    pub id: String,
    pub state: InvoiceState,
    pub remaining_minutes: u64,
    pub remaining_seconds: u64,
    pub subaddress: Option<String>,
    pub monero_uri: Option<String>,
    pub xmr_amount_due: String,
    pub observed_balance: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::StaleRate { .. }
            | BridgeError::PoolExhausted
            | BridgeError::ObserverUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::QuoteExpired => StatusCode::GONE,
            BridgeError::InvoiceNotFound => StatusCode::NOT_FOUND,
            BridgeError::InvalidInvoice(_)
            | BridgeError::InvalidRefundAddress
            | BridgeError::AmountTooLarge => StatusCode::BAD_REQUEST,
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn create_quote(
    State(state): State<AppState>,
    Json(req): Json<QuoteRequest>,
) -> Result<Json<QuoteView>, ApiError> {
    let record = state
        .engine
        .create_quote(&req.bolt11, &req.refund_address)
        .await?;

    spawn_quote_timer(state.engine.clone(), record.id.clone());

    Ok(Json(quote_view(&record)))
}

async fn accept_invoice(
    State(state): State<AppState>,
    Json(req): Json<InvoiceActionRequest>,
) -> Result<Json<CheckingView>, ApiError> {
    let (record, newly_monitoring) = state.engine.accept(&req.id, unix_now())?;

    if newly_monitoring {
        spawn_monitor(state.engine.clone(), state.observer.clone(), record.id.clone());
    }

    Ok(Json(checking_view(&record, unix_now())))
}

async fn reject_rate(
    State(state): State<AppState>,
    Json(req): Json<InvoiceActionRequest>,
) -> Result<Json<RejectView>, ApiError> {
    let state_now = state.engine.reject(&req.id, unix_now())?;
    Ok(Json(RejectView {
        id: req.id,
        state: state_now,
    }))
}

async fn checking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CheckingView>, ApiError> {
    let record = state.engine.get(&id)?;
    Ok(Json(checking_view(&record, unix_now())))
}

fn quote_view(record: &InvoiceRecord) -> QuoteView {
    let mut invoice_lines = vec![record.bolt11.clone()];
    if !record.description.is_empty() {
        invoice_lines.push(record.description.clone());
    }

    QuoteView {
        id: record.id.clone(),
        invoice_lines,
        refund_address: record.refund_address.clone(),
        amount_btc: format_btc(record.amount_msat),
        xmr_amount_with_fee: format_xmr(record.xmr_amount_due),
        quote_expires_at: record.quote_expires_at,
    }
}

fn checking_view(record: &InvoiceRecord, now: u64) -> CheckingView {
    let remaining = record
        .payment_expires_at
        .map(|at| at.saturating_sub(now))
        .unwrap_or(0);

    CheckingView {
        id: record.id.clone(),
        state: record.state,
        remaining_minutes: remaining / 60,
        remaining_seconds: remaining % 60,
        subaddress: record.subaddress.as_ref().map(|s| s.address.clone()),
        monero_uri: record
            .subaddress
            .as_ref()
            .map(|s| payment_uri(&s.address, Some(record.xmr_amount_due))),
        xmr_amount_due: format_xmr(record.xmr_amount_due),
        observed_balance: format_xmr(record.observed_balance),
    }
}

fn format_btc(amount_msat: u64) -> String {
    format!(
        "{}.{:011}",
        amount_msat / MSAT_PER_BTC,
        amount_msat % MSAT_PER_BTC
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monero::Subaddress;

    fn record() -> InvoiceRecord {
        InvoiceRecord {
            id: "inv-1".to_string(),
            bolt11: "lnbc1m...".to_string(),
            payment_hash: "00".repeat(32),
            description: "coffee".to_string(),
            refund_address: "4Refund".to_string(),
            amount_msat: 100_000_000,
            fee_bps: 200,
            rate_pico_per_sat: 1_500_000,
            xmr_amount_due: 153_000_000_000,
            subaddress: Some(Subaddress {
                address: "8Sub".to_string(),
                minor_index: 7,
            }),
            observed_balance: 0,
            created_at: 1_000,
            quote_expires_at: 1_120,
            payment_expires_at: Some(1_695),
            terminal_at: None,
            state: InvoiceState::Monitoring,
            attention: false,
            released: false,
        }
    }

    #[test]
    fn checking_view_counts_down_and_floors_at_zero() {
        let view = checking_view(&record(), 1_000);
        assert_eq!(view.remaining_minutes, 11);
        assert_eq!(view.remaining_seconds, 35);
        assert_eq!(
            view.monero_uri.as_deref(),
            Some("monero:8Sub?tx_amount=0.153000000000")
        );

        let view = checking_view(&record(), 2_000);
        assert_eq!(view.remaining_minutes, 0);
        assert_eq!(view.remaining_seconds, 0);
    }

    #[test]
    fn quote_view_carries_entity_amounts_verbatim() {
        let view = quote_view(&record());
        assert_eq!(view.amount_btc, "0.00100000000");
        assert_eq!(view.xmr_amount_with_fee, "0.153000000000");
        assert_eq!(view.invoice_lines, vec!["lnbc1m...", "coffee"]);
    }
}
