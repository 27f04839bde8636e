use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::bridge::unix_now;

use super::{ExchangeRate, RateProvider, PICO_PER_SAT_PER_XMR_BTC};

/// One row of the ticker document: a currency symbol and its current price
/// in a common quote currency (which one does not matter, the bridge only
/// uses the xmr/btc ratio).
#[derive(Debug, Deserialize)]
struct TickerRow {
    symbol: String,
    current_price: f64,
}

/// Rate provider backed by an HTTP ticker endpoint returning a JSON array of
/// `{symbol, current_price}` rows covering at least "btc" and "xmr".
pub struct HttpRateProvider {
    client: reqwest::Client,
    ticker_url: String,
}

impl HttpRateProvider {
    pub fn new(ticker_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build rate provider http client")?;
        Ok(Self { client, ticker_url })
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn current_rate(&self) -> Result<ExchangeRate> {
        let rows: Vec<TickerRow> = self
            .client
            .get(&self.ticker_url)
            .send()
            .await
            .context("fetch ticker")?
            .error_for_status()
            .context("ticker status")?
            .json()
            .await
            .context("decode ticker json")?;

        let pico_per_sat = pico_per_sat_from_ticker(&rows)?;
        Ok(ExchangeRate::xmr_per_btc(pico_per_sat, unix_now()))
    }
}

fn pico_per_sat_from_ticker(rows: &[TickerRow]) -> Result<u64> {
    let price_of = |symbol: &str| {
        rows.iter()
            .find(|r| r.symbol.eq_ignore_ascii_case(symbol))
            .map(|r| r.current_price)
    };

    let btc = price_of("btc").context("ticker is missing btc")?;
    let xmr = price_of("xmr").context("ticker is missing xmr")?;
    anyhow::ensure!(btc > 0.0 && xmr > 0.0, "non-positive ticker price");

    let xmr_per_btc = btc / xmr;
    let pico_per_sat = (xmr_per_btc * PICO_PER_SAT_PER_XMR_BTC as f64).round();
    anyhow::ensure!(
        pico_per_sat.is_finite() && pico_per_sat >= 1.0 && pico_per_sat <= u64::MAX as f64,
        "rate out of range: {xmr_per_btc} XMR/BTC"
    );
    Ok(pico_per_sat as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(symbol: &str, price: f64) -> TickerRow {
        TickerRow {
            symbol: symbol.to_string(),
            current_price: price,
        }
    }

    #[test]
    fn ratio_from_ticker_rows() {
        // 60_000 / 400 = 150 XMR per BTC.
        let rows = vec![row("btc", 60_000.0), row("eth", 2_500.0), row("xmr", 400.0)];
        assert_eq!(pico_per_sat_from_ticker(&rows).unwrap(), 1_500_000);
    }

    #[test]
    fn missing_symbol_is_an_error() {
        let rows = vec![row("btc", 60_000.0)];
        assert!(pico_per_sat_from_ticker(&rows).is_err());
    }

    #[test]
    fn zero_price_is_an_error() {
        let rows = vec![row("btc", 60_000.0), row("xmr", 0.0)];
        assert!(pico_per_sat_from_ticker(&rows).is_err());
    }
}
