use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser as _;

use ln_xmr_bridge::bridge::monitor::{spawn_monitor, spawn_quote_timer};
use ln_xmr_bridge::bridge::{
    unix_now, BridgeConfig, InvoiceState, LifecycleEngine, QuoteEngine, SqliteInvoiceStore,
    SubaddressAllocator,
};
use ln_xmr_bridge::http::{router, AppState};
use ln_xmr_bridge::monero::MoneroRpcClient;
use ln_xmr_bridge::rate::HttpRateProvider;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:5555")]
    listen_addr: String,

    #[arg(long, default_value = "http://127.0.0.1:38083/json_rpc")]
    wallet_rpc_url: String,

    #[arg(long)]
    wallet_rpc_user: String,

    #[arg(long)]
    wallet_rpc_password: String,

    #[arg(long)]
    rate_ticker_url: String,

    #[arg(long)]
    store_path: PathBuf,

    /// Where swept funds from settled invoices go.
    #[arg(long)]
    payout_address: String,

    #[arg(long, default_value_t = 200)]
    fee_bps: u32,

    #[arg(long, default_value_t = 120)]
    quote_ttl_secs: u64,

    #[arg(long, default_value_t = 1_200)]
    payment_ttl_secs: u64,

    #[arg(long, default_value_t = 60)]
    max_rate_age_secs: u64,

    #[arg(long, default_value_t = 10_000_000)]
    epsilon_pico: u64,

    #[arg(long, default_value_t = 12)]
    display_precision: u32,

    /// 0.0015 BTC in millisatoshi.
    #[arg(long, default_value_t = 150_000_000)]
    max_amount_msat: u64,

    /// 0.25 XMR in piconero.
    #[arg(long, default_value_t = 250_000_000_000)]
    zero_conf_cap_pico: u64,

    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,

    #[arg(long, default_value_t = 10)]
    observer_failure_ceiling: u32,

    #[arg(long, default_value_t = 3_600)]
    release_grace_secs: u64,

    #[arg(long, default_value_t = 16)]
    pool_target: usize,

    #[arg(long, default_value_t = 10)]
    rpc_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    release_poll_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_xmr_bridge::logging::init().ok();

    let args = Args::parse();
    let listen_addr: SocketAddr = args.listen_addr.parse().context("parse listen_addr")?;
    let rpc_timeout = Duration::from_secs(args.rpc_timeout_secs);

    let wallet = MoneroRpcClient::new(
        args.wallet_rpc_url.clone(),
        args.wallet_rpc_user.clone(),
        args.wallet_rpc_password.clone(),
        rpc_timeout,
    )
    .context("create wallet rpc client")?;

    let rate_provider =
        HttpRateProvider::new(args.rate_ticker_url.clone(), rpc_timeout).context("create rate provider")?;

    let store = SqliteInvoiceStore::open(args.store_path).context("open invoice store")?;
    let store = Arc::new(Mutex::new(store));

    let cfg = BridgeConfig {
        fee_bps: args.fee_bps,
        quote_ttl_secs: args.quote_ttl_secs,
        payment_ttl_secs: args.payment_ttl_secs,
        max_rate_age_secs: args.max_rate_age_secs,
        epsilon_pico: args.epsilon_pico,
        display_precision: args.display_precision,
        max_amount_msat: args.max_amount_msat,
        zero_conf_cap_pico: args.zero_conf_cap_pico,
        poll_interval_secs: args.poll_interval_secs,
        observer_failure_ceiling: args.observer_failure_ceiling,
        release_grace_secs: args.release_grace_secs,
    };

    let allocator = Arc::new(SubaddressAllocator::new(Vec::new()));
    let wallet = Arc::new(wallet);

    let quotes = QuoteEngine::new(
        Arc::new(rate_provider),
        cfg.fee_bps,
        cfg.max_rate_age_secs,
        cfg.display_precision,
    );

    let engine = Arc::new(LifecycleEngine::new(
        cfg.clone(),
        quotes,
        allocator.clone(),
        wallet.clone(),
        store.clone(),
    ));

    // Resume in-flight invoices before serving so their deadlines keep
    // running across the restart.
    let report = engine.resume().context("resume in-flight invoices")?;
    for id in report.quoted {
        spawn_quote_timer(engine.clone(), id);
    }
    for id in report.monitoring {
        spawn_monitor(engine.clone(), wallet.clone(), id);
    }

    replenish_pool(&wallet, &allocator, args.pool_target)
        .await
        .context("seed subaddress pool")?;

    spawn_replenish_worker(
        wallet.clone(),
        allocator.clone(),
        args.pool_target,
        Duration::from_secs(args.release_poll_interval_secs),
    );
    spawn_release_worker(
        engine.clone(),
        wallet.clone(),
        store.clone(),
        args.payout_address,
        Duration::from_secs(args.release_poll_interval_secs),
    );

    let state = AppState {
        engine,
        observer: wallet,
    };

    tracing::info!(%listen_addr, "starting invoice bridge server");

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("bind listen addr")?;
    axum::serve(listener, router(state))
        .await
        .context("serve http")?;

    Ok(())
}

async fn replenish_pool(
    wallet: &MoneroRpcClient,
    allocator: &SubaddressAllocator,
    target: usize,
) -> Result<()> {
    while allocator.tracked() < target {
        let sub = wallet
            .create_subaddress()
            .await
            .context("create subaddress")?;
        tracing::debug!(subaddress_index = sub.minor_index, "pooled new subaddress");
        allocator.add(sub);
    }
    Ok(())
}

/// Keep the subaddress pool topped up so accepts never wait on the wallet.
fn spawn_replenish_worker(
    wallet: Arc<MoneroRpcClient>,
    allocator: Arc<SubaddressAllocator>,
    target: usize,
    interval: Duration,
) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = replenish_pool(&wallet, &allocator, target).await {
                tracing::warn!(error = %err, "replenish worker error");
            }
            tokio::time::sleep(interval).await;
        }
    });
}

/// Sweep settled invoices' subaddresses after their grace period and return
/// them to the pool. Paid and overpaid balances go to the payout address;
/// underpaid remainders go back to the payer's refund address.
fn spawn_release_worker(
    engine: Arc<LifecycleEngine>,
    wallet: Arc<MoneroRpcClient>,
    store: Arc<Mutex<SqliteInvoiceStore>>,
    payout_address: String,
    interval: Duration,
) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = release_once(&engine, &wallet, &store, &payout_address).await {
                tracing::warn!(error = %err, "release worker error");
            }
            tokio::time::sleep(interval).await;
        }
    });
}

async fn release_once(
    engine: &Arc<LifecycleEngine>,
    wallet: &MoneroRpcClient,
    store: &Arc<Mutex<SqliteInvoiceStore>>,
    payout_address: &str,
) -> Result<()> {
    let cutoff = unix_now().saturating_sub(engine.config().release_grace_secs);
    let due = store
        .lock()
        .expect("store mutex poisoned")
        .list_release_due(cutoff)
        .context("list release-due invoices")?;

    for invoice in due {
        let Some(sub) = invoice.subaddress.clone() else {
            continue;
        };

        let destination = match invoice.state {
            InvoiceState::UnderpaidExpired => invoice.refund_address.as_str(),
            _ => payout_address,
        };

        match wallet.sweep_subaddress(sub.minor_index, destination).await {
            Ok(tx_hashes) => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    subaddress_index = sub.minor_index,
                    destination = %destination,
                    swept_txs = tx_hashes.len(),
                    "swept settled invoice"
                );
                // The engine knows the invoice if it was live this process;
                // otherwise release directly against store and pool.
                if engine.release_settled(&invoice.id).is_err() {
                    store
                        .lock()
                        .expect("store mutex poisoned")
                        .mark_released(&invoice.id)
                        .context("mark invoice released")?;
                    engine.allocator().add(sub);
                }
            }
            Err(err) => {
                tracing::warn!(invoice_id = %invoice.id, error = %err, "sweep failed");
            }
        }
    }

    Ok(())
}
