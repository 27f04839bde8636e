use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use ln_xmr_bridge::bridge::monitor::spawn_monitor;
use ln_xmr_bridge::bridge::{
    unix_now, AddressValidator, BalanceObserver, BridgeConfig, BridgeError, InvoiceRecord,
    InvoiceState, LifecycleEngine, QuoteEngine, SqliteInvoiceStore, SubaddressAllocator,
};
use ln_xmr_bridge::monero::Subaddress;
use ln_xmr_bridge::rate::{ExchangeRate, RateProvider};

/// BOLT11 test invoice: 0.0025 BTC, description "1 cup coffee". Built from
/// the spec test vector's key and payment hash, with the payment secret the
/// modern parser requires.
const BOLT11: &str = "lnbc2500u1p525mcqdq5xysxxatsyp3k7enxv4jspp5qqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqqqsyqcyq5rqwzqfqypqsp5zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zyg3zygs9qrsgqxq8zals8sqcqpjx6z37t3qynzurk974854yqxs5n73ghc648p673ama2g924avx52pwfe02ljtgk5k6edkxt7jq3kyzl44c5v0m6qlah67p9hkkenrs2spze2w5l";

/// 150 XMR/BTC in piconero per satoshi.
const RATE: u64 = 1_500_000;
/// 0.0025 BTC at 150 XMR/BTC with a 2% fee.
const DUE: u64 = 382_500_000_000;
const EPS: u64 = 10_000_000;

struct FixedRate {
    pico_per_sat: u64,
    stale: bool,
}

#[async_trait]
impl RateProvider for FixedRate {
    async fn current_rate(&self) -> Result<ExchangeRate> {
        let observed_at = if self.stale {
            unix_now().saturating_sub(3_600)
        } else {
            unix_now()
        };
        Ok(ExchangeRate::xmr_per_btc(self.pico_per_sat, observed_at))
    }
}

struct AcceptAllAddresses;

#[async_trait]
impl AddressValidator for AcceptAllAddresses {
    async fn is_valid_address(&self, _address: &str) -> Result<bool> {
        Ok(true)
    }
}

struct RejectAllAddresses;

#[async_trait]
impl AddressValidator for RejectAllAddresses {
    async fn is_valid_address(&self, _address: &str) -> Result<bool> {
        Ok(false)
    }
}

struct UnreachableWallet;

#[async_trait]
impl AddressValidator for UnreachableWallet {
    async fn is_valid_address(&self, _address: &str) -> Result<bool> {
        Err(anyhow::anyhow!("connection refused"))
    }
}

struct FailingObserver;

#[async_trait]
impl BalanceObserver for FailingObserver {
    async fn received_total(&self, _minor_index: u32, _include_unconfirmed: bool) -> Result<u64> {
        Err(anyhow::anyhow!("wallet rpc timed out"))
    }
}

fn test_config() -> BridgeConfig {
    BridgeConfig {
        max_amount_msat: 300_000_000,
        epsilon_pico: EPS,
        ..BridgeConfig::default()
    }
}

fn subaddresses(n: u32) -> Vec<Subaddress> {
    (0..n)
        .map(|minor_index| Subaddress {
            address: format!("8Sub{minor_index}"),
            minor_index,
        })
        .collect()
}

struct TestBridge {
    engine: Arc<LifecycleEngine>,
    allocator: Arc<SubaddressAllocator>,
    store: Arc<Mutex<SqliteInvoiceStore>>,
    _dir: tempfile::TempDir,
}

fn bridge_with(cfg: BridgeConfig, pool_size: u32, stale_rate: bool) -> TestBridge {
    let dir = tempfile::tempdir().expect("create tempdir");
    let store = Arc::new(Mutex::new(
        SqliteInvoiceStore::open(dir.path().join("invoices.sqlite3")).expect("open store"),
    ));
    let allocator = Arc::new(SubaddressAllocator::new(subaddresses(pool_size)));
    let quotes = QuoteEngine::new(
        Arc::new(FixedRate {
            pico_per_sat: RATE,
            stale: stale_rate,
        }),
        cfg.fee_bps,
        cfg.max_rate_age_secs,
        cfg.display_precision,
    );
    let engine = Arc::new(LifecycleEngine::new(
        cfg,
        quotes,
        allocator.clone(),
        Arc::new(AcceptAllAddresses),
        store.clone(),
    ));
    TestBridge {
        engine,
        allocator,
        store,
        _dir: dir,
    }
}

fn bridge() -> TestBridge {
    bridge_with(test_config(), 4, false)
}

#[tokio::test]
async fn quote_prices_the_invoice_with_fee() {
    let b = bridge();
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();

    assert_eq!(record.state, InvoiceState::Quoted);
    assert_eq!(record.amount_msat, 250_000_000);
    assert_eq!(record.xmr_amount_due, DUE);
    assert_eq!(record.rate_pico_per_sat, RATE);
    assert!(record.subaddress.is_none());
    assert!(record.quote_expires_at > record.created_at);

    // The quote is durable before any acceptance.
    let stored = b
        .store
        .lock()
        .unwrap()
        .get_invoice(&record.id)
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, InvoiceState::Quoted);
    assert_eq!(stored.xmr_amount_due, DUE);
}

#[tokio::test]
async fn stale_rate_refuses_to_quote() {
    let b = bridge_with(test_config(), 4, true);
    let err = b.engine.create_quote(BOLT11, "4Refund").await.unwrap_err();
    assert!(matches!(err, BridgeError::StaleRate { .. }));
}

#[tokio::test]
async fn oversized_invoice_is_refused() {
    let cfg = BridgeConfig {
        max_amount_msat: 150_000_000,
        ..test_config()
    };
    let b = bridge_with(cfg, 4, false);
    let err = b.engine.create_quote(BOLT11, "4Refund").await.unwrap_err();
    assert!(matches!(err, BridgeError::AmountTooLarge));
}

fn engine_with_validator(
    validator: Arc<dyn AddressValidator>,
) -> (LifecycleEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create tempdir");
    let store = Arc::new(Mutex::new(
        SqliteInvoiceStore::open(dir.path().join("invoices.sqlite3")).expect("open store"),
    ));
    let cfg = test_config();
    let quotes = QuoteEngine::new(
        Arc::new(FixedRate {
            pico_per_sat: RATE,
            stale: false,
        }),
        cfg.fee_bps,
        cfg.max_rate_age_secs,
        cfg.display_precision,
    );
    let engine = LifecycleEngine::new(
        cfg,
        quotes,
        Arc::new(SubaddressAllocator::new(subaddresses(1))),
        validator,
        store,
    );
    (engine, dir)
}

#[tokio::test]
async fn invalid_refund_address_is_refused() {
    let (engine, _dir) = engine_with_validator(Arc::new(RejectAllAddresses));
    let err = engine.create_quote(BOLT11, "nonsense").await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidRefundAddress));
}

#[tokio::test]
async fn unreachable_wallet_surfaces_as_observer_unavailable() {
    let (engine, _dir) = engine_with_validator(Arc::new(UnreachableWallet));
    let err = engine.create_quote(BOLT11, "4Refund").await.unwrap_err();
    assert!(matches!(err, BridgeError::ObserverUnavailable));
}

#[tokio::test]
async fn accept_is_idempotent_and_allocates_once() {
    let b = bridge();
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    let now = unix_now();

    let (first, started) = b.engine.accept(&record.id, now).unwrap();
    assert!(started);
    assert_eq!(first.state, InvoiceState::Monitoring);
    assert_eq!(first.payment_expires_at, Some(now + 1_200));
    let sub = first.subaddress.clone().expect("subaddress bound");
    assert_eq!(b.allocator.free_count(), 3);

    let (second, started) = b.engine.accept(&record.id, now + 5).unwrap();
    assert!(!started);
    assert_eq!(second.subaddress, Some(sub));
    assert_eq!(second.xmr_amount_due, first.xmr_amount_due);
    assert_eq!(b.allocator.free_count(), 3);
}

#[tokio::test]
async fn accept_after_quote_deadline_fails() {
    let b = bridge();
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();

    let err = b
        .engine
        .accept(&record.id, record.quote_expires_at + 1)
        .unwrap_err();
    assert!(matches!(err, BridgeError::QuoteExpired));

    // The failed accept left the quote untouched.
    assert_eq!(b.engine.get(&record.id).unwrap().state, InvoiceState::Quoted);
}

#[tokio::test]
async fn reject_is_idempotent_and_terminal_reject_is_a_noop() {
    let b = bridge();
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    let now = unix_now();

    assert_eq!(b.engine.reject(&record.id, now).unwrap(), InvoiceState::Rejected);
    assert_eq!(
        b.engine.reject(&record.id, now + 1).unwrap(),
        InvoiceState::Rejected
    );

    // Rejecting a settled invoice changes nothing either.
    let paid = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    b.engine.accept(&paid.id, now).unwrap();
    b.engine.record_observation(&paid.id, DUE, now + 10).unwrap();
    assert_eq!(b.engine.reject(&paid.id, now + 20).unwrap(), InvoiceState::Paid);
}

#[tokio::test]
async fn observed_balance_is_monotonic() {
    let b = bridge();
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    let now = unix_now();
    b.engine.accept(&record.id, now).unwrap();

    b.engine
        .record_observation(&record.id, 1_000_000, now + 1)
        .unwrap();
    // A lower read (stale RPC snapshot) never rewinds the balance.
    b.engine.record_observation(&record.id, 0, now + 2).unwrap();

    assert_eq!(b.engine.get(&record.id).unwrap().observed_balance, 1_000_000);
}

#[tokio::test]
async fn epsilon_boundary_is_exact_at_the_deadline() {
    let b = bridge();
    let now = unix_now();

    // One piconero below the tolerance stays unsettled and expires short.
    let under = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    b.engine.accept(&under.id, now).unwrap();
    let deadline = b.engine.get(&under.id).unwrap().payment_expires_at.unwrap();
    let state = b
        .engine
        .record_observation(&under.id, DUE - EPS - 1, now + 1)
        .unwrap();
    assert_eq!(state, InvoiceState::Monitoring);
    assert_eq!(
        b.engine.expire(&under.id, deadline).unwrap(),
        InvoiceState::UnderpaidExpired
    );
    assert!(b.engine.get(&under.id).unwrap().attention);

    // Exactly epsilon below the amount due settles as paid.
    let paid = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    b.engine.accept(&paid.id, now).unwrap();
    let state = b
        .engine
        .record_observation(&paid.id, DUE - EPS, now + 1)
        .unwrap();
    assert_eq!(state, InvoiceState::Paid);
}

#[tokio::test]
async fn overpayment_beyond_epsilon_is_terminal_success() {
    let b = bridge();
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    let now = unix_now();
    b.engine.accept(&record.id, now).unwrap();

    let state = b
        .engine
        .record_observation(&record.id, DUE + EPS + 1, now + 1)
        .unwrap();
    assert_eq!(state, InvoiceState::Overpaid);
}

#[tokio::test]
async fn settling_observation_beats_expiry_at_the_same_instant() {
    let b = bridge();
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    let now = unix_now();
    b.engine.accept(&record.id, now).unwrap();
    let deadline = b.engine.get(&record.id).unwrap().payment_expires_at.unwrap();

    let state = b.engine.record_observation(&record.id, DUE, deadline).unwrap();
    assert_eq!(state, InvoiceState::Paid);

    // The timer firing afterwards must not overturn the verdict.
    assert_eq!(b.engine.expire(&record.id, deadline).unwrap(), InvoiceState::Paid);
}

#[tokio::test]
async fn expiry_rechecks_the_last_known_balance() {
    // A balance persisted before a restart satisfies payment; the timer
    // firing right after resume must commit Paid, never Expired.
    let b = bridge();
    let record = InvoiceRecord {
        id: "inv-resumed".to_string(),
        bolt11: BOLT11.to_string(),
        payment_hash: "00".repeat(32),
        description: String::new(),
        refund_address: "4Refund".to_string(),
        amount_msat: 250_000_000,
        fee_bps: 200,
        rate_pico_per_sat: RATE,
        xmr_amount_due: DUE,
        subaddress: Some(Subaddress {
            address: "8Resumed".to_string(),
            minor_index: 99,
        }),
        observed_balance: DUE,
        created_at: 1_000,
        quote_expires_at: 1_120,
        payment_expires_at: Some(1_500),
        terminal_at: None,
        state: InvoiceState::Monitoring,
        attention: false,
        released: false,
    };
    b.store.lock().unwrap().insert_invoice(&record).unwrap();

    let report = b.engine.resume().unwrap();
    assert_eq!(report.monitoring, vec!["inv-resumed".to_string()]);

    assert_eq!(
        b.engine.expire("inv-resumed", 2_000).unwrap(),
        InvoiceState::Paid
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_observer_failures_flag_without_forcing_a_verdict() {
    let cfg = BridgeConfig {
        poll_interval_secs: 0,
        observer_failure_ceiling: 3,
        ..test_config()
    };
    let b = bridge_with(cfg, 4, false);
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    b.engine.accept(&record.id, unix_now()).unwrap();

    spawn_monitor(b.engine.clone(), Arc::new(FailingObserver), record.id.clone());

    let mut flagged = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if b.engine.get(&record.id).unwrap().attention {
            flagged = true;
            break;
        }
    }
    assert!(flagged, "failure ceiling never flagged the invoice");

    // Flagging is advisory: the invoice keeps monitoring and the balance
    // stands untouched.
    let invoice = b.engine.get(&record.id).unwrap();
    assert_eq!(invoice.state, InvoiceState::Monitoring);
    assert_eq!(invoice.observed_balance, 0);

    // And the flag is durable.
    let stored = b
        .store
        .lock()
        .unwrap()
        .get_invoice(&record.id)
        .unwrap()
        .unwrap();
    assert!(stored.attention);
}

#[tokio::test]
async fn terminal_invoices_are_dropped_from_memory() {
    let b = bridge();
    let now = unix_now();

    // A rejected quote never held a subaddress; its slot goes at once and
    // the store keeps answering for it.
    let rejected = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    assert_eq!(b.engine.live_slots(), 1);
    b.engine.reject(&rejected.id, now).unwrap();
    assert_eq!(b.engine.live_slots(), 0);
    assert_eq!(
        b.engine.get(&rejected.id).unwrap().state,
        InvoiceState::Rejected
    );
    assert_eq!(
        b.engine.reject(&rejected.id, now + 1).unwrap(),
        InvoiceState::Rejected
    );

    // A paid invoice keeps its slot until the subaddress goes back.
    let paid = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    b.engine.accept(&paid.id, now).unwrap();
    b.engine.record_observation(&paid.id, DUE, now + 1).unwrap();
    assert_eq!(b.engine.live_slots(), 1);
    b.engine.release_settled(&paid.id).unwrap();
    assert_eq!(b.engine.live_slots(), 0);
    assert_eq!(b.engine.get(&paid.id).unwrap().state, InvoiceState::Paid);

    // An expired quote leaves no slot either, and a late accept still
    // reports the quote as gone.
    let expired = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    b.engine
        .expire(&expired.id, expired.quote_expires_at + 1)
        .unwrap();
    assert_eq!(b.engine.live_slots(), 0);
    assert!(matches!(
        b.engine.accept(&expired.id, now).unwrap_err(),
        BridgeError::QuoteExpired
    ));
}

#[tokio::test]
async fn zero_balance_expiry_releases_the_subaddress_immediately() {
    let b = bridge();
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    let now = unix_now();
    b.engine.accept(&record.id, now).unwrap();
    assert_eq!(b.allocator.free_count(), 3);

    let deadline = b.engine.get(&record.id).unwrap().payment_expires_at.unwrap();
    assert_eq!(b.engine.expire(&record.id, deadline).unwrap(), InvoiceState::Expired);

    let settled = b.engine.get(&record.id).unwrap();
    assert!(settled.released);
    assert_eq!(b.allocator.free_count(), 4);
    assert_eq!(b.engine.live_slots(), 0);
}

#[tokio::test]
async fn paid_invoice_releases_only_through_the_grace_path() {
    let b = bridge();
    let record = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    let now = unix_now();
    b.engine.accept(&record.id, now).unwrap();
    b.engine.record_observation(&record.id, DUE, now + 1).unwrap();

    // Settled but not yet released: the subaddress stays out of the pool.
    assert_eq!(b.allocator.free_count(), 3);
    assert!(!b.engine.get(&record.id).unwrap().released);

    b.engine.release_settled(&record.id).unwrap();
    assert!(b.engine.get(&record.id).unwrap().released);
    assert_eq!(b.allocator.free_count(), 4);
}

#[tokio::test]
async fn pool_exhaustion_leaves_the_invoice_quoted() {
    let b = bridge_with(test_config(), 1, false);
    let now = unix_now();

    let first = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    let second = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();

    let (a, _) = b.engine.accept(&first.id, now).unwrap();
    assert_eq!(a.state, InvoiceState::Monitoring);

    let err = b.engine.accept(&second.id, now).unwrap_err();
    assert!(matches!(err, BridgeError::PoolExhausted));
    assert_eq!(b.engine.get(&second.id).unwrap().state, InvoiceState::Quoted);

    // Capacity freeing makes the same quote acceptable again.
    let deadline = b.engine.get(&first.id).unwrap().payment_expires_at.unwrap();
    b.engine.expire(&first.id, deadline).unwrap();
    let (s, started) = b.engine.accept(&second.id, now).unwrap();
    assert!(started);
    assert_eq!(s.state, InvoiceState::Monitoring);
}

#[tokio::test]
async fn distinct_live_invoices_get_distinct_subaddresses() {
    let b = bridge();
    let now = unix_now();

    let first = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();
    let second = b.engine.create_quote(BOLT11, "4Refund").await.unwrap();

    let (a, _) = b.engine.accept(&first.id, now).unwrap();
    let (b2, _) = b.engine.accept(&second.id, now).unwrap();
    assert_ne!(a.subaddress, b2.subaddress);
}
