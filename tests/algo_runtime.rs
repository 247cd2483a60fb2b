//! Algo runtime behavior over the wired core: market-data notification,
//! lifecycle, timers and confirmation-driven instrument accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tradedesk::catalog::{AccountBase, BrokerAccount, Catalog, Exchange, Security, SubAccount, User};
use tradedesk::marketdata::Quote;
use tradedesk::prelude::*;
use tradedesk::risk::Limits;

fn fixture() -> (Arc<Core>, tempfile::TempDir) {
    let catalog = Arc::new(Catalog::new());
    catalog.securities.publish_exchange(Exchange {
        id: 1,
        name: "NYSE".to_string(),
        ..Default::default()
    });
    catalog.securities.publish_security(Security {
        id: 1,
        symbol: "AAA".to_string(),
        exchange_id: 1,
        lot_size: 100,
        ..Default::default()
    });
    catalog.accounts.publish_sub_account(SubAccount {
        id: 1,
        name: "alpha".to_string(),
        base: AccountBase::with_limits(Limits::default()),
        broker_accounts: [(0u16, 8u16)].into_iter().collect(),
    });
    catalog.accounts.publish_broker_account(BrokerAccount {
        id: 8,
        name: "prime".to_string(),
        adapter_name: "ec-sim".to_string(),
        ..Default::default()
    });
    catalog.accounts.publish_user(User {
        id: 3,
        name: "trader".to_string(),
        sub_accounts: [1u16].into_iter().collect(),
        ..Default::default()
    });

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tradedesk.db");
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        tradedesk::catalog::db::create_tables(&conn).unwrap();
    }
    let core = Core::open(
        catalog,
        CoreOptions {
            store_dir: dir.path().to_path_buf(),
            db_path: db,
            algo_threads: 2,
            io_threads: 1,
            disable_rms: false,
            pnl_start_delay: Duration::from_secs(3600),
        },
    )
    .unwrap();
    let mut registry = AdapterRegistry::new();
    tradedesk::sim::register(&mut registry);
    let config =
        Config::parse("[md-sim]\ndriver = \"sim\"\nsrc = \"SIM\"\nmarkets = \"NYSE\"\n\n[ec-sim]\ndriver = \"sim\"\n")
            .unwrap();
    core.load_adapters(&config, &registry).unwrap();
    (core, dir)
}

#[derive(Default)]
struct Counters {
    quotes: AtomicUsize,
    trades: AtomicUsize,
    confirmations: AtomicUsize,
    timers: AtomicUsize,
    stops: AtomicUsize,
}

/// A scripted recorder algo: subscribes on start, counts callbacks, and
/// places one resting child when asked via params.
struct Recorder {
    counters: Arc<Counters>,
    place_child: bool,
    child: Arc<Mutex<Option<u32>>>,
}

impl Algo for Recorder {
    fn on_start(&mut self, ctx: &AlgoCtx, _params: &AlgoParams) -> Result<(), String> {
        let inst = ctx.subscribe(1, DataSrc::from_name("SIM"))?;
        if self.place_child {
            let id = ctx.place(
                Contract {
                    security_id: 1,
                    sub_account_id: 1,
                    qty: 100.0,
                    price: 10.0,
                    side: Side::Buy,
                    ord_type: OrdType::Limit,
                    ..Default::default()
                },
                &inst,
            )?;
            if let Ok(mut child) = self.child.lock() {
                *child = Some(id);
            }
        }
        ctx.set_timeout(7, 0.0);
        Ok(())
    }

    fn on_market_quote(&mut self, _ctx: &AlgoCtx, _inst: &Arc<Instrument>, md: &MdSnapshot, prev: &MdSnapshot) {
        assert_ne!(md.quote(), prev.quote());
        self.counters.quotes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_market_trade(&mut self, _ctx: &AlgoCtx, _inst: &Arc<Instrument>, md: &MdSnapshot, prev: &MdSnapshot) {
        assert!(md.trade.changed(&prev.trade));
        self.counters.trades.fetch_add(1, Ordering::SeqCst);
    }

    fn on_confirmation(&mut self, _ctx: &AlgoCtx, _cm: &Confirmation, _ord: &Order) {
        self.counters.confirmations.fetch_add(1, Ordering::SeqCst);
    }

    fn on_timer(&mut self, _ctx: &AlgoCtx, token: u64) {
        assert_eq!(token, 7);
        self.counters.timers.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stop(&mut self, _ctx: &AlgoCtx) {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn register_recorder(
    core: &Arc<Core>,
    place_child: bool,
) -> (Arc<Counters>, Arc<Mutex<Option<u32>>>) {
    let counters = Arc::new(Counters::default());
    let child = Arc::new(Mutex::new(None));
    let (c, ch) = (counters.clone(), child.clone());
    core.algos.register_algo(
        "recorder",
        Arc::new(move || {
            Box::new(Recorder {
                counters: c.clone(),
                place_child,
                child: ch.clone(),
            }) as Box<dyn Algo>
        }),
    );
    (counters, child)
}

#[test]
fn market_data_notifies_once_per_update() {
    let (core, _dir) = fixture();
    let (counters, _) = register_recorder(&core, false);
    let id = core.algos.spawn("recorder", AlgoParams::new(), 3, "tok-1").unwrap();
    core.algos.quiesce();
    assert!(core.algos.is_subscribed(DataSrc::from_name("SIM"), 1));
    assert_eq!(counters.timers.load(Ordering::SeqCst), 1);

    let src = DataSrc::from_name("SIM");
    core.md.update_quote(
        src,
        1,
        0,
        Quote {
            ask_price: 10.1,
            ask_size: 100.0,
            bid_price: 9.9,
            bid_size: 100.0,
        },
    );
    core.algos.quiesce();
    assert_eq!(counters.quotes.load(Ordering::SeqCst), 1);
    assert_eq!(counters.trades.load(Ordering::SeqCst), 0);

    core.md.update_trade(src, 1, 10.0, 50.0);
    core.algos.quiesce();
    assert_eq!(counters.trades.load(Ordering::SeqCst), 1);

    // An identical quote does not re-notify.
    core.md.update_quote(
        src,
        1,
        0,
        Quote {
            ask_price: 10.1,
            ask_size: 100.0,
            bid_price: 9.9,
            bid_size: 100.0,
        },
    );
    core.algos.quiesce();
    assert_eq!(counters.quotes.load(Ordering::SeqCst), 1);

    // After stop, no further callbacks arrive.
    core.algos.stop(id);
    core.algos.quiesce();
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    core.md.update_trade(src, 1, 11.0, 50.0);
    core.algos.quiesce();
    assert_eq!(counters.trades.load(Ordering::SeqCst), 1);
    assert!(!core.algos.algo_info(id).unwrap().is_active());
}

#[test]
fn confirmations_update_instrument_accounting() {
    let (core, _dir) = fixture();
    let (counters, child) = register_recorder(&core, true);
    let id = core.algos.spawn("recorder", AlgoParams::new(), 3, "").unwrap();
    core.algos.quiesce();

    let child_id = child.lock().unwrap().expect("child order placed");
    let info = core.algos.algo_info(id).unwrap();
    let inst = info.instruments().into_iter().next().unwrap();
    assert_eq!(inst.outstanding_buy_qty(), 100.0);
    assert!(inst.has_active_orders());

    core.dispatch.handle_fill(
        child_id,
        40.0,
        10.0,
        "F1",
        0,
        true,
        tradedesk::orderbook::ExecTransType::New,
        None,
    );
    assert_eq!(inst.outstanding_buy_qty(), 60.0);
    assert_eq!(inst.bought_qty(), 40.0);

    // Terminal cancel releases the leaves and clears the active set.
    let ord = core.book.get(child_id).unwrap();
    core.dispatch.cancel(&ord).unwrap();
    core.algos.quiesce();
    assert_eq!(inst.outstanding_buy_qty(), 0.0);
    assert!(!inst.has_active_orders());
    assert!(counters.confirmations.load(Ordering::SeqCst) >= 3);
}

#[test]
fn failing_on_start_stops_the_algo() {
    let (core, _dir) = fixture();
    struct Doomed;
    impl Algo for Doomed {
        fn on_start(&mut self, _ctx: &AlgoCtx, _params: &AlgoParams) -> Result<(), String> {
            Err("bad params".to_string())
        }
    }
    core.algos
        .register_algo("doomed", Arc::new(|| Box::new(Doomed) as Box<dyn Algo>));
    let id = core.algos.spawn("doomed", AlgoParams::new(), 3, "").unwrap();
    core.algos.quiesce();
    assert!(!core.algos.algo_info(id).unwrap().is_active());

    // The journal carries the new + failed records.
    core.algos.sync_journal();
    let mut statuses = Vec::new();
    core.algos
        .replay(0, 3, false, |ev| statuses.push(ev.status.clone()))
        .unwrap();
    assert_eq!(statuses, vec!["new", "failed"]);
}

#[test]
fn spawn_unknown_algo_refused() {
    let (core, _dir) = fixture();
    assert!(core
        .algos
        .spawn("nope", AlgoParams::new(), 3, "")
        .is_err());
}

#[test]
fn algo_lookup_by_token() {
    let (core, _dir) = fixture();
    let (_counters, _) = register_recorder(&core, false);
    let id = core.algos.spawn("recorder", AlgoParams::new(), 3, "tok-9").unwrap();
    core.algos.quiesce();
    assert_eq!(core.algos.algo_by_token("tok-9").unwrap().id, id);
    core.algos.stop_by_token("tok-9");
    core.algos.quiesce();
    assert!(!core.algos.algo_info(id).unwrap().is_active());
}
