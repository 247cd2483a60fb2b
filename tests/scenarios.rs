//! End-to-end scenarios over a fully wired core with the simulator
//! adapters.

use std::sync::Arc;
use std::time::Duration;
use tradedesk::catalog::{AccountBase, BrokerAccount, Catalog, Exchange, Security, SubAccount, User};
use tradedesk::orderbook::ExecTransType;
use tradedesk::prelude::*;
use tradedesk::risk::Limits;
use tradedesk::server::password_digest;

struct Fixture {
    core: Arc<Core>,
    catalog: Arc<Catalog>,
    _dir: tempfile::TempDir,
}

fn build_catalog(limits: Limits) -> Arc<Catalog> {
    let catalog = Arc::new(Catalog::new());
    catalog.securities.publish_exchange(Exchange {
        id: 1,
        name: "NYSE".to_string(),
        ..Default::default()
    });
    for (id, symbol, multiplier) in [(1u32, "AAA", 1.0), (2u32, "BBB", 1.0), (9u32, "FUT9", 100.0)]
    {
        catalog.securities.publish_security(Security {
            id,
            symbol: symbol.to_string(),
            exchange_id: 1,
            lot_size: 100,
            multiplier,
            ..Default::default()
        });
    }
    for (id, name) in [(1u16, "alpha"), (2u16, "beta")] {
        catalog.accounts.publish_sub_account(SubAccount {
            id,
            name: name.to_string(),
            base: AccountBase::with_limits(limits),
            broker_accounts: [(0u16, 8u16)].into_iter().collect(),
        });
    }
    catalog.accounts.publish_broker_account(BrokerAccount {
        id: 8,
        name: "prime".to_string(),
        adapter_name: "ec-sim".to_string(),
        ..Default::default()
    });
    catalog.accounts.publish_user(User {
        id: 3,
        name: "trader".to_string(),
        password_digest: password_digest("secret"),
        sub_accounts: [1u16, 2u16].into_iter().collect(),
        ..Default::default()
    });
    catalog
}

fn open_core(catalog: Arc<Catalog>, dir: &tempfile::TempDir) -> Arc<Core> {
    let db = dir.path().join("tradedesk.db");
    if !db.exists() {
        let conn = rusqlite::Connection::open(&db).unwrap();
        tradedesk::catalog::db::create_tables(&conn).unwrap();
    }
    let core = Core::open(
        catalog,
        CoreOptions {
            store_dir: dir.path().to_path_buf(),
            db_path: db,
            algo_threads: 1,
            io_threads: 1,
            disable_rms: false,
            pnl_start_delay: Duration::from_secs(3600),
        },
    )
    .unwrap();

    let mut registry = AdapterRegistry::new();
    tradedesk::sim::register(&mut registry);
    let config = Config::parse(
        "[md-sim]\ndriver = \"sim\"\nsrc = \"SIM\"\nmarkets = \"NYSE\"\n\n[ec-sim]\ndriver = \"sim\"\n",
    )
    .unwrap();
    core.load_adapters(&config, &registry).unwrap();
    core
}

fn fixture_with(limits: Limits) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let catalog = build_catalog(limits);
    let core = open_core(catalog.clone(), &dir);
    Fixture {
        core,
        catalog,
        _dir: dir,
    }
}

fn fixture() -> Fixture {
    fixture_with(Limits::default())
}

fn limit_buy(security_id: u32, acc: u16, qty: f64, px: f64) -> Order {
    Order::from_contract(
        Contract {
            security_id,
            sub_account_id: acc,
            qty,
            price: px,
            side: Side::Buy,
            ord_type: OrdType::Limit,
            ..Default::default()
        },
        3,
    )
}

#[test]
fn s1_limit_new_partial_fill() {
    let fx = fixture();
    let id = fx.core.dispatch.place(limit_buy(1, 1, 100.0, 10.0)).unwrap();
    // Simulator acks; no liquidity so the order rests as new.
    assert_eq!(fx.core.book.get(id).unwrap().status, OrderStatus::New);

    fx.core
        .dispatch
        .handle_fill(id, 40.0, 10.0, "X1", 0, true, ExecTransType::New, None);
    let ord = fx.core.book.get(id).unwrap();
    assert_eq!(ord.status, OrderStatus::PartiallyFilled);
    assert_eq!(ord.cum_qty, 40.0);
    assert_eq!(ord.leaves_qty, 60.0);

    fx.core
        .dispatch
        .handle_fill(id, 60.0, 10.0, "X2", 0, false, ExecTransType::New, None);
    let ord = fx.core.book.get(id).unwrap();
    assert_eq!(ord.status, OrderStatus::Filled);
    assert_eq!(ord.cum_qty, 100.0);
    assert_eq!(ord.leaves_qty, 0.0);

    let pos = fx.core.positions.position(Scope::Sub, 1, 1);
    assert_eq!(pos.qty, 100.0);
    assert_eq!(pos.avg_px, 10.0);
}

#[test]
fn s2_cancel_race_fill_wins() {
    let fx = fixture();
    let id = fx.core.dispatch.place(limit_buy(1, 1, 100.0, 10.0)).unwrap();
    let orig = fx.core.book.get(id).unwrap();

    // Cancel is in flight when the fill lands.
    let cancel_id = fx.core.dispatch.cancel(&orig).unwrap();
    fx.core
        .dispatch
        .handle_fill(id, 100.0, 10.0, "X", 0, false, ExecTransType::New, None);
    assert_eq!(fx.core.book.get(id).unwrap().status, OrderStatus::Filled);

    // The late cancel confirmation is dropped: the order is no longer live.
    fx.core.dispatch.handle_canceled(cancel_id, id, "", 0);
    let ord = fx.core.book.get(id).unwrap();
    assert_eq!(ord.status, OrderStatus::Filled);
    assert_eq!(ord.cum_qty, 100.0);

    let pos = fx.core.positions.position(Scope::Sub, 1, 1);
    assert_eq!(pos.qty, 100.0);
    assert_eq!(pos.total_outstanding_buy_qty, 0.0);
}

#[test]
fn s3_duplicate_fill_suppressed() {
    let fx = fixture();
    let id = fx.core.dispatch.place(limit_buy(1, 1, 100.0, 10.0)).unwrap();
    fx.core
        .dispatch
        .handle_fill(id, 50.0, 10.0, "X", 0, true, ExecTransType::New, None);
    fx.core
        .dispatch
        .handle_fill(id, 50.0, 10.0, "X", 0, true, ExecTransType::New, None);

    let ord = fx.core.book.get(id).unwrap();
    assert_eq!(ord.cum_qty, 50.0);
    assert_eq!(ord.leaves_qty, 50.0);
    assert_eq!(ord.status, OrderStatus::PartiallyFilled);
    let pos = fx.core.positions.position(Scope::Sub, 1, 1);
    assert_eq!(pos.qty, 50.0);
}

#[test]
fn s4_throttle_breach() {
    let fx = fixture_with(Limits {
        msg_rate: 2.0,
        ..Default::default()
    });
    assert!(fx.core.dispatch.place(limit_buy(1, 1, 10.0, 10.0)).is_ok());
    assert!(fx.core.dispatch.place(limit_buy(1, 1, 10.0, 10.0)).is_ok());
    let err = fx.core.dispatch.place(limit_buy(1, 1, 10.0, 10.0)).unwrap_err();
    assert!(err.contains("message rate"), "got: {err}");

    let rejected = fx.core.book.orders_with_status(OrderStatus::RiskRejected);
    assert_eq!(rejected.len(), 1);
}

/// A minimal scripted algo that submits one internal cross on start.
struct CrossAlgo {
    security_id: u32,
    sub_account_id: u16,
    side: Side,
    qty: f64,
}

impl Algo for CrossAlgo {
    fn on_start(&mut self, ctx: &AlgoCtx, _params: &AlgoParams) -> Result<(), String> {
        let inst = ctx.subscribe(self.security_id, DataSrc::from_name("SIM"))?;
        ctx.cross(self.qty, 0.0, self.side, self.sub_account_id, &inst)?;
        Ok(())
    }
}

#[test]
fn s5_internal_cross_at_mid() {
    let fx = fixture();
    let src = DataSrc::from_name("SIM");
    fx.core.md.update_quote(
        src,
        1,
        0,
        tradedesk::marketdata::Quote {
            ask_price: 10.2,
            ask_size: 100.0,
            bid_price: 9.8,
            bid_size: 100.0,
        },
    );

    fx.core.algos.register_algo(
        "cx-buy",
        Arc::new(|| {
            Box::new(CrossAlgo {
                security_id: 1,
                sub_account_id: 1,
                side: Side::Buy,
                qty: 100.0,
            }) as Box<dyn Algo>
        }),
    );
    fx.core.algos.register_algo(
        "cx-sell",
        Arc::new(|| {
            Box::new(CrossAlgo {
                security_id: 1,
                sub_account_id: 2,
                side: Side::Sell,
                qty: 60.0,
            }) as Box<dyn Algo>
        }),
    );

    let buy_algo = fx
        .core
        .algos
        .spawn("cx-buy", AlgoParams::new(), 3, "")
        .unwrap();
    fx.core.algos.quiesce();
    let sell_algo = fx
        .core
        .algos
        .spawn("cx-sell", AlgoParams::new(), 3, "")
        .unwrap();
    fx.core.algos.quiesce();

    // Both sides got a single fill of 60 at the 10.0 mid.
    let mut cx_orders: Vec<Order> = fx
        .core
        .book
        .live_orders()
        .into_iter()
        .filter(|o| o.ord_type() == OrdType::Cx)
        .collect();
    // Buy leaves 40 live; sell filled completely.
    assert_eq!(cx_orders.len(), 1);
    let buy = cx_orders.remove(0);
    assert_eq!(buy.algo_id, buy_algo);
    assert_eq!(buy.cum_qty, 60.0);
    assert_eq!(buy.leaves_qty, 40.0);
    assert!((buy.avg_px - 10.0).abs() < 1e-12);

    let filled = fx.core.book.orders_with_status(OrderStatus::Filled);
    let sell = filled
        .iter()
        .find(|o| o.ord_type() == OrdType::Cx && o.algo_id == sell_algo)
        .unwrap();
    assert_eq!(sell.cum_qty, 60.0);
    assert!((sell.avg_px - 10.0).abs() < 1e-12);

    // Positions netted internally: alpha +60, beta -60 at 10.0.
    let alpha = fx.core.positions.position(Scope::Sub, 1, 1);
    let beta = fx.core.positions.position(Scope::Sub, 2, 1);
    assert_eq!(alpha.qty, 60.0);
    assert_eq!(alpha.cx_qty, 60.0);
    assert_eq!(beta.qty, -60.0);
}

#[test]
fn s6_consolidation_top_of_book() {
    let fx = fixture();
    fx.core.consolidation.subscribe(1);
    let x = DataSrc::from_name("X");
    let y = DataSrc::from_name("Y");
    let quote = |ask: f64, ask_sz: f64, bid: f64, bid_sz: f64| tradedesk::marketdata::Quote {
        ask_price: ask,
        ask_size: ask_sz,
        bid_price: bid,
        bid_size: bid_sz,
    };
    fx.core.md.update_quote(x, 1, 0, quote(10.1, 100.0, 9.9, 200.0));
    fx.core.md.update_quote(y, 1, 0, quote(10.0, 50.0, 9.8, 100.0));

    let book = fx.core.consolidation.book(1).unwrap();
    let (best_ask, ask_quotes) = book.best(BookSide::Ask).unwrap();
    assert_eq!(best_ask, 10.0);
    assert_eq!(ask_quotes[0].src, y);
    assert_eq!(ask_quotes[0].size, 50.0);
    let (best_bid, bid_quotes) = book.best(BookSide::Bid).unwrap();
    assert_eq!(best_bid, 9.9);
    assert_eq!(bid_quotes[0].src, x);
    assert_eq!(bid_quotes[0].size, 200.0);

    // Y lifts its ask; X's becomes the consolidated best.
    fx.core.md.update_quote(y, 1, 0, quote(10.2, 50.0, 9.8, 100.0));
    let (best_ask, ask_quotes) = book.best(BookSide::Ask).unwrap();
    assert_eq!(best_ask, 10.1);
    assert_eq!(ask_quotes[0].src, x);
    assert_eq!(ask_quotes[0].size, 100.0);
}

#[test]
fn s7_bod_roll_and_subsequent_realization() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tradedesk.db");
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        tradedesk::catalog::db::create_tables(&conn).unwrap();
        // Previous session: qty=10 at avg 9.0, +5 realized native, on the
        // multiplier-100 future.
        conn.execute(
            "insert into position(user_id, sub_account_id, security_id, broker_account_id,
                 qty, cx_qty, avg_px, realized_pnl, commission, tm, info)
             values (3, 1, 9, 8, 10, 0, 9.0, 5.0, 0, '2000-01-01 00:00:00', '{}')",
            [],
        )
        .unwrap();
    }

    let catalog = build_catalog(Limits::default());
    let core = open_core(catalog, &dir);

    let pos = core.positions.position(Scope::Sub, 1, 9);
    assert_eq!(pos.qty, 10.0);
    assert_eq!(pos.avg_px, 9.0);
    assert!((pos.realized_pnl - 500.0).abs() < 1e-9);
    // Broker and user scopes carry the same baseline.
    assert_eq!(core.positions.position(Scope::Broker, 8, 9).qty, 10.0);
    assert_eq!(core.positions.position(Scope::User, 3, 9).qty, 10.0);

    // Sell 5 @ 11.0: +2.0/share over avg → +10 native, +1000 in account ccy.
    let mut sell = limit_buy(9, 1, 5.0, 11.0);
    sell.contract.side = Side::Sell;
    let id = core.dispatch.place(sell).unwrap();
    core.dispatch
        .handle_fill(id, 5.0, 11.0, "X1", 0, false, ExecTransType::New, None);

    let pos = core.positions.position(Scope::Sub, 1, 9);
    assert_eq!(pos.qty, 5.0);
    assert_eq!(pos.avg_px, 9.0);
    assert!((pos.realized_pnl_native - 15.0).abs() < 1e-9);
    assert!((pos.realized_pnl - 1500.0).abs() < 1e-9);
}

#[test]
fn position_scopes_stay_consistent() {
    // Invariant: the sum over sub-accounts equals the broker- and
    // user-level aggregates per security.
    let fx = fixture();
    let a = fx.core.dispatch.place(limit_buy(1, 1, 100.0, 10.0)).unwrap();
    let b = fx.core.dispatch.place(limit_buy(1, 2, 50.0, 10.0)).unwrap();
    fx.core
        .dispatch
        .handle_fill(a, 100.0, 10.0, "A1", 0, false, ExecTransType::New, None);
    fx.core
        .dispatch
        .handle_fill(b, 50.0, 10.0, "B1", 0, false, ExecTransType::New, None);

    let sub_sum = fx.core.positions.position(Scope::Sub, 1, 1).qty
        + fx.core.positions.position(Scope::Sub, 2, 1).qty;
    assert_eq!(sub_sum, 150.0);
    assert_eq!(fx.core.positions.position(Scope::Broker, 8, 1).qty, 150.0);
    assert_eq!(fx.core.positions.position(Scope::User, 3, 1).qty, 150.0);
}

#[test]
fn marketable_orders_fill_through_simulator() {
    let fx = fixture();
    let src = DataSrc::from_name("SIM");
    fx.core.md.update_quote(
        src,
        1,
        0,
        tradedesk::marketdata::Quote {
            ask_price: 10.1,
            ask_size: 500.0,
            bid_price: 9.9,
            bid_size: 500.0,
        },
    );
    // Crossing limit buy fills at the ask.
    let id = fx.core.dispatch.place(limit_buy(1, 1, 100.0, 10.2)).unwrap();
    let ord = fx.core.book.get(id).unwrap();
    assert_eq!(ord.status, OrderStatus::Filled);
    assert!((ord.avg_px - 10.1).abs() < 1e-12);

    // Unrealized PnL follows the tape.
    fx.core.md.update_trade(src, 1, 10.6, 10.0);
    fx.core.positions.update_pnl(&|sec| {
        fx.core
            .catalog
            .security(sec)
            .map(|s| fx.core.md.current_price(&s))
            .unwrap_or(0.0)
    });
    let pos = fx.core.positions.position(Scope::Sub, 1, 1);
    assert!((pos.unrealized_pnl - 50.0).abs() < 1e-9);
}

#[test]
fn shutdown_cancels_live_orders() {
    let fx = fixture();
    let id = fx.core.dispatch.place(limit_buy(1, 1, 100.0, 10.0)).unwrap();
    assert_eq!(fx.core.book.get(id).unwrap().status, OrderStatus::New);
    fx.core.shutdown(Duration::from_millis(10));
    let ord = fx.core.book.get(id).unwrap();
    assert_eq!(ord.status, OrderStatus::Canceled);
    assert!(fx.core.book.live_orders().is_empty());
    // Catalog still reachable after shutdown.
    assert!(fx.catalog.security(1).is_some());
}
