//! Client-session flows over the wired core: login, catalog dump,
//! market-data deltas, order entry and journal replay.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tradedesk::catalog::{AccountBase, BrokerAccount, Catalog, Exchange, Security, SubAccount, User};
use tradedesk::prelude::*;
use tradedesk::risk::Limits;
use tradedesk::server::password_digest;

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
        password_digest: password_digest("secret"),
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
            algo_threads: 1,
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

fn login(session: &mut Session) {
    let out = session.handle(&json!(["login", "trader", password_digest("secret")]));
    assert_eq!(out[0][0], "login");
    assert_eq!(out[0][1], "ok");
}

#[test]
fn login_required_and_checked() {
    let (core, _dir) = fixture();
    let mut session = Session::new(core);

    let out = session.handle(&json!(["securities"]));
    assert_eq!(out[0][0], "error");

    let out = session.handle(&json!(["login", "trader", "wrong-digest"]));
    assert_eq!(out[0][1], "error");

    let out = session.handle(&json!(["login", "nobody", password_digest("secret")]));
    assert_eq!(out[0][1], "error");

    login(&mut session);
    let out = session.handle(&json!(["securities"]));
    assert_eq!(out[0][0], "securities");
    // checksum + one security row
    assert_eq!(out[0].as_array().unwrap().len(), 3);
}

#[test]
fn md_subscription_pushes_deltas_once() {
    let (core, _dir) = fixture();
    let mut session = Session::new(core.clone());
    login(&mut session);

    let out = session.handle(&json!(["sub", 1]));
    assert_eq!(out[0][1], "ok");
    assert!(session.poll_md().is_none());

    core.md
        .update_trade(DataSrc::from_name("SIM"), 1, 10.5, 100.0);
    let frame = session.poll_md().unwrap();
    assert_eq!(frame[0], "md");
    let delta = &frame[1][1];
    assert_eq!(delta["c"], json!(10.5));
    assert_eq!(delta["V"], json!(100.0));

    // Nothing changed since: no frame.
    assert!(session.poll_md().is_none());

    let out = session.handle(&json!(["unsub", 1]));
    assert_eq!(out[0][1], "ok");
    core.md
        .update_trade(DataSrc::from_name("SIM"), 1, 10.6, 100.0);
    assert!(session.poll_md().is_none());
}

#[test]
fn order_entry_and_replay() {
    let (core, _dir) = fixture();
    let mut session = Session::new(core.clone());
    login(&mut session);

    let out = session.handle(&json!(["order", 1, 1, "Buy", "2", "0", 100.0, 10.0, 0.0]));
    assert_eq!(out[0][0], "order");
    let id = out[0][1].as_u64().unwrap() as u32;
    assert_eq!(core.book.get(id).unwrap().status, OrderStatus::New);

    core.dispatch.handle_fill(
        id,
        100.0,
        10.0,
        "X1",
        0,
        false,
        tradedesk::orderbook::ExecTransType::New,
        None,
    );

    // Offline replay returns the journaled confirmations plus a terminator.
    let frames = session.handle(&json!(["offline", 0, 0]));
    let orders: Vec<_> = frames.iter().filter(|f| f[0] == "Order").collect();
    assert!(orders.len() >= 3); // unconfirmed_new, new, filled
    assert_eq!(frames.last().unwrap()[0], "offline");

    let out = session.handle(&json!(["position", 1]));
    assert_eq!(out[0][0], "position");
    assert_eq!(out[0][2][1]["qty"], json!(100.0));
}

#[test]
fn cancel_permissions_enforced() {
    let (core, _dir) = fixture();
    let mut session = Session::new(core.clone());
    login(&mut session);

    let out = session.handle(&json!(["order", 1, 1, "Buy", "2", "0", 100.0, 10.0, 0.0]));
    let id = out[0][1].as_u64().unwrap() as u32;
    let out = session.handle(&json!(["cancel", id]));
    assert_eq!(out[0][0], "cancel");
    assert!(out[0][1].is_u64());
    assert_eq!(core.book.get(id).unwrap().status, OrderStatus::Canceled);
}

#[test]
fn targets_round_trip_through_session() {
    let (core, _dir) = fixture();
    let mut session = Session::new(core);
    login(&mut session);

    let out = session.handle(&json!(["target", 1, {"1": 500.0}]));
    assert_eq!(out[0][1], "ok");
    let out = session.handle(&json!(["target", 1]));
    assert_eq!(out[0][0], "target");
    assert_eq!(out[0][2]["1"], json!(500.0));

    // Unknown sub-account refused.
    let out = session.handle(&json!(["target", 9]));
    assert_eq!(out[0][0], "error");
}

#[test]
fn shutdown_is_admin_only() {
    let (core, _dir) = fixture();
    let mut session = Session::new(core);
    login(&mut session);
    let out = session.handle(&json!(["shutdown", 0, 1]));
    assert_eq!(out[0][0], "error");
}
