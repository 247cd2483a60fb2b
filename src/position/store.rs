//! Durable position persistence: the session marker, the beginning-of-day
//! query and the dedicated position-row writer.
//!
//! Position rows are accounting state; a failed write is fatal by design
//! (the process refuses to keep trading with a dead ledger).

use crossbeam::channel::{unbounded, Sender};
use rusqlite::Connection;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The current session: its UTC start timestamp and whether this process
/// created it (a fresh session triggers exec-id rollover handling).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub started_at: String,
    pub is_new: bool,
}

/// Read `store/session`, creating it with the current time when absent.
pub fn load_or_create_session(store_dir: &Path) -> Result<SessionInfo, StoreError> {
    let path = store_dir.join("session");
    if path.exists() {
        let mut buf = String::new();
        fs::File::open(&path)?.read_to_string(&mut buf)?;
        Ok(SessionInfo {
            started_at: buf.trim().to_string(),
            is_new: false,
        })
    } else {
        let now = crate::utils::now_str();
        fs::write(&path, &now)?;
        info!("created new session at {now}");
        Ok(SessionInfo {
            started_at: now,
            is_new: true,
        })
    }
}

/// One row of the position table.
#[derive(Debug, Clone, Default)]
pub struct PositionRow {
    pub user_id: u16,
    pub sub_account_id: u16,
    pub security_id: u32,
    pub broker_account_id: u16,
    pub qty: f64,
    pub cx_qty: f64,
    pub avg_px: f64,
    /// Realized PnL in the security's native currency.
    pub realized_pnl: f64,
    /// Commission in the security's native currency.
    pub commission: f64,
    pub tm: String,
    /// JSON blob of the confirmation that produced this row.
    pub info: String,
}

/// A beginning-of-day baseline: the most recent position row strictly before
/// the session start, per (sub_account, security).
#[derive(Debug, Clone, Default)]
pub struct BodRow {
    pub sub_account_id: u16,
    pub broker_account_id: u16,
    /// User on the last row before the session; user-scope BOD aggregates
    /// follow whoever last traded the bucket.
    pub user_id: u16,
    pub security_id: u32,
    pub qty: f64,
    pub cx_qty: f64,
    pub avg_px: f64,
    pub realized_pnl: f64,
    pub commission: f64,
    pub tm: String,
}

/// Owns the database connection on a dedicated writer thread; inserts are
/// queued and applied in order. A failed insert terminates the process.
pub struct PositionStore {
    tx: Mutex<Option<Sender<PositionRow>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PositionStore {
    /// Open the store, run the BOD query against the given session start,
    /// and hand the connection to the writer thread.
    pub fn open(db_path: &Path, session_tm: &str) -> Result<(Self, Vec<BodRow>), StoreError> {
        let conn = Connection::open(db_path)?;
        let bods = query_bod(&conn, session_tm)?;
        info!("loaded {} BOD positions", bods.len());

        let (tx, rx) = unbounded::<PositionRow>();
        let handle = std::thread::Builder::new()
            .name("position-writer".to_string())
            .spawn(move || {
                while let Ok(row) = rx.recv() {
                    if let Err(e) = insert_row(&conn, &row) {
                        eprintln!("DEBUG_PROBE position insert failed: {e}");
                        eprintln!("DEBUG_PROBE query_only={:?}", conn.query_row::<String,_,_>("PRAGMA query_only", [], |r| r.get(0)));
                        eprintln!("DEBUG_PROBE journal_mode={:?}", conn.query_row::<String,_,_>("PRAGMA journal_mode", [], |r| r.get(0)));
                        eprintln!("DEBUG_PROBE db_list={:?}", conn.query_row::<String,_,_>("PRAGMA database_list", [], |r| r.get(2)));
                        let dbp: String = conn.query_row("PRAGMA database_list", [], |r| r.get(2)).unwrap_or_default();
                        let dir = std::path::Path::new(&dbp).parent().unwrap_or(std::path::Path::new("/tmp"));
                        eprintln!("DEBUG_PROBE dir_meta={:?}", std::fs::metadata(dir).map(|m| m.permissions()));
                        if let Ok(entries) = std::fs::read_dir(dir) {
                            for e in entries.flatten() {
                                eprintln!("DEBUG_PROBE dir entry {:?} meta={:?}", e.path(), std::fs::metadata(e.path()).map(|m| (m.permissions(), m.len())));
                            }
                        }
                        let try_write = std::fs::OpenOptions::new().write(true).open(&dbp);
                        eprintln!("DEBUG_PROBE direct reopen write result: {:?}", try_write.is_ok());
                        use std::io::Write as _;
                        let _ = std::io::stderr().flush();
                        error!("position insert failed, refusing to lose accounting state: {e}");
                        std::process::exit(2);
                    }
                }
            })?;

        Ok((
            Self {
                tx: Mutex::new(Some(tx)),
                handle: Mutex::new(Some(handle)),
            },
            bods,
        ))
    }

    /// Queue a position row for insertion.
    pub fn insert(&self, row: PositionRow) {
        if let Ok(tx) = self.tx.lock() {
            if let Some(tx) = tx.as_ref() {
                // The writer only goes away at shutdown; a send failure then
                // is benign.
                let _ = tx.send(row);
            }
        }
    }

    /// Drain the queue and stop the writer.
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(h) = handle.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for PositionStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn insert_row(conn: &Connection, row: &PositionRow) -> Result<(), rusqlite::Error> {
    conn.execute(
        "insert into position(user_id, sub_account_id, security_id, broker_account_id,
             qty, cx_qty, avg_px, realized_pnl, commission, tm, info)
         values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            row.user_id,
            row.sub_account_id,
            row.security_id,
            row.broker_account_id,
            row.qty,
            row.cx_qty,
            row.avg_px,
            row.realized_pnl,
            row.commission,
            row.tm,
            row.info,
        ],
    )?;
    Ok(())
}

fn query_bod(conn: &Connection, session_tm: &str) -> Result<Vec<BodRow>, StoreError> {
    let mut st = conn.prepare(
        "select A.sub_account_id, A.broker_account_id, A.user_id, A.security_id, A.qty,
                A.cx_qty, A.avg_px, A.realized_pnl, A.commission, A.tm
           from position as A inner join
             (select sub_account_id, security_id, max(tm) as tm from position
               where tm < ?1 group by sub_account_id, security_id) as B
           on A.sub_account_id = B.sub_account_id and A.security_id = B.security_id
              and A.tm = B.tm",
    )?;
    let rows = st.query_map([session_tm], |row| {
        Ok(BodRow {
            sub_account_id: row.get(0)?,
            broker_account_id: row.get(1)?,
            user_id: row.get::<_, Option<u16>>(2)?.unwrap_or(0),
            security_id: row.get(3)?,
            qty: row.get(4)?,
            cx_qty: row.get(5)?,
            avg_px: row.get(6)?,
            realized_pnl: row.get(7)?,
            commission: row.get(8)?,
            tm: row.get(9)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}


#[cfg(test)]
mod debug_probe_extra {
    #[test]
    fn debug_repro() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("p.db");
        eprintln!("dir={:?} exists={} ", dir.path(), dir.path().exists());
        let meta = std::fs::metadata(dir.path()).unwrap();
        eprintln!("perms={:?}", meta.permissions());
        {
            let conn = rusqlite::Connection::open(&db).unwrap();
            conn.execute_batch("create table t(a int)").unwrap();
        }
        eprintln!("after create, file exists={}", db.exists());
        let conn2 = rusqlite::Connection::open(&db).unwrap();
        let res = conn2.execute("insert into t values (1)", []);
        eprintln!("insert result: {:?}", res);
    }

    #[test]
    fn debug_repro_real_flow() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("p.db");
        {
            let conn = rusqlite::Connection::open(&db).unwrap();
            crate::catalog::db::create_tables(&conn).unwrap();
        }
        let (store, bods) = super::PositionStore::open(&db, "2020-01-01T00:00:00Z").unwrap();
        eprintln!("bods={}", bods.len());
        store.insert(super::PositionRow {
            sub_account_id: 1,
            security_id: 1,
            qty: 1.0,
            tm: "2020-01-01T00:00:01Z".to_string(),
            ..Default::default()
        });
        std::thread::sleep(std::time::Duration::from_millis(200));
        eprintln!("done");
    }

    #[test]
    fn debug_repro_via_manager() {
        use crate::catalog::{Catalog, Exchange, Security};
        use crate::position::commission::CommissionManager;
        use std::sync::Arc;

        let catalog = Arc::new(Catalog::new());
        catalog.securities.publish_exchange(Exchange {
            id: 1,
            name: "X".to_string(),
            ..Default::default()
        });
        catalog.securities.publish_security(Security {
            id: 1,
            symbol: "AAA".to_string(),
            exchange_id: 1,
            multiplier: 1.0,
            rate: 1.0,
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("p.db");
        {
            let conn = rusqlite::Connection::open(&db).unwrap();
            crate::catalog::db::create_tables(&conn).unwrap();
        }
        let (mgr, _) = crate::position::PositionManager::new(
            catalog.clone(),
            Arc::new(CommissionManager::new()),
            dir.path(),
            &db,
        )
        .unwrap();
        mgr.store.insert(super::PositionRow {
            sub_account_id: 1,
            security_id: 1,
            qty: 1.0,
            tm: "2020-01-01T00:00:01Z".to_string(),
            ..Default::default()
        });
        std::thread::sleep(std::time::Duration::from_millis(200));
        eprintln!("done via manager");
    }

    #[test]
    fn debug_repro_via_handle() {
        use crate::catalog::{Catalog, Exchange, Security};
        use crate::orderbook::{Confirmation, Contract, ExecTransType, OrdType, OrderStatus, Side};
        use crate::position::commission::CommissionManager;
        use std::sync::Arc;

        let catalog = Arc::new(Catalog::new());
        catalog.securities.publish_exchange(Exchange {
            id: 1,
            name: "X".to_string(),
            ..Default::default()
        });
        catalog.securities.publish_security(Security {
            id: 1,
            symbol: "AAA".to_string(),
            exchange_id: 1,
            multiplier: 1.0,
            rate: 1.0,
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("p.db");
        {
            let conn = rusqlite::Connection::open(&db).unwrap();
            crate::catalog::db::create_tables(&conn).unwrap();
        }
        let (mgr, _) = crate::position::PositionManager::new(
            catalog.clone(),
            Arc::new(CommissionManager::new()),
            dir.path(),
            &db,
        )
        .unwrap();

        let mut ord = crate::orderbook::Order::from_contract(
            Contract {
                security_id: 1,
                sub_account_id: 1,
                qty: 100.0,
                price: 10.0,
                side: Side::Buy,
                ord_type: OrdType::Limit,
                ..Default::default()
            },
            3,
        );
        ord.id = 1;
        ord.broker_account_id = 2;

        let mut cm = Confirmation::fill(ord.id, 100.0, 10.0, "X", ExecTransType::New, 1);
        cm.exec_type = OrderStatus::Filled;
        mgr.handle(&cm, &ord, false);
        std::thread::sleep(std::time::Duration::from_millis(300));
        eprintln!("done via handle");
    }
}
