//! The global order book: authoritative live-order map, id allocation,
//! duplicate-execution suppression and the confirmation pipeline.

use super::journal::{Journal, JournalError, JournalRecord};
use super::order::{Confirmation, ExecTransType, Order, OrderStatus};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

/// Downstream consumers of applied confirmations (position engine, algo
/// runtime, cross reconciliation, protocol publishers). Called in
/// registration order while the book's handle lock is held — sinks must be
/// short and must never call back into [`OrderBook::handle`].
pub trait ConfirmationSink: Send + Sync {
    fn on_confirmation(&self, cm: &Confirmation, ord: &Order);
}

/// The payload journaled per confirmation. The full order is attached on
/// `unconfirmed_new`/`unconfirmed_cancel` so replay can reconstruct orders
/// without the live map.
#[derive(Debug, Serialize, Deserialize)]
pub struct OrderJournalEntry {
    pub cm: Confirmation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
}

/// The global order book. Owns every order for its lifetime.
pub struct OrderBook {
    orders: DashMap<u32, Order>,
    exec_ids: DashSet<(u32, String)>,
    order_id_counter: AtomicU32,
    journal: Journal,
    // Serializes state-mutating confirmation processing (a single global
    // write lock, not per-order).
    handle_mutex: Mutex<()>,
    sinks: OnceLock<Vec<Arc<dyn ConfirmationSink>>>,
}

impl OrderBook {
    /// Open the order journal under `store_dir` and restore the id and
    /// sequence high-water marks.
    pub fn open(store_dir: &Path) -> Result<Self, JournalError> {
        let (journal, scan) = Journal::open(&store_dir.join("orders"))?;
        Ok(Self {
            orders: DashMap::new(),
            exec_ids: DashSet::new(),
            order_id_counter: AtomicU32::new(scan.max_order_id),
            journal,
            handle_mutex: Mutex::new(()),
            sinks: OnceLock::new(),
        })
    }

    /// Register the fan-out targets. Call once during wiring.
    pub fn set_sinks(&self, sinks: Vec<Arc<dyn ConfirmationSink>>) {
        let _ = self.sinks.set(sinks);
    }

    /// Monotone order-id allocator. Restart-safe: the journal scan seeds the
    /// counter past every previously issued id.
    pub fn new_order_id(&self) -> u32 {
        self.order_id_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, id: u32) -> Option<Order> {
        self.orders.get(&id).map(|o| o.clone())
    }

    /// Insert a freshly allocated order. Dispatch calls this before emitting
    /// any confirmation for it.
    pub fn insert(&self, ord: Order) {
        self.orders.insert(ord.id, ord);
    }

    /// Record an adapter-supplied execution id; true if it was seen before.
    pub fn is_dup_exec_id(&self, order_id: u32, exec_id: &str) -> bool {
        !self.exec_ids.insert((order_id, exec_id.to_string()))
    }

    /// Orders currently in a live status.
    pub fn live_orders(&self) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|o| o.is_live())
            .map(|o| o.value().clone())
            .collect()
    }

    /// Orders in one specific status.
    pub fn orders_with_status(&self, status: OrderStatus) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|o| o.status == status)
            .map(|o| o.value().clone())
            .collect()
    }

    /// Apply one confirmation: mutate the order under the global write lock,
    /// journal it, then fan out to the registered sinks.
    pub fn handle(&self, mut cm: Confirmation) {
        if cm.transaction_time == 0 {
            cm.transaction_time = crate::utils::now_micros();
        }
        let _guard = self.handle_mutex.lock();

        let snapshot = {
            let Some(mut ord) = self.orders.get_mut(&cm.order_id) else {
                debug!("unknown order id {} in confirmation, ignored", cm.order_id);
                return;
            };
            if !apply(&mut ord, &mut cm) {
                return;
            }
            ord.clone()
        };

        let entry = OrderJournalEntry {
            order: matches!(
                cm.exec_type,
                OrderStatus::UnconfirmedNew | OrderStatus::UnconfirmedCancel
            )
            .then(|| snapshot.clone()),
            cm,
        };
        let payload = match serde_json::to_vec(&entry) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to encode journal entry: {e}");
                return;
            }
        };
        let mut cm = entry.cm;
        cm.seq = self.journal.append(snapshot.user_id, snapshot.id, &payload);

        if let Some(sinks) = self.sinks.get() {
            for sink in sinks {
                sink.on_confirmation(&cm, &snapshot);
            }
        }
    }

    /// Offline replay of the journal; yields decoded entries at or past
    /// `seq0` for the given user (admins see everything). Never mutates live
    /// state.
    pub fn replay(
        &self,
        seq0: u32,
        user_id: u16,
        is_admin: bool,
        mut f: impl FnMut(u32, &OrderJournalEntry),
    ) -> Result<(), JournalError> {
        self.journal.replay(seq0, user_id, is_admin, |rec| {
            match serde_json::from_slice::<OrderJournalEntry>(&rec.payload) {
                Ok(entry) => f(rec.seq, &entry),
                Err(e) => warn!("undecodable journal record seq {}: {e}", rec.seq),
            }
        })
    }

    /// Load the previous session's exec ids from the journal into the dedup
    /// set, so fills replayed late across a restart are still suppressed.
    /// Called once when a fresh session file is created.
    pub fn load_previous_exec_ids(&self) -> Result<usize, JournalError> {
        let mut n = 0usize;
        self.journal.replay(0, 0, true, |rec: &JournalRecord| {
            if let Ok(entry) = serde_json::from_slice::<OrderJournalEntry>(&rec.payload) {
                if entry.cm.is_fill() && !entry.cm.exec_id.is_empty() {
                    self.exec_ids
                        .insert((entry.cm.order_id, entry.cm.exec_id.clone()));
                    n += 1;
                }
            }
        })?;
        Ok(n)
    }

    /// Current journal sequence high-water.
    pub fn seq(&self) -> u32 {
        self.journal.seq()
    }

    /// Block until the journal writer drained its queue (tests, shutdown).
    pub fn sync_journal(&self) {
        self.journal.flush();
    }
}

/// Apply the order state machine. Returns false when the confirmation must
/// be dropped (e.g. an unusable exec type).
fn apply(ord: &mut Order, cm: &mut Confirmation) -> bool {
    match cm.exec_type {
        OrderStatus::PartiallyFilled | OrderStatus::Filled => match cm.exec_trans_type {
            ExecTransType::New => {
                let prev_cum = ord.cum_qty;
                ord.cum_qty += cm.last_shares;
                ord.leaves_qty = (ord.leaves_qty - cm.last_shares).max(0.0);
                if ord.cum_qty > 0.0 {
                    ord.avg_px =
                        (ord.avg_px * prev_cum + cm.last_px * cm.last_shares) / ord.cum_qty;
                }
                if ord.leaves_qty > 1e-9 {
                    ord.status = OrderStatus::PartiallyFilled;
                    cm.exec_type = OrderStatus::PartiallyFilled;
                } else {
                    ord.status = OrderStatus::Filled;
                    cm.exec_type = OrderStatus::Filled;
                }
            }
            ExecTransType::Cancel => {
                // Cancel-bust backs the execution out.
                ord.cum_qty = (ord.cum_qty - cm.last_shares).max(0.0);
                if ord.status == OrderStatus::Filled && ord.cum_qty < ord.qty() {
                    ord.status = OrderStatus::PartiallyFilled;
                }
            }
            _ => return false,
        },
        OrderStatus::Canceled
        | OrderStatus::Rejected
        | OrderStatus::Expired
        | OrderStatus::DoneForDay
        | OrderStatus::Calculated
        | OrderStatus::RiskRejected => {
            // A stale terminal callback racing a fill loses: once the order
            // left the live set it cannot be re-terminated.
            if !ord.is_live() && ord.status != OrderStatus::Unknown {
                debug!(
                    "order {} is not live, {:?} confirmation dropped",
                    ord.id, cm.exec_type
                );
                return false;
            }
            cm.leaves_qty = ord.leaves_qty;
            ord.leaves_qty = 0.0;
            ord.status = cm.exec_type;
        }
        OrderStatus::PendingNew
        | OrderStatus::New
        | OrderStatus::PendingCancel
        | OrderStatus::Suspended
        | OrderStatus::CancelRejected => {
            if !ord.is_live() && ord.status != OrderStatus::Unknown {
                debug!(
                    "order {} is not live, {:?} confirmation dropped",
                    ord.id, cm.exec_type
                );
                return false;
            }
            ord.status = cm.exec_type;
        }
        // The unconfirmed transitions are dispatch-driven and always apply
        // (the cancel-retry path resurrects a risk-rejected cancel order).
        OrderStatus::UnconfirmedNew | OrderStatus::UnconfirmedCancel => {
            ord.status = cm.exec_type;
        }
        OrderStatus::Unknown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{Contract, Side};
    use std::sync::atomic::AtomicUsize;

    fn book() -> (OrderBook, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (OrderBook::open(dir.path()).unwrap(), dir)
    }

    fn new_order(book: &OrderBook, qty: f64, px: f64) -> u32 {
        let id = book.new_order_id();
        let mut ord = Order::from_contract(
            Contract {
                security_id: 1,
                sub_account_id: 1,
                qty,
                price: px,
                side: Side::Buy,
                ..Default::default()
            },
            1,
        );
        ord.id = id;
        ord.leaves_qty = qty;
        book.insert(ord);
        book.handle(Confirmation::status(id, OrderStatus::UnconfirmedNew, "", 0));
        id
    }

    #[test]
    fn test_order_ids_monotone_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let last = {
            let book = OrderBook::open(dir.path()).unwrap();
            let a = new_order(&book, 10.0, 1.0);
            let b = new_order(&book, 10.0, 1.0);
            assert!(b > a);
            book.sync_journal();
            b
        };
        let book = OrderBook::open(dir.path()).unwrap();
        assert!(book.new_order_id() > last);
    }

    #[test]
    fn test_partial_then_full_fill() {
        let (book, _dir) = book();
        let id = new_order(&book, 100.0, 10.0);
        book.handle(Confirmation::fill(id, 40.0, 10.0, "X1", ExecTransType::New, 0));
        let ord = book.get(id).unwrap();
        assert_eq!(ord.status, OrderStatus::PartiallyFilled);
        assert_eq!(ord.cum_qty, 40.0);
        assert_eq!(ord.leaves_qty, 60.0);

        book.handle(Confirmation::fill(id, 60.0, 10.0, "X2", ExecTransType::New, 0));
        let ord = book.get(id).unwrap();
        assert_eq!(ord.status, OrderStatus::Filled);
        assert_eq!(ord.cum_qty, 100.0);
        assert_eq!(ord.leaves_qty, 0.0);
        assert_eq!(ord.avg_px, 10.0);
        assert!(book.live_orders().is_empty());
    }

    #[test]
    fn test_avg_px_share_weighted() {
        let (book, _dir) = book();
        let id = new_order(&book, 100.0, 10.0);
        book.handle(Confirmation::fill(id, 50.0, 10.0, "X1", ExecTransType::New, 0));
        book.handle(Confirmation::fill(id, 50.0, 11.0, "X2", ExecTransType::New, 0));
        let ord = book.get(id).unwrap();
        assert!((ord.avg_px - 10.5).abs() < 1e-12);
    }

    #[test]
    fn test_cancel_captures_leaves() {
        let (book, _dir) = book();
        let id = new_order(&book, 100.0, 10.0);
        book.handle(Confirmation::fill(id, 30.0, 10.0, "X1", ExecTransType::New, 0));

        struct Capture(AtomicUsize, Mutex<f64>);
        impl ConfirmationSink for Capture {
            fn on_confirmation(&self, cm: &Confirmation, _ord: &Order) {
                if cm.exec_type == OrderStatus::Canceled {
                    self.0.fetch_add(1, Ordering::Relaxed);
                    if let Ok(mut v) = self.1.lock() {
                        *v = cm.leaves_qty;
                    }
                }
            }
        }
        let capture = Arc::new(Capture(AtomicUsize::new(0), Mutex::new(0.0)));
        book.set_sinks(vec![capture.clone() as Arc<dyn ConfirmationSink>]);

        book.handle(Confirmation::status(id, OrderStatus::Canceled, "", 0));
        let ord = book.get(id).unwrap();
        assert_eq!(ord.status, OrderStatus::Canceled);
        assert_eq!(ord.leaves_qty, 0.0);
        assert_eq!(capture.0.load(Ordering::Relaxed), 1);
        assert_eq!(*capture.1.lock().unwrap(), 70.0);
    }

    #[test]
    fn test_dup_exec_id_suppression() {
        let (book, _dir) = book();
        assert!(!book.is_dup_exec_id(1, "X1"));
        assert!(book.is_dup_exec_id(1, "X1"));
        assert!(!book.is_dup_exec_id(2, "X1"));
        assert!(!book.is_dup_exec_id(1, "X2"));
    }

    #[test]
    fn test_unknown_order_dropped() {
        let (book, _dir) = book();
        let seq = book.seq();
        book.handle(Confirmation::fill(999, 10.0, 1.0, "X", ExecTransType::New, 0));
        assert_eq!(book.seq(), seq);
    }

    #[test]
    fn test_bust_reopens_filled_order() {
        let (book, _dir) = book();
        let id = new_order(&book, 100.0, 10.0);
        book.handle(Confirmation::fill(id, 100.0, 10.0, "X1", ExecTransType::New, 0));
        assert_eq!(book.get(id).unwrap().status, OrderStatus::Filled);
        book.handle(Confirmation::fill(id, 40.0, 10.0, "X2", ExecTransType::Cancel, 0));
        let ord = book.get(id).unwrap();
        assert_eq!(ord.cum_qty, 60.0);
        assert_eq!(ord.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_replay_decodes_entries() {
        let (book, _dir) = book();
        let id = new_order(&book, 100.0, 10.0);
        book.handle(Confirmation::fill(id, 100.0, 10.0, "X1", ExecTransType::New, 0));

        let mut seen = Vec::new();
        book.replay(0, 1, false, |seq, entry| {
            seen.push((seq, entry.cm.exec_type));
        })
        .unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, OrderStatus::UnconfirmedNew);
        assert_eq!(seen[1].1, OrderStatus::Filled);

        let mut has_order = false;
        book.replay(0, 1, false, |_, entry| {
            if entry.cm.exec_type == OrderStatus::UnconfirmedNew {
                has_order = entry.order.is_some();
            }
        })
        .unwrap();
        assert!(has_order);
    }

    #[test]
    fn test_previous_exec_ids_loaded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let book = OrderBook::open(dir.path()).unwrap();
            let id = new_order(&book, 100.0, 10.0);
            book.handle(Confirmation::fill(
                id,
                100.0,
                10.0,
                "PREV-1",
                ExecTransType::New,
                0,
            ));
            book.sync_journal();
        }
        let book = OrderBook::open(dir.path()).unwrap();
        let n = book.load_previous_exec_ids().unwrap();
        assert_eq!(n, 1);
        // A replayed fill with the prior exec id is now a duplicate.
        assert!(book.is_dup_exec_id(1, "PREV-1"));
    }
}
