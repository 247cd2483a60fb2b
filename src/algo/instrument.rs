//! An algo's view of one (source, security) pair, carrying per-algo
//! execution accounting.

use crate::marketdata::DataSrc;
use crate::utils::round6;
use crossbeam::atomic::AtomicCell;
use std::collections::HashSet;
use std::sync::Mutex;

/// Per-algo instrument accounting. Counters are individually-atomic cells;
/// the confirmation handler mutates them inside its short critical section,
/// algo callbacks read them freely.
pub struct Instrument {
    pub id: u64,
    pub algo_id: u32,
    pub security_id: u32,
    pub src: DataSrc,
    active_orders: Mutex<HashSet<u32>>,
    bought_qty: AtomicCell<f64>,
    sold_qty: AtomicCell<f64>,
    bought_cx_qty: AtomicCell<f64>,
    sold_cx_qty: AtomicCell<f64>,
    // Cross orders never contribute to outstanding.
    outstanding_buy_qty: AtomicCell<f64>,
    outstanding_sell_qty: AtomicCell<f64>,
}

impl Instrument {
    pub fn new(id: u64, algo_id: u32, security_id: u32, src: DataSrc) -> Self {
        Self {
            id,
            algo_id,
            security_id,
            src,
            active_orders: Mutex::new(HashSet::new()),
            bought_qty: AtomicCell::new(0.0),
            sold_qty: AtomicCell::new(0.0),
            bought_cx_qty: AtomicCell::new(0.0),
            sold_cx_qty: AtomicCell::new(0.0),
            outstanding_buy_qty: AtomicCell::new(0.0),
            outstanding_sell_qty: AtomicCell::new(0.0),
        }
    }

    /// Order ids of this instrument's live (non-cross) orders.
    pub fn active_orders(&self) -> Vec<u32> {
        self.active_orders
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_active_orders(&self) -> bool {
        self.active_orders.lock().map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub(crate) fn add_order(&self, id: u32) {
        if let Ok(mut s) = self.active_orders.lock() {
            s.insert(id);
        }
    }

    pub(crate) fn remove_order(&self, id: u32) {
        if let Ok(mut s) = self.active_orders.lock() {
            s.remove(&id);
        }
    }

    pub fn bought_qty(&self) -> f64 {
        self.bought_qty.load()
    }

    pub fn sold_qty(&self) -> f64 {
        self.sold_qty.load()
    }

    pub fn outstanding_buy_qty(&self) -> f64 {
        self.outstanding_buy_qty.load()
    }

    pub fn outstanding_sell_qty(&self) -> f64 {
        self.outstanding_sell_qty.load()
    }

    pub fn net_qty(&self) -> f64 {
        round6(self.bought_qty.load() - self.sold_qty.load())
    }

    pub fn total_qty(&self) -> f64 {
        round6(self.bought_qty.load() + self.sold_qty.load())
    }

    pub fn net_cx_qty(&self) -> f64 {
        round6(self.bought_cx_qty.load() - self.sold_cx_qty.load())
    }

    pub fn total_cx_qty(&self) -> f64 {
        round6(self.bought_cx_qty.load() + self.sold_cx_qty.load())
    }

    pub fn net_outstanding_qty(&self) -> f64 {
        round6(self.outstanding_buy_qty.load() - self.outstanding_sell_qty.load())
    }

    pub fn total_outstanding_qty(&self) -> f64 {
        round6(self.outstanding_buy_qty.load() + self.outstanding_sell_qty.load())
    }

    /// Everything the algo has committed: traded twice-counted cross flow
    /// removed, plus what still rests in the market.
    pub fn total_exposure(&self) -> f64 {
        round6(self.total_qty() - self.total_cx_qty() + self.total_outstanding_qty())
    }

    pub(crate) fn add_outstanding(&self, is_buy: bool, qty: f64) {
        let cell = if is_buy {
            &self.outstanding_buy_qty
        } else {
            &self.outstanding_sell_qty
        };
        cell.store(cell.load() + qty);
    }

    pub(crate) fn release_outstanding(&self, is_buy: bool, leaves_qty: f64) {
        self.add_outstanding(is_buy, -leaves_qty);
    }

    pub(crate) fn apply_fill(&self, is_buy: bool, qty: f64) {
        if is_buy {
            self.outstanding_buy_qty
                .store(self.outstanding_buy_qty.load() - qty);
            self.bought_qty.store(self.bought_qty.load() + qty);
        } else {
            self.outstanding_sell_qty
                .store(self.outstanding_sell_qty.load() - qty);
            self.sold_qty.store(self.sold_qty.load() + qty);
        }
    }

    pub(crate) fn apply_bust(&self, is_buy: bool, qty: f64) {
        if is_buy {
            self.bought_qty.store(self.bought_qty.load() - qty);
        } else {
            self.sold_qty.store(self.sold_qty.load() - qty);
        }
    }

    pub(crate) fn apply_cx_fill(&self, is_buy: bool, qty: f64) {
        if is_buy {
            self.bought_qty.store(self.bought_qty.load() + qty);
            self.bought_cx_qty.store(self.bought_cx_qty.load() + qty);
        } else {
            self.sold_qty.store(self.sold_qty.load() + qty);
            self.sold_cx_qty.store(self.sold_cx_qty.load() + qty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst() -> Instrument {
        Instrument::new(1, 1, 1, DataSrc::from_name("X"))
    }

    #[test]
    fn test_fill_cycle_balances() {
        let i = inst();
        i.add_outstanding(true, 100.0);
        assert_eq!(i.outstanding_buy_qty(), 100.0);
        assert_eq!(i.total_exposure(), 100.0);

        i.apply_fill(true, 40.0);
        assert_eq!(i.outstanding_buy_qty(), 60.0);
        assert_eq!(i.bought_qty(), 40.0);
        assert_eq!(i.total_exposure(), 100.0);

        i.release_outstanding(true, 60.0);
        assert_eq!(i.outstanding_buy_qty(), 0.0);
        assert_eq!(i.total_exposure(), 40.0);
    }

    #[test]
    fn test_bust_reduces_traded() {
        let i = inst();
        i.add_outstanding(false, 50.0);
        i.apply_fill(false, 50.0);
        assert_eq!(i.sold_qty(), 50.0);
        i.apply_bust(false, 20.0);
        assert_eq!(i.sold_qty(), 30.0);
        assert_eq!(i.net_qty(), -30.0);
    }

    #[test]
    fn test_cx_fills_cancel_out_of_exposure() {
        let i = inst();
        i.apply_cx_fill(true, 60.0);
        assert_eq!(i.bought_qty(), 60.0);
        assert_eq!(i.total_cx_qty(), 60.0);
        assert_eq!(i.net_cx_qty(), 60.0);
        // Crossed flow does not count toward exposure.
        assert_eq!(i.total_exposure(), 0.0);
        assert_eq!(i.total_qty(), 60.0);
    }

    #[test]
    fn test_active_order_tracking() {
        let i = inst();
        i.add_order(5);
        i.add_order(6);
        assert!(i.has_active_orders());
        let mut ids = i.active_orders();
        ids.sort_unstable();
        assert_eq!(ids, vec![5, 6]);
        i.remove_order(5);
        i.remove_order(6);
        assert!(!i.has_active_orders());
    }
}
