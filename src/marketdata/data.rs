//! Market-data records: the 4-byte source tag, per-security trade/depth
//! cells and their plain snapshots.
//!
//! Live cells are individually-atomic `AtomicCell<f64>` fields: writers
//! (adapter threads) update in place, readers snapshot without locking and
//! accept slightly-stale or torn multi-field reads. The contract is eventual
//! convergence, never read-path locking.

use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Number of depth levels kept per (source, security).
pub const DEPTH_SIZE: usize = 5;

/// A market-data source tag: up to 4 ASCII bytes packed into a u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataSrc(pub u32);

impl DataSrc {
    /// Pack a short ASCII name; bytes beyond the fourth are ignored.
    pub fn from_name(name: &str) -> Self {
        let mut v = 0u32;
        for b in name.bytes().take(4).rev() {
            v = (v << 8) + u32::from(b);
        }
        DataSrc(v)
    }

    /// Unpack back to the ASCII name.
    pub fn name(&self) -> String {
        let mut out = String::new();
        let mut v = self.0;
        while v != 0 {
            out.push((v & 0xFF) as u8 as char);
            v >>= 8;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for DataSrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Plain trade aggregate snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Trade {
    pub qty: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub vwap: f64,
    pub volume: f64,
}

impl Trade {
    /// Whether a trade notification is due relative to `prev`.
    pub fn changed(&self, prev: &Trade) -> bool {
        self.volume != prev.volume
            || self.close != prev.close
            || self.high != prev.high
            || self.low != prev.low
    }
}

/// Plain one-level quote snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Quote {
    pub ask_price: f64,
    pub ask_size: f64,
    pub bid_price: f64,
    pub bid_size: f64,
}

/// A full market-data snapshot: what algo callbacks and the protocol see.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MdSnapshot {
    pub tm: i64,
    pub trade: Trade,
    pub depth: [Quote; DEPTH_SIZE],
}

impl MdSnapshot {
    /// Top of book.
    pub fn quote(&self) -> &Quote {
        &self.depth[0]
    }

    /// Midpoint of the top of book when both sides are present.
    pub fn mid(&self) -> f64 {
        let q = self.quote();
        if q.ask_price > q.bid_price && q.bid_price > 0.0 {
            (q.ask_price + q.bid_price) / 2.0
        } else {
            0.0
        }
    }
}

/// Inline trade-tick hooks. Not guaranteed to run on the owning algo's
/// shard; they must be cheap and post long work elsewhere.
pub trait TradeTickHook: Send + Sync {
    fn on_trade(&self, src: DataSrc, security_id: u32, md: &MdSnapshot, tm: i64, px: f64, qty: f64);
}

struct TradeCells {
    qty: AtomicCell<f64>,
    open: AtomicCell<f64>,
    high: AtomicCell<f64>,
    low: AtomicCell<f64>,
    close: AtomicCell<f64>,
    vwap: AtomicCell<f64>,
    volume: AtomicCell<f64>,
}

impl Default for TradeCells {
    fn default() -> Self {
        Self {
            qty: AtomicCell::new(0.0),
            open: AtomicCell::new(0.0),
            high: AtomicCell::new(0.0),
            low: AtomicCell::new(0.0),
            close: AtomicCell::new(0.0),
            vwap: AtomicCell::new(0.0),
            volume: AtomicCell::new(0.0),
        }
    }
}

struct QuoteCells {
    ask_price: AtomicCell<f64>,
    ask_size: AtomicCell<f64>,
    bid_price: AtomicCell<f64>,
    bid_size: AtomicCell<f64>,
}

impl Default for QuoteCells {
    fn default() -> Self {
        Self {
            ask_price: AtomicCell::new(0.0),
            ask_size: AtomicCell::new(0.0),
            bid_price: AtomicCell::new(0.0),
            bid_size: AtomicCell::new(0.0),
        }
    }
}

/// The live per-(source, security) market-data record.
#[derive(Default)]
pub struct MarketData {
    tm: AtomicI64,
    trade: TradeCells,
    depth: [QuoteCells; DEPTH_SIZE],
    hooks: Mutex<Vec<Arc<dyn TradeTickHook>>>,
}

impl MarketData {
    pub fn touch(&self, tm: i64) {
        self.tm.store(tm, Ordering::Relaxed);
    }

    /// First nonzero px becomes the open; high/low track extremes; close is
    /// always the last px.
    pub fn update_px(&self, last_px: f64) {
        if self.trade.open.load() == 0.0 {
            self.trade.open.store(last_px);
        }
        if last_px > self.trade.high.load() {
            self.trade.high.store(last_px);
        }
        let low = self.trade.low.load();
        if last_px < low || low == 0.0 {
            self.trade.low.store(last_px);
        }
        self.trade.close.store(last_px);
    }

    /// Share-weighted vwap; volume accumulates.
    pub fn update_volume(&self, last_qty: f64) {
        self.trade.qty.store(last_qty);
        if last_qty > 0.0 {
            let volume = self.trade.volume.load();
            let vwap = self.trade.vwap.load();
            let close = self.trade.close.load();
            self.trade
                .vwap
                .store((volume * vwap + close * last_qty) / (volume + last_qty));
            self.trade.volume.store(volume + last_qty);
        }
    }

    /// Seed the aggregate from a feed that only delivers totals.
    pub fn seed_aggregate(
        &self,
        last_px: f64,
        volume: f64,
        open: f64,
        high: f64,
        low: f64,
        vwap: f64,
    ) {
        self.trade.volume.store(volume);
        self.trade.open.store(open);
        self.trade.high.store(high);
        self.trade.low.store(low);
        self.trade.close.store(last_px);
        self.trade.vwap.store(vwap);
    }

    pub fn volume(&self) -> f64 {
        self.trade.volume.load()
    }

    pub fn close(&self) -> f64 {
        self.trade.close.load()
    }

    pub fn set_quote(&self, level: usize, q: Quote) {
        let cells = &self.depth[level];
        cells.ask_price.store(q.ask_price);
        cells.ask_size.store(q.ask_size);
        cells.bid_price.store(q.bid_price);
        cells.bid_size.store(q.bid_size);
    }

    pub fn set_side(&self, level: usize, price: f64, size: f64, is_bid: bool) {
        let cells = &self.depth[level];
        if is_bid {
            cells.bid_price.store(price);
            cells.bid_size.store(size);
        } else {
            cells.ask_price.store(price);
            cells.ask_size.store(size);
        }
    }

    pub fn set_ask_price(&self, v: f64) {
        self.depth[0].ask_price.store(v);
    }

    pub fn set_ask_size(&self, v: f64) {
        self.depth[0].ask_size.store(v);
    }

    pub fn set_bid_price(&self, v: f64) {
        self.depth[0].bid_price.store(v);
    }

    pub fn set_bid_size(&self, v: f64) {
        self.depth[0].bid_size.store(v);
    }

    pub fn quote(&self, level: usize) -> Quote {
        let cells = &self.depth[level];
        Quote {
            ask_price: cells.ask_price.load(),
            ask_size: cells.ask_size.load(),
            bid_price: cells.bid_price.load(),
            bid_size: cells.bid_size.load(),
        }
    }

    /// A full plain snapshot; torn reads across fields are tolerated.
    pub fn snapshot(&self) -> MdSnapshot {
        let mut depth = [Quote::default(); DEPTH_SIZE];
        for (i, q) in depth.iter_mut().enumerate() {
            *q = self.quote(i);
        }
        MdSnapshot {
            tm: self.tm.load(Ordering::Relaxed),
            trade: Trade {
                qty: self.trade.qty.load(),
                open: self.trade.open.load(),
                high: self.trade.high.load(),
                low: self.trade.low.load(),
                close: self.trade.close.load(),
                vwap: self.trade.vwap.load(),
                volume: self.trade.volume.load(),
            },
            depth,
        }
    }

    pub fn hook_trade_tick(&self, hook: Arc<dyn TradeTickHook>) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(hook);
        }
    }

    pub fn unhook_trade_tick(&self, hook: &Arc<dyn TradeTickHook>) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.retain(|h| !Arc::ptr_eq(h, hook));
        }
    }

    /// Run attached hooks inline with the trade that fired them.
    pub fn run_trade_hooks(&self, src: DataSrc, security_id: u32) {
        let hooks: Vec<_> = match self.hooks.lock() {
            Ok(hooks) if !hooks.is_empty() => hooks.clone(),
            _ => return,
        };
        let snap = self.snapshot();
        for hook in hooks {
            hook.on_trade(
                src,
                security_id,
                &snap,
                snap.tm,
                snap.trade.close,
                snap.trade.qty,
            );
        }
    }
}
