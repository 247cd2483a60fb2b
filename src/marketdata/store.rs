//! The market-data store: per-source books, feed registry and routing,
//! held subscriptions and every adapter-facing update entry point.

use super::data::{DataSrc, MarketData, MdSnapshot, Quote};
use crate::algo::AlgoManager;
use crate::catalog::{Catalog, Security};
use crate::consolidation::ConsolidationManager;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("invalid market data src: {0}, maximum length is 4")]
    InvalidSrc(String),
    #[error("duplicate market data feed: {0}")]
    DuplicateFeed(String),
}

/// A market-data adapter. Runs its own I/O threads and pushes updates into
/// the store; the store owns subscription bookkeeping so interest survives
/// disconnects.
pub trait MarketDataFeed: Send + Sync {
    fn name(&self) -> &str;
    fn src(&self) -> DataSrc;
    fn connected(&self) -> bool;
    fn reconnect(&self) {}
    /// Ask the venue for data on one security. Called only while connected;
    /// queued interest is flushed via [`MarketDataStore::resubscribe_all`].
    fn subscribe_sync(&self, sec: &Security);
    fn start(&self) {}
}

type SrcBook = DashMap<u32, Arc<MarketData>>;

/// Per-source, per-security latest trade & depth, plus the feed registry.
pub struct MarketDataStore {
    catalog: Arc<Catalog>,
    books: DashMap<u32, Arc<SrcBook>>,
    feeds: DashMap<String, Arc<dyn MarketDataFeed>>,
    /// (src, exchange) → feeds serving it; securities shard across them.
    routes: DashMap<(u32, u16), Vec<String>>,
    /// Held subscriptions per feed, flushed on (re)connect.
    subs: DashMap<String, DashSet<u32>>,
    default_feed: OnceLock<String>,
    /// Source index for fast per-source positions in the consolidation book.
    srcs: DashMap<u32, u8>,
    // Weak: the algo manager holds this store by Arc.
    algos: OnceLock<Weak<AlgoManager>>,
    consolidation: OnceLock<Arc<ConsolidationManager>>,
}

impl MarketDataStore {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            books: DashMap::new(),
            feeds: DashMap::new(),
            routes: DashMap::new(),
            subs: DashMap::new(),
            default_feed: OnceLock::new(),
            srcs: DashMap::new(),
            algos: OnceLock::new(),
            consolidation: OnceLock::new(),
        }
    }

    /// Late wiring of the algo runtime (set once by the composition root).
    pub fn set_algos(&self, algos: &Arc<AlgoManager>) {
        let _ = self.algos.set(Arc::downgrade(algos));
    }

    /// Late wiring of the consolidation manager.
    pub fn set_consolidation(&self, consolidation: Arc<ConsolidationManager>) {
        let _ = self.consolidation.set(consolidation);
    }

    /// Register a feed. `markets` is the comma-separated exchange-name list
    /// from the adapter config; unknown names are skipped with a warning.
    pub fn add_feed(
        &self,
        feed: Arc<dyn MarketDataFeed>,
        markets: &str,
    ) -> Result<(), MarketDataError> {
        let name = feed.name().to_string();
        let src = feed.src();
        if src.name().len() > 4 {
            return Err(MarketDataError::InvalidSrc(src.name()));
        }
        if self.feeds.contains_key(&name) {
            return Err(MarketDataError::DuplicateFeed(name));
        }
        let _ = self.default_feed.set(name.clone());
        if !src.is_empty() && !self.srcs.contains_key(&src.0) {
            let idx = self.srcs.len() as u8;
            self.srcs.insert(src.0, idx);
            info!("market data feed {name} src={src}");
        }
        for tok in markets.split(|c| c == ',' || c == ';') {
            let tok = tok.trim().to_uppercase();
            if tok.is_empty() {
                continue;
            }
            match self.catalog.securities.exchange_by_name(&tok) {
                Some(ex) => self
                    .routes
                    .entry((src.0, ex.id))
                    .or_default()
                    .push(name.clone()),
                None => warn!("unknown market name: {tok}, ignored"),
            }
        }
        self.subs.insert(name.clone(), DashSet::new());
        self.feeds.insert(name, feed);
        Ok(())
    }

    pub fn feed(&self, name: &str) -> Option<Arc<dyn MarketDataFeed>> {
        self.feeds.get(name).map(|f| f.clone())
    }

    pub fn feeds(&self) -> Vec<Arc<dyn MarketDataFeed>> {
        self.feeds.iter().map(|f| f.value().clone()).collect()
    }

    pub fn default_feed(&self) -> Option<Arc<dyn MarketDataFeed>> {
        self.default_feed.get().and_then(|n| self.feed(n))
    }

    /// Index of a source in registration order (consolidation bookkeeping).
    pub fn src_index(&self, src: DataSrc) -> Option<u8> {
        self.srcs.get(&src.0).map(|i| *i)
    }

    fn route(&self, sec: &Security, src: DataSrc) -> Option<Arc<dyn MarketDataFeed>> {
        if let Some(names) = self.routes.get(&(src.0, sec.exchange_id)) {
            if !names.is_empty() {
                let name = &names[sec.id as usize % names.len()];
                return self.feed(name);
            }
        }
        self.default_feed()
    }

    /// Record interest of `src` in a security and ask the serving feed for
    /// it. Disconnected feeds keep the interest queued. Returns the source
    /// the data will actually arrive under.
    pub fn subscribe(&self, sec: &Security, src: DataSrc) -> Option<DataSrc> {
        let feed = self.route(sec, src)?;
        if let Some(subs) = self.subs.get(feed.name()) {
            if subs.insert(sec.id) && feed.connected() {
                feed.subscribe_sync(sec);
            }
        }
        Some(feed.src())
    }

    /// Flush every held subscription of a feed; adapters call this from
    /// their reconnect path.
    pub fn resubscribe_all(&self, feed_name: &str) {
        let Some(feed) = self.feed(feed_name) else {
            return;
        };
        if let Some(subs) = self.subs.get(feed_name) {
            for id in subs.iter() {
                if let Some(sec) = self.catalog.security(*id) {
                    feed.subscribe_sync(&sec);
                }
            }
        }
    }

    fn book(&self, src: DataSrc) -> Arc<SrcBook> {
        self.books.entry(src.0).or_default().clone()
    }

    /// The live record for (source, security), created on first touch.
    pub fn get(&self, src: DataSrc, security_id: u32) -> Arc<MarketData> {
        self.book(src).entry(security_id).or_default().clone()
    }

    /// A plain snapshot; an untouched record reads as zeros.
    pub fn snapshot(&self, src: DataSrc, security_id: u32) -> MdSnapshot {
        self.get(src, security_id).snapshot()
    }

    /// Last trade from the default source, falling back to the static close.
    pub fn current_price(&self, sec: &Security) -> f64 {
        let src = self
            .default_feed()
            .map(|f| f.src())
            .unwrap_or_default();
        let close = self.get(src, sec.id).close();
        if close > 0.0 {
            close
        } else {
            sec.close_price
        }
    }

    fn notify(&self, src: DataSrc, security_id: u32) {
        if let Some(algos) = self.algos.get().and_then(Weak::upgrade) {
            if algos.is_subscribed(src, security_id) {
                algos.touch(src, security_id);
            }
        }
    }

    fn notify_consolidation(&self, src: DataSrc, security_id: u32, md: &MarketData) {
        if let Some(cons) = self.consolidation.get() {
            cons.on_quote(src, security_id, md.quote(0));
        }
    }

    /// Full-quote update for one depth level; level ≥ 5 is refused.
    pub fn update_quote(&self, src: DataSrc, security_id: u32, level: usize, q: Quote) {
        if level >= super::data::DEPTH_SIZE {
            return;
        }
        let md = self.get(src, security_id);
        if md.quote(level) == q {
            return;
        }
        md.set_quote(level, q);
        md.touch(crate::utils::now_secs());
        if level != 0 {
            return;
        }
        self.notify_consolidation(src, security_id, &md);
        self.notify(src, security_id);
    }

    /// One-sided depth update.
    pub fn update_side(
        &self,
        src: DataSrc,
        security_id: u32,
        level: usize,
        price: f64,
        size: f64,
        is_bid: bool,
    ) {
        if level >= super::data::DEPTH_SIZE {
            return;
        }
        let md = self.get(src, security_id);
        md.set_side(level, price, size, is_bid);
        md.touch(crate::utils::now_secs());
        if level != 0 {
            return;
        }
        self.notify_consolidation(src, security_id, &md);
        self.notify(src, security_id);
    }

    /// Trade print: updates px/volume aggregates, runs inline hooks, then
    /// notifies subscribers.
    pub fn update_trade(&self, src: DataSrc, security_id: u32, last_px: f64, last_qty: f64) {
        let md = self.get(src, security_id);
        md.touch(crate::utils::now_secs());
        if last_px > 0.0 {
            md.update_px(last_px);
        }
        if last_qty > 0.0 {
            md.update_volume(last_qty);
        }
        md.run_trade_hooks(src, security_id);
        self.notify(src, security_id);
    }

    /// Aggregate update from feeds that deliver session totals; the volume
    /// delta is replayed as a trade.
    pub fn update_trade_aggregate(
        &self,
        src: DataSrc,
        security_id: u32,
        last_px: f64,
        volume: f64,
        open: f64,
        high: f64,
        low: f64,
        vwap: f64,
    ) {
        let md = self.get(src, security_id);
        let delta = volume - md.volume();
        if delta <= 0.0 {
            return;
        }
        if md.volume() == 0.0 {
            md.seed_aggregate(last_px, volume, open, high, low, vwap);
            return;
        }
        self.update_trade(src, security_id, last_px, delta);
    }

    /// Piecemeal field setters for protocols that deliver one field at a
    /// time.
    pub fn update_ask_price(&self, src: DataSrc, security_id: u32, v: f64) {
        let md = self.get(src, security_id);
        md.touch(crate::utils::now_secs());
        md.set_ask_price(v);
        self.notify_consolidation(src, security_id, &md);
        self.notify(src, security_id);
    }

    pub fn update_ask_size(&self, src: DataSrc, security_id: u32, v: f64) {
        let md = self.get(src, security_id);
        md.touch(crate::utils::now_secs());
        md.set_ask_size(v);
        self.notify_consolidation(src, security_id, &md);
        self.notify(src, security_id);
    }

    pub fn update_bid_price(&self, src: DataSrc, security_id: u32, v: f64) {
        let md = self.get(src, security_id);
        md.touch(crate::utils::now_secs());
        md.set_bid_price(v);
        self.notify_consolidation(src, security_id, &md);
        self.notify(src, security_id);
    }

    pub fn update_bid_size(&self, src: DataSrc, security_id: u32, v: f64) {
        let md = self.get(src, security_id);
        md.touch(crate::utils::now_secs());
        md.set_bid_size(v);
        self.notify_consolidation(src, security_id, &md);
        self.notify(src, security_id);
    }

    pub fn update_last_price(&self, src: DataSrc, security_id: u32, v: f64) {
        if v <= 0.0 {
            return;
        }
        let md = self.get(src, security_id);
        md.touch(crate::utils::now_secs());
        md.update_px(v);
        self.notify(src, security_id);
    }

    pub fn update_last_size(&self, src: DataSrc, security_id: u32, v: f64) {
        if v <= 0.0 {
            return;
        }
        let md = self.get(src, security_id);
        md.touch(crate::utils::now_secs());
        md.update_volume(v);
        self.notify(src, security_id);
    }

    /// Quote-driven feeds without trade prints use the mid as the last px.
    pub fn update_mid_as_last(&self, src: DataSrc, security_id: u32) {
        let md = self.get(src, security_id);
        let q = md.quote(0);
        if q.ask_price > q.bid_price && q.bid_price > 0.0 {
            md.update_px((q.ask_price + q.bid_price) / 2.0);
            md.touch(crate::utils::now_secs());
            self.notify(src, security_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Exchange;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestFeed {
        name: String,
        src: DataSrc,
        connected: AtomicBool,
        sub_calls: AtomicUsize,
    }

    impl TestFeed {
        fn new(name: &str, src: &str, connected: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                src: DataSrc::from_name(src),
                connected: AtomicBool::new(connected),
                sub_calls: AtomicUsize::new(0),
            })
        }
    }

    impl MarketDataFeed for TestFeed {
        fn name(&self) -> &str {
            &self.name
        }
        fn src(&self) -> DataSrc {
            self.src
        }
        fn connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }
        fn subscribe_sync(&self, _sec: &Security) {
            self.sub_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn store_with_catalog() -> (MarketDataStore, Arc<Catalog>) {
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
            close_price: 9.5,
            ..Default::default()
        });
        (MarketDataStore::new(catalog.clone()), catalog)
    }

    #[test]
    fn test_subscribe_held_until_connected() {
        let (store, catalog) = store_with_catalog();
        let feed = TestFeed::new("md-x", "X", false);
        store.add_feed(feed.clone(), "NYSE").unwrap();

        let sec = catalog.security(1).unwrap();
        store.subscribe(&sec, DataSrc::from_name("X"));
        assert_eq!(feed.sub_calls.load(Ordering::Relaxed), 0);

        feed.connected.store(true, Ordering::Relaxed);
        store.resubscribe_all("md-x");
        assert_eq!(feed.sub_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_update_quote_refuses_deep_levels() {
        let (store, _) = store_with_catalog();
        let src = DataSrc::from_name("X");
        store.update_quote(
            src,
            1,
            5,
            Quote {
                ask_price: 10.0,
                ..Default::default()
            },
        );
        assert_eq!(store.snapshot(src, 1).depth[4].ask_price, 0.0);
        store.update_quote(
            src,
            1,
            4,
            Quote {
                ask_price: 10.0,
                ..Default::default()
            },
        );
        assert_eq!(store.snapshot(src, 1).depth[4].ask_price, 10.0);
    }

    #[test]
    fn test_trade_updates_accumulate() {
        let (store, _) = store_with_catalog();
        let src = DataSrc::from_name("X");
        store.update_trade(src, 1, 10.0, 100.0);
        store.update_trade(src, 1, 11.0, 100.0);
        let t = store.snapshot(src, 1).trade;
        assert_eq!(t.volume, 200.0);
        assert_eq!(t.close, 11.0);
        assert!((t.vwap - 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_update_seeds_then_deltas() {
        let (store, _) = store_with_catalog();
        let src = DataSrc::from_name("X");
        store.update_trade_aggregate(src, 1, 10.0, 1000.0, 9.0, 11.0, 8.5, 9.9);
        let t = store.snapshot(src, 1).trade;
        assert_eq!(t.volume, 1000.0);
        assert_eq!(t.vwap, 9.9);

        // Stale totals are ignored; growth replays the delta.
        store.update_trade_aggregate(src, 1, 10.5, 900.0, 9.0, 11.0, 8.5, 9.9);
        assert_eq!(store.snapshot(src, 1).trade.volume, 1000.0);
        store.update_trade_aggregate(src, 1, 10.5, 1100.0, 9.0, 11.0, 8.5, 9.9);
        let t = store.snapshot(src, 1).trade;
        assert_eq!(t.volume, 1100.0);
        assert_eq!(t.close, 10.5);
    }

    #[test]
    fn test_current_price_falls_back_to_static_close() {
        let (store, catalog) = store_with_catalog();
        let feed = TestFeed::new("md-x", "X", true);
        store.add_feed(feed, "NYSE").unwrap();
        let sec = catalog.security(1).unwrap();
        assert_eq!(store.current_price(&sec), 9.5);
        store.update_trade(DataSrc::from_name("X"), 1, 10.25, 10.0);
        assert_eq!(store.current_price(&sec), 10.25);
    }

    #[test]
    fn test_rejects_long_src_and_duplicate_feed() {
        let (store, _) = store_with_catalog();
        let too_long = TestFeed::new("md-y", "TOOBIG", true);
        assert!(matches!(
            store.add_feed(too_long, ""),
            Err(MarketDataError::InvalidSrc(_))
        ));
        let a = TestFeed::new("md-x", "X", true);
        store.add_feed(a, "").unwrap();
        let b = TestFeed::new("md-x", "Y", true);
        assert!(matches!(
            store.add_feed(b, ""),
            Err(MarketDataError::DuplicateFeed(_))
        ));
    }
}
