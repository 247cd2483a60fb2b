//! The consolidation book: a per-security price-level book aggregating
//! level-0 quotes from every market-data source.
//!
//! Asks are ordered ascending and bids descending; each level carries the
//! per-source quotes resting at that price. Updates from the same source
//! replace its prior quote under the book's mutex; a level whose quote list
//! empties is removed so the top of book drops seamlessly. Smart-routing
//! algos read the best level and pick a destination deterministically.

use crate::marketdata::{DataSrc, Quote};
use crate::utils::{price_from_key, price_key};
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The source tag algos subscribe with to receive consolidated data.
pub const CONSOLIDATION_SRC: &str = "CONS";

/// One source's displayed quote inside a price level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceQuote {
    pub src: DataSrc,
    pub size: f64,
}

/// A destination chosen from the best level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickedQuote {
    pub price: f64,
    pub src: DataSrc,
    pub size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Ask,
    Bid,
}

type Level = Arc<Mutex<Vec<SourceQuote>>>;

#[derive(Default, Clone, Copy)]
struct PrevQuote {
    ask_price: f64,
    ask_size: f64,
    bid_price: f64,
    bid_size: f64,
}

/// Per-security consolidated price levels.
///
/// Levels live in ordered skip-lists keyed by the price bits; every
/// mutation is serialized by `mutex`, while best-level reads take the same
/// mutex only long enough to copy the level out.
#[derive(Default)]
pub struct ConsolidationBook {
    asks: SkipMap<u64, Level>,
    bids: SkipMap<u64, Level>,
    prev: Mutex<HashMap<u32, PrevQuote>>,
    mutex: Mutex<()>,
}

impl ConsolidationBook {
    /// Apply one source's level-0 quote.
    pub fn update(&self, src: DataSrc, q: Quote) {
        let _guard = self.mutex.lock();
        let mut prev_map = match self.prev.lock() {
            Ok(p) => p,
            Err(p) => p.into_inner(),
        };
        let prev = prev_map.entry(src.0).or_default();

        if q.ask_price != prev.ask_price || q.ask_size != prev.ask_size {
            if prev.ask_price > 0.0 && prev.ask_price != q.ask_price {
                erase(&self.asks, prev.ask_price, src);
            }
            if q.ask_price > 0.0 {
                upsert(&self.asks, q.ask_price, src, q.ask_size);
            }
            prev.ask_price = q.ask_price;
            prev.ask_size = q.ask_size;
        }
        if q.bid_price != prev.bid_price || q.bid_size != prev.bid_size {
            if prev.bid_price > 0.0 && prev.bid_price != q.bid_price {
                erase(&self.bids, prev.bid_price, src);
            }
            if q.bid_price > 0.0 {
                upsert(&self.bids, q.bid_price, src, q.bid_size);
            }
            prev.bid_price = q.bid_price;
            prev.bid_size = q.bid_size;
        }
    }

    /// Drop every quote a source contributed (feed teardown).
    pub fn remove_src(&self, src: DataSrc) {
        self.update(src, Quote::default());
    }

    /// The best level on one side: price and the quotes resting there.
    pub fn best(&self, side: BookSide) -> Option<(f64, Vec<SourceQuote>)> {
        let _guard = self.mutex.lock();
        let entry = match side {
            BookSide::Ask => self.asks.front(),
            BookSide::Bid => self.bids.back(),
        }?;
        let quotes = entry.value().lock().ok()?.clone();
        if quotes.is_empty() {
            return None;
        }
        Some((price_from_key(*entry.key()), quotes))
    }

    /// Choose a destination at the best level: largest displayed size first,
    /// source-name lexicographic as the tiebreak.
    pub fn pick(&self, side: BookSide) -> Option<PickedQuote> {
        let (price, quotes) = self.best(side)?;
        let q = quotes.into_iter().max_by(|a, b| {
            a.size
                .total_cmp(&b.size)
                .then_with(|| b.src.name().cmp(&a.src.name()))
        })?;
        Some(PickedQuote {
            price,
            src: q.src,
            size: q.size,
        })
    }

    /// Aggregate displayed size of the first `n` levels, best first.
    pub fn depth(&self, side: BookSide, n: usize) -> Vec<(f64, f64)> {
        let _guard = self.mutex.lock();
        let mut out = Vec::with_capacity(n);
        let mut push = |key: u64, level: &Level| {
            let total: f64 = level
                .lock()
                .map(|q| q.iter().map(|s| s.size).sum())
                .unwrap_or(0.0);
            if total > 0.0 {
                out.push((price_from_key(key), total));
            }
        };
        match side {
            BookSide::Ask => {
                for entry in self.asks.iter().take(n) {
                    push(*entry.key(), entry.value());
                }
            }
            BookSide::Bid => {
                for entry in self.bids.iter().rev().take(n) {
                    push(*entry.key(), entry.value());
                }
            }
        }
        out
    }

    pub fn level_count(&self, side: BookSide) -> usize {
        match side {
            BookSide::Ask => self.asks.len(),
            BookSide::Bid => self.bids.len(),
        }
    }
}

fn upsert(levels: &SkipMap<u64, Level>, price: f64, src: DataSrc, size: f64) {
    let entry = levels.get_or_insert_with(price_key(price), Level::default);
    let lock_result = entry.value().lock();
    if let Ok(mut quotes) = lock_result {
        match quotes.iter_mut().find(|q| q.src == src) {
            Some(q) => q.size = size,
            None => quotes.push(SourceQuote { src, size }),
        }
    }
}

fn erase(levels: &SkipMap<u64, Level>, price: f64, src: DataSrc) {
    let key = price_key(price);
    if let Some(entry) = levels.get(&key) {
        let empty = entry
            .value()
            .lock()
            .map(|mut quotes| {
                quotes.retain(|q| q.src != src);
                quotes.is_empty()
            })
            .unwrap_or(false);
        if empty {
            entry.remove();
        }
    }
}

/// Owns one consolidation book per subscribed security.
#[derive(Default)]
pub struct ConsolidationManager {
    books: DashMap<u32, Arc<ConsolidationBook>>,
}

impl ConsolidationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start consolidating a security; idempotent.
    pub fn subscribe(&self, security_id: u32) -> Arc<ConsolidationBook> {
        self.books.entry(security_id).or_default().clone()
    }

    pub fn book(&self, security_id: u32) -> Option<Arc<ConsolidationBook>> {
        self.books.get(&security_id).map(|b| b.clone())
    }

    /// Level-0 quote fan-in from the market-data store. Securities without
    /// a book are not consolidated.
    pub fn on_quote(&self, src: DataSrc, security_id: u32, q: Quote) {
        if let Some(book) = self.books.get(&security_id) {
            book.update(src, q);
        }
    }
}
