//! Security reference data and the security/exchange catalog.

use super::exchange::Exchange;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Instrument type tags, following the IB contract taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecurityType {
    #[default]
    Stock,
    ForexPair,
    Commodity,
    Future,
    Option,
    Index,
    FutureOption,
    Combo,
    Warrant,
    Bond,
}

impl SecurityType {
    /// The wire tag used in the catalog tables and client dumps.
    pub fn tag(&self) -> &'static str {
        match self {
            SecurityType::Stock => "STK",
            SecurityType::ForexPair => "CASH",
            SecurityType::Commodity => "CMDTY",
            SecurityType::Future => "FUT",
            SecurityType::Option => "OPT",
            SecurityType::Index => "IND",
            SecurityType::FutureOption => "FOP",
            SecurityType::Combo => "BAG",
            SecurityType::Warrant => "WAR",
            SecurityType::Bond => "BOND",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "STK" => SecurityType::Stock,
            "CASH" => SecurityType::ForexPair,
            "CMDTY" => SecurityType::Commodity,
            "FUT" => SecurityType::Future,
            "OPT" => SecurityType::Option,
            "IND" => SecurityType::Index,
            "FOP" => SecurityType::FutureOption,
            "BAG" => SecurityType::Combo,
            "WAR" => SecurityType::Warrant,
            "BOND" => SecurityType::Bond,
            _ => return None,
        })
    }

    /// Forex pairs are valued at qty only; price plays no role in exposure.
    pub fn is_fx(&self) -> bool {
        matches!(self, SecurityType::ForexPair)
    }
}

/// A tradable security in the reference catalog.
#[derive(Debug, Clone)]
pub struct Security {
    pub id: u32,
    pub symbol: String,
    pub local_symbol: String,
    pub sec_type: SecurityType,
    pub currency: String,
    pub exchange_id: u16,
    /// Currency conversion rate into the account currency.
    pub rate: f64,
    /// Contract multiplier.
    pub multiplier: f64,
    /// Fixed tick size; 0 defers to the exchange band table.
    pub tick_size: f64,
    /// Previous session close, the static reference price.
    pub close_price: f64,
    pub lot_size: i64,
    /// Back-reference to an underlying security (options/warrants); 0 = none.
    pub underlying_id: u32,
}

impl Default for Security {
    fn default() -> Self {
        Self {
            id: 0,
            symbol: String::new(),
            local_symbol: String::new(),
            sec_type: SecurityType::Stock,
            currency: String::new(),
            exchange_id: 0,
            rate: 1.0,
            multiplier: 1.0,
            tick_size: 0.0,
            close_price: 0.0,
            lot_size: 0,
            underlying_id: 0,
        }
    }
}

impl Security {
    /// Tick size at the given price: the per-security override when present,
    /// else the exchange band table.
    pub fn tick_size_at(&self, px: f64, exchange: &Exchange) -> f64 {
        if self.tick_size > 0.0 {
            self.tick_size
        } else {
            exchange.tick_size(px)
        }
    }

    /// Multiplier × currency rate, the factor converting qty·px into
    /// account-currency notional.
    pub fn value_factor(&self) -> f64 {
        self.multiplier * self.rate
    }
}

/// The exchange/security half of the reference catalog.
///
/// Entries are `Arc`-published; replacing an entry is an atomic pointer swap
/// in the map, so readers always see a whole value.
#[derive(Default)]
pub struct SecurityCatalog {
    exchanges: DashMap<u16, Arc<Exchange>>,
    exchanges_by_name: DashMap<String, u16>,
    securities: DashMap<u32, Arc<Security>>,
    securities_by_symbol: DashMap<(u16, String), u32>,
    check_sum: AtomicU32,
}

impl SecurityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_exchange(&self, ex: Exchange) {
        self.exchanges_by_name.insert(ex.name.clone(), ex.id);
        self.exchanges.insert(ex.id, Arc::new(ex));
    }

    pub fn publish_security(&self, sec: Security) {
        self.securities_by_symbol
            .insert((sec.exchange_id, sec.symbol.clone()), sec.id);
        self.securities.insert(sec.id, Arc::new(sec));
        self.update_check_sum();
    }

    pub fn exchange(&self, id: u16) -> Option<Arc<Exchange>> {
        self.exchanges.get(&id).map(|e| e.clone())
    }

    pub fn exchange_by_name(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges_by_name
            .get(name)
            .and_then(|id| self.exchange(*id))
    }

    pub fn security(&self, id: u32) -> Option<Arc<Security>> {
        self.securities.get(&id).map(|s| s.clone())
    }

    pub fn security_by_symbol(&self, exchange: &str, symbol: &str) -> Option<Arc<Security>> {
        let ex = self.exchanges_by_name.get(exchange)?;
        let id = self.securities_by_symbol.get(&(*ex, symbol.to_string()))?;
        self.security(*id)
    }

    pub fn securities(&self) -> Vec<Arc<Security>> {
        let mut out: Vec<_> = self.securities.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// crc32 over the sorted securities dump; clients cache the catalog and
    /// compare this on reconnect.
    pub fn check_sum(&self) -> u32 {
        self.check_sum.load(Ordering::Acquire)
    }

    fn update_check_sum(&self) {
        let mut hasher = crc32fast::Hasher::new();
        for sec in self.securities() {
            hasher.update(sec.id.to_le_bytes().as_ref());
            hasher.update(sec.symbol.as_bytes());
            hasher.update(sec.local_symbol.as_bytes());
            hasher.update(sec.sec_type.tag().as_bytes());
            hasher.update(sec.exchange_id.to_le_bytes().as_ref());
            hasher.update(sec.lot_size.to_le_bytes().as_ref());
            hasher.update(sec.multiplier.to_bits().to_le_bytes().as_ref());
        }
        self.check_sum.store(hasher.finalize(), Ordering::Release);
    }
}
