//! Commission adapters: per-exchange, per-side rate tables.

use crate::catalog::Catalog;
use crate::orderbook::{Confirmation, Order};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Rates for one side. The first nonzero of per-share / per-value wins.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommissionRates {
    pub per_share: f64,
    pub per_value: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SideRates {
    pub buy: CommissionRates,
    pub sell: CommissionRates,
}

/// A commission adapter: exchange_id → side rates, exchange 0 as default.
#[derive(Debug, Default)]
pub struct CommissionAdapter {
    pub name: String,
    table: HashMap<u16, SideRates>,
}

impl CommissionAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: HashMap::new(),
        }
    }

    /// Commission in the security's native currency for one fill.
    pub fn compute(&self, cm: &Confirmation, ord: &Order, exchange_id: u16) -> f64 {
        let rates = self
            .table
            .get(&exchange_id)
            .or_else(|| self.table.get(&0));
        let Some(rates) = rates else { return 0.0 };
        let f = if ord.is_buy() { &rates.buy } else { &rates.sell };
        if f.per_share > 0.0 {
            return f.per_share * cm.last_shares;
        }
        if f.per_value > 0.0 {
            return f.per_value * cm.last_shares * cm.last_px;
        }
        0.0
    }

    /// Parse a rate table from
    /// `[buy_|sell_]per_share|per_value[_<exchange_name>]=<value>` tokens
    /// separated by whitespace or `|`.
    pub fn parse_table(&mut self, s: &str, catalog: &Catalog) -> Result<(), String> {
        for tok in s.split(|c: char| c.is_whitespace() || c == '|') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            let (name, value) = tok
                .split_once('=')
                .ok_or_else(|| {
                    "Invalid commission format, expect <name>=<value>[<space><tab>|]...".to_string()
                })?;
            let value: f64 = value.parse().map_err(|_| {
                "Invalid commission format, expect <name>=<value>[<space><tab>|]...".to_string()
            })?;

            let (is_buy, rest) = if let Some(r) = name.strip_prefix("buy_") {
                (Some(true), r)
            } else if let Some(r) = name.strip_prefix("sell_") {
                (Some(false), r)
            } else {
                (None, name)
            };
            let (per_value, rest) = if let Some(r) = rest.strip_prefix("per_value") {
                (true, r)
            } else if let Some(r) = rest.strip_prefix("per_share") {
                (false, r)
            } else {
                return Err(format!(
                    "Invalid commission name {name}, expect per_share or per_value or with \
                     <side>_ prefix and _<exchange_name> suffix"
                ));
            };

            let exchange_id = match rest.strip_prefix('_') {
                None if rest.is_empty() => 0,
                None => {
                    return Err(format!(
                        "Invalid commission name {name}, expect per_share or per_value or with \
                         <side>_ prefix and _<exchange_name> suffix"
                    ))
                }
                Some(exch_name) => catalog
                    .securities
                    .exchange_by_name(exch_name)
                    .map(|e| e.id)
                    .ok_or_else(|| {
                        format!("Invalid exchange name in commission: \"{exch_name}\"")
                    })?,
            };

            let entry = self.table.entry(exchange_id).or_default();
            match (per_value, is_buy) {
                (true, Some(true)) => entry.buy.per_value = value,
                (true, Some(false)) => entry.sell.per_value = value,
                (true, None) => {
                    entry.buy.per_value = value;
                    entry.sell.per_value = value;
                }
                (false, Some(true)) => entry.buy.per_share = value,
                (false, Some(false)) => entry.sell.per_share = value,
                (false, None) => {
                    entry.buy.per_share = value;
                    entry.sell.per_share = value;
                }
            }
        }
        Ok(())
    }
}

/// Registry of commission adapters, keyed by the config section name.
#[derive(Default)]
pub struct CommissionManager {
    adapters: DashMap<String, Arc<CommissionAdapter>>,
}

impl CommissionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, adapter: CommissionAdapter) {
        self.adapters
            .insert(adapter.name.clone(), Arc::new(adapter));
    }

    pub fn get(&self, name: &str) -> Option<Arc<CommissionAdapter>> {
        self.adapters.get(name).map(|a| a.clone())
    }
}
