//! Pre-trade risk: limits, per-second throttles, the stop book and the
//! synchronous risk gate on the order submit path.
//!
//! Rejections are values, not errors: the gate returns a human-readable
//! reason which dispatch surfaces as a terminal `risk_rejected`
//! confirmation.

use crate::catalog::{AccountBase, Catalog};
use crate::orderbook::Order;
use crate::position::{Position, PositionManager, PositionValue, Scope};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

/// Account limits. Zero means "no limit".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Limits {
    /// Orders per second.
    pub msg_rate: f64,
    /// Orders per security per second.
    pub msg_rate_per_security: f64,
    /// Single-order quantity cap.
    pub order_qty: f64,
    /// Single-order notional cap (qty · px · multiplier · fx).
    pub order_value: f64,
    /// Intraday per-security signed net value cap.
    pub value: f64,
    /// Intraday per-security gross turnover cap.
    pub turnover: f64,
    /// Intraday account-wide net value cap.
    pub total_value: f64,
    /// Intraday account-wide turnover cap.
    pub total_turnover: f64,
    /// Gross long value cap, projected.
    pub total_long_value: f64,
    /// Gross short value cap, projected.
    pub total_short_value: f64,
}

impl Limits {
    /// Serialize as the admin-surface `name=value` list.
    pub fn to_config_string(&self) -> String {
        format!(
            "msg_rate={}\nmsg_rate_per_security={}\norder_qty={}\norder_value={}\nvalue={}\n\
             turnover={}\ntotal_value={}\ntotal_turnover={}\ntotal_long_value={}\ntotal_short_value={}",
            self.msg_rate,
            self.msg_rate_per_security,
            self.order_qty,
            self.order_value,
            self.value,
            self.turnover,
            self.total_value,
            self.total_turnover,
            self.total_long_value,
            self.total_short_value
        )
    }

    /// Parse a `name=value` list separated by `,`, `;` or newlines.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut l = Limits::default();
        for tok in s.split(|c| c == ',' || c == ';' || c == '\n') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            let (name, value) = tok.split_once('=').ok_or_else(|| {
                "Invalid limits format, expect <name>=<value>[,;<new line>]...".to_string()
            })?;
            let value: f64 = value.trim().parse().map_err(|_| {
                "Invalid limits format, expect <name>=<value>[,;<new line>]...".to_string()
            })?;
            match name.trim().to_ascii_lowercase().as_str() {
                "msg_rate" => l.msg_rate = value,
                "msg_rate_per_security" => l.msg_rate_per_security = value,
                "order_qty" => l.order_qty = value,
                "order_value" => l.order_value = value,
                "value" => l.value = value,
                "turnover" => l.turnover = value,
                "total_value" => l.total_value = value,
                "total_turnover" => l.total_turnover = value,
                "total_long_value" => l.total_long_value = value,
                "total_short_value" => l.total_short_value = value,
                other => return Err(format!("Unknown limit name: {other}")),
            }
        }
        Ok(l)
    }
}

/// Per-second message counter. The count implicitly resets when the wall
/// clock advances to a new second.
#[derive(Debug, Default)]
pub struct Throttle {
    tm: AtomicI64,
    n: AtomicU32,
}

impl Throttle {
    /// Messages seen in the given second.
    pub fn count(&self, now: i64) -> u32 {
        if self.tm.load(Ordering::Relaxed) != now {
            0
        } else {
            self.n.load(Ordering::Relaxed)
        }
    }

    /// Record one message at the given second.
    pub fn update(&self, now: i64) {
        if self.tm.swap(now, Ordering::Relaxed) != now {
            self.n.store(1, Ordering::Relaxed);
        } else {
            self.n.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Hard trading stops per (security, sub-account); sub-account 0 stops the
/// security for everyone.
#[derive(Default)]
pub struct StopBook {
    entries: DashMap<(u32, u16), bool>,
}

impl StopBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, security_id: u32, sub_account_id: u16, stopped: bool) {
        self.entries.insert((security_id, sub_account_id), stopped);
    }

    pub fn is_stopped(&self, security_id: u32, sub_account_id: u16) -> bool {
        self.entries
            .get(&(security_id, sub_account_id))
            .map(|v| *v)
            .unwrap_or(false)
    }

    /// Check both the (sec, acc) pair and the security-wide (sec, 0) stop.
    pub fn check(
        &self,
        security_id: u32,
        symbol: &str,
        sub_account: Option<(&str, u16)>,
    ) -> Result<(), String> {
        if let Some((name, id)) = sub_account {
            if self.is_stopped(security_id, id) {
                return Err(format!(
                    "security \"{symbol}\" of sub_account \"{name}\" is stopped"
                ));
            }
        }
        if self.is_stopped(security_id, 0) {
            return Err(format!("security \"{symbol}\" is stopped"));
        }
        Ok(())
    }
}

/// The synchronous risk gate.
pub struct RiskGate {
    catalog: Arc<Catalog>,
    positions: Arc<PositionManager>,
    pub stop_book: StopBook,
    disabled: AtomicBool,
}

impl RiskGate {
    pub fn new(catalog: Arc<Catalog>, positions: Arc<PositionManager>) -> Self {
        Self {
            catalog,
            positions,
            stop_book: StopBook::new(),
            disabled: AtomicBool::new(false),
        }
    }

    /// Turn every check off (`--disable_rms`).
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// The reduced path used by cancels: message-rate only.
    pub fn check_msg_rate(&self, ord: &Order) -> Result<(), String> {
        if self.is_disabled() {
            return Ok(());
        }
        let now = crate::utils::now_secs();
        let sid = ord.security_id();
        if let Some(acc) = self.catalog.sub_account(ord.sub_account_id()) {
            check_msg_rate("sub_account", &acc.base, sid, now)?;
        }
        if let Some(acc) = self.catalog.broker_account(ord.broker_account_id) {
            check_msg_rate("broker_account", &acc.base, sid, now)?;
        }
        if let Some(user) = self.catalog.user(ord.user_id) {
            check_msg_rate("user", &user.base, sid, now)?;
        }
        Ok(())
    }

    /// The full submit-path gate, run in order: stop book, throttles,
    /// per-order caps, per-security intraday caps, account-global caps, and
    /// projected gross long/short caps.
    pub fn check(&self, ord: &Order) -> Result<(), String> {
        if self.is_disabled() {
            return Ok(());
        }
        let sec = self
            .catalog
            .security(ord.security_id())
            .ok_or_else(|| "Unknown security".to_string())?;

        let sub_name = self
            .catalog
            .sub_account(ord.sub_account_id())
            .map(|a| a.name.clone())
            .unwrap_or_default();
        self.stop_book.check(
            sec.id,
            &sec.symbol,
            Some((&sub_name, ord.sub_account_id())),
        )?;

        let factor = sec.value_factor();
        if let Some(acc) = self.catalog.sub_account(ord.sub_account_id()) {
            let pos = self
                .positions
                .position(Scope::Sub, acc.id, sec.id);
            let values = self.positions.account_value(Scope::Sub, acc.id);
            check_account("sub_account", ord, &acc.base, factor, Some(&pos), &values)?;
        }
        if let Some(acc) = self.catalog.broker_account(ord.broker_account_id) {
            let pos = self.positions.position(Scope::Broker, acc.id, sec.id);
            let values = self.positions.account_value(Scope::Broker, acc.id);
            check_account("broker_account", ord, &acc.base, factor, Some(&pos), &values)?;
        }
        if let Some(user) = self.catalog.user(ord.user_id) {
            let pos = self.positions.position(Scope::User, user.id, sec.id);
            let values = self.positions.account_value(Scope::User, user.id);
            check_account("user", ord, &user.base, factor, Some(&pos), &values)?;
        }
        if let Some(dest) = &ord.contract.destination {
            if let Some(acc) = self.catalog.accounts.broker_account_by_name(dest) {
                let values = self.positions.account_value(Scope::Broker, acc.id);
                check_account("destination", ord, &acc.base, factor, None, &values)?;
            }
        }
        Ok(())
    }
}

fn check_msg_rate(
    name: &str,
    acc: &AccountBase,
    security_id: u32,
    now: i64,
) -> Result<(), String> {
    let l = acc.limits();
    if l.msg_rate_per_security > 0.0 {
        let v = acc
            .throttle_per_security_in_sec
            .get(&security_id)
            .map(|t| t.count(now))
            .unwrap_or(0);
        if f64::from(v) >= l.msg_rate_per_security {
            return Err(format!(
                "{name} limit breach: message rate per second {v} > {}",
                l.msg_rate_per_security
            ));
        }
    }
    if l.msg_rate > 0.0 {
        let v = acc.throttle_in_sec.count(now);
        if f64::from(v) >= l.msg_rate {
            return Err(format!(
                "{name} limit breach: message rate {v} > {}",
                l.msg_rate
            ));
        }
    }
    Ok(())
}

fn check_account(
    name: &str,
    ord: &Order,
    acc: &AccountBase,
    factor: f64,
    pos: Option<&Position>,
    account_value: &PositionValue,
) -> Result<(), String> {
    if acc.is_disabled() {
        return Err(format!("{name} is disabled"));
    }
    check_msg_rate(name, acc, ord.security_id(), crate::utils::now_secs())?;

    let l = acc.limits();
    if l.order_qty > 0.0 && ord.qty() > l.order_qty {
        return Err(format!(
            "{name} limit breach: single order quantity {} > {}",
            ord.qty(),
            l.order_qty
        ));
    }

    let v = ord.qty() * ord.price() * factor;
    if l.order_value > 0.0 && v > l.order_value {
        return Err(format!(
            "{name} limit breach: single order value {v} > {}",
            l.order_value
        ));
    }

    let Some(pos) = pos else { return Ok(()) };

    if l.value > 0.0 {
        let net = pos.value.total_bought - pos.value.total_sold;
        let v2 = if ord.is_buy() {
            (net + pos.value.total_outstanding_buy + v)
                .abs()
                .max((net - pos.value.total_outstanding_sell).abs())
        } else {
            (net + pos.value.total_outstanding_buy)
                .abs()
                .max((net - pos.value.total_outstanding_sell - v).abs())
        };
        if v2 > l.value {
            return Err(format!(
                "{name} limit breach: security intraday trade value {v2} > {}",
                l.value
            ));
        }
    }

    if l.turnover > 0.0 {
        let v2 = pos.value.total_bought
            + pos.value.total_outstanding_buy
            + pos.value.total_sold
            + pos.value.total_outstanding_sell
            + v;
        if v2 > l.turnover {
            return Err(format!(
                "{name} limit breach: security intraday turnover {v2} > {}",
                l.turnover
            ));
        }
    }

    if l.total_value > 0.0 {
        let net = account_value.total_bought - account_value.total_sold;
        let v2 = if ord.is_buy() {
            (net + account_value.total_outstanding_buy + v)
                .abs()
                .max((net - account_value.total_outstanding_sell).abs())
        } else {
            (net + account_value.total_outstanding_buy)
                .abs()
                .max((net - account_value.total_outstanding_sell - v).abs())
        };
        if v2 > l.total_value {
            return Err(format!(
                "{name} limit breach: total intraday trade value {v2} > {}",
                l.total_value
            ));
        }
    }

    if l.total_turnover > 0.0 {
        let v2 = account_value.total_bought
            + account_value.total_outstanding_buy
            + account_value.total_sold
            + account_value.total_outstanding_sell
            + v;
        if v2 > l.total_turnover {
            return Err(format!(
                "{name} limit breach: total intraday turnover {v2} > {}",
                l.total_turnover
            ));
        }
    }

    // Gross caps count only the incremental same-side exposure: buying that
    // covers a short does not grow long_value.
    if l.total_long_value > 0.0 && ord.is_buy() {
        let net = pos.qty + pos.total_outstanding_buy_qty - pos.total_outstanding_sell_qty;
        let mut d = ord.qty();
        if net < 0.0 {
            d = (net + ord.qty()).max(0.0);
        }
        if d > 0.0 {
            let v2 = account_value.long_value + d * ord.price() * factor;
            if v2 > l.total_long_value {
                return Err(format!(
                    "{name} limit breach: total long value {v2} > {}",
                    l.total_long_value
                ));
            }
        }
    }

    if l.total_short_value > 0.0 && !ord.is_buy() {
        let net = pos.qty + pos.total_outstanding_buy_qty - pos.total_outstanding_sell_qty;
        let mut d = ord.qty();
        if net > 0.0 {
            d = (ord.qty() - net).max(0.0);
        }
        if d > 0.0 {
            let v2 = account_value.short_value + d * ord.price() * factor;
            if v2 > l.total_short_value {
                return Err(format!(
                    "{name} limit breach: total short value {v2} > {}",
                    l.total_short_value
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_round_trip() {
        let l = Limits {
            msg_rate: 10.0,
            order_qty: 1000.0,
            total_turnover: 5e6,
            ..Default::default()
        };
        let parsed = Limits::parse(&l.to_config_string()).unwrap();
        assert_eq!(parsed, l);
    }

    #[test]
    fn test_limits_parse_rejects_garbage() {
        assert!(Limits::parse("msg_rate").is_err());
        assert!(Limits::parse("bogus=1").is_err());
        assert!(Limits::parse("msg_rate=abc").is_err());
        assert_eq!(Limits::parse("").unwrap(), Limits::default());
    }

    #[test]
    fn test_throttle_resets_on_new_second() {
        let t = Throttle::default();
        assert_eq!(t.count(100), 0);
        t.update(100);
        t.update(100);
        assert_eq!(t.count(100), 2);
        assert_eq!(t.count(101), 0);
        t.update(101);
        assert_eq!(t.count(101), 1);
    }

    #[test]
    fn test_stop_book_pairs_and_wildcard() {
        let book = StopBook::new();
        book.set(7, 2, true);
        assert!(book.check(7, "AAA", Some(("alpha", 2))).is_err());
        assert!(book.check(7, "AAA", Some(("beta", 3))).is_ok());
        book.set(8, 0, true);
        let err = book.check(8, "BBB", Some(("alpha", 2))).unwrap_err();
        assert_eq!(err, "security \"BBB\" is stopped");
        book.set(8, 0, false);
        assert!(book.check(8, "BBB", Some(("alpha", 2))).is_ok());
    }

    #[test]
    fn test_check_account_order_caps() {
        use crate::orderbook::{Contract, Side};
        let base = AccountBase::with_limits(Limits {
            order_qty: 100.0,
            order_value: 500.0,
            ..Default::default()
        });
        let mut ord = Order::from_contract(
            Contract {
                security_id: 1,
                qty: 200.0,
                price: 1.0,
                side: Side::Buy,
                ..Default::default()
            },
            1,
        );
        let pv = PositionValue::default();
        let err = check_account("user", &ord, &base, 1.0, None, &pv).unwrap_err();
        assert!(err.contains("single order quantity"));

        ord.contract.qty = 100.0;
        ord.contract.price = 10.0;
        let err = check_account("user", &ord, &base, 1.0, None, &pv).unwrap_err();
        assert!(err.contains("single order value"));

        ord.contract.price = 5.0;
        assert!(check_account("user", &ord, &base, 1.0, None, &pv).is_ok());
    }

    #[test]
    fn test_long_value_cap_skips_short_cover() {
        use crate::orderbook::{Contract, Side};
        let base = AccountBase::with_limits(Limits {
            total_long_value: 1000.0,
            ..Default::default()
        });
        let ord = Order::from_contract(
            Contract {
                security_id: 1,
                qty: 50.0,
                price: 10.0,
                side: Side::Buy,
                ..Default::default()
            },
            1,
        );
        // Covering a 100-short: no new long exposure, passes even though
        // long_value is at the cap.
        let pos = Position {
            qty: -100.0,
            ..Default::default()
        };
        let pv = PositionValue {
            long_value: 1000.0,
            ..Default::default()
        };
        assert!(check_account("user", &ord, &base, 1.0, Some(&pos), &pv).is_ok());

        // Flat position: the same order opens 500 of new long value.
        let flat = Position::default();
        let err = check_account("user", &ord, &base, 1.0, Some(&flat), &pv).unwrap_err();
        assert!(err.contains("total long value"));
    }
}
