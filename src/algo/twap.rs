//! Built-in TWAP slice algo: works a parent order toward a
//! time-proportional schedule with a 1-second timer loop.

use super::{Algo, AlgoCtx, AlgoParams, Instrument};
use crate::marketdata::DataSrc;
use crate::orderbook::{Confirmation, Contract, OrdType, Order, Side};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggression {
    Low,
    Medium,
    High,
    Highest,
}

/// How the next child order should be priced.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ChildPrice {
    Limit(f64),
    Market,
    Wait,
}

/// The parent-order tuple: what to trade, where, and how much.
#[derive(Debug, Clone, Default)]
struct SecurityTuple {
    security_id: u32,
    src: String,
    sub_account_id: u16,
    side: Side,
    qty: f64,
}

/// Time-weighted average price execution.
#[derive(Default)]
pub struct Twap {
    st: SecurityTuple,
    inst: Option<Arc<Instrument>>,
    initial_volume: f64,
    begin_time: i64,
    end_time: i64,
    price: f64,
    min_size: f64,
    max_floor: f64,
    max_pov: f64,
    agg: Option<Aggression>,
}

const TIMER: u64 = 0;

fn num(params: &AlgoParams, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.as_f64())
}

fn text<'a>(params: &'a AlgoParams, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

impl Twap {
    fn parse_security(params: &AlgoParams) -> Result<SecurityTuple, String> {
        let sec = params
            .get("Security")
            .and_then(|v| v.as_object())
            .ok_or_else(|| "Security required".to_string())?;
        let side = sec
            .get("side")
            .and_then(|v| v.as_str())
            .and_then(Side::parse)
            .ok_or_else(|| "Invalid side".to_string())?;
        let qty = sec.get("qty").and_then(|v| v.as_f64()).unwrap_or(0.0);
        if qty <= 0.0 {
            return Err("Invalid qty".to_string());
        }
        Ok(SecurityTuple {
            security_id: sec
                .get("security_id")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| "security_id required".to_string())? as u32,
            src: sec
                .get("src")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            sub_account_id: sec
                .get("account")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| "account required".to_string())? as u16,
            side,
            qty,
        })
    }

    fn round_price(&self, ctx: &AlgoCtx, px: f64) -> f64 {
        let Some(sec) = ctx.catalog().security(self.st.security_id) else {
            return px;
        };
        let Some(exchange) = ctx.catalog().exchange(sec.exchange_id) else {
            return px;
        };
        let tick = sec.tick_size_at(px, &exchange);
        if tick > 0.0 {
            (px / tick).round() * tick
        } else {
            px
        }
    }

    fn leaves(&self, inst: &Arc<Instrument>) -> f64 {
        let now = crate::utils::now_secs();
        let ratio = (((now - self.begin_time) as f64 + 1.0)
            / (0.8 * (self.end_time - self.begin_time) as f64 + 1.0))
            .min(1.0);
        self.st.qty * ratio - inst.total_exposure()
    }

    fn timer(&mut self, ctx: &AlgoCtx) {
        let now = crate::utils::now_secs();
        if now > self.end_time {
            ctx.stop();
            return;
        }
        ctx.set_timeout(TIMER, 1.0);
        let Some(inst) = self.inst.clone() else { return };
        let Some(sec) = ctx.catalog().security(self.st.security_id) else {
            return;
        };
        let Some(exchange) = ctx.catalog().exchange(sec.exchange_id) else {
            return;
        };
        if !exchange.is_in_trade_period() {
            return;
        }

        let md = ctx.md(&inst);
        let bid = md.quote().bid_price;
        let ask = md.quote().ask_price;
        let last_px = self.round_price(ctx, md.trade.close);
        let mid_px = if ask > bid && bid > 0.0 {
            self.round_price(ctx, (ask + bid) / 2.0)
        } else {
            0.0
        };
        let is_buy = self.st.side.is_buy();

        // Pull resting children that drifted away from the touch.
        if inst.has_active_orders() {
            for oid in inst.active_orders() {
                let Some(ord) = ctx.order(oid) else { continue };
                let out_of_line = if is_buy {
                    ord.price() < bid && (self.price <= 0.0 || ord.price() < self.price)
                } else {
                    ask > 0.0 && ord.price() > ask && (self.price <= 0.0 || ord.price() > self.price)
                };
                if out_of_line {
                    let _ = ctx.cancel(oid);
                }
            }
            return;
        }

        let volume = md.trade.volume - self.initial_volume;
        if volume > 0.0 && self.max_pov > 0.0 {
            if inst.total_qty() - inst.total_cx_qty() > self.max_pov * volume {
                return;
            }
        }
        let leaves = self.leaves(&inst);
        if leaves <= 0.0 {
            return;
        }
        let total_leaves = self.st.qty - inst.total_exposure();
        let mut lot_size = sec.lot_size as f64;
        let odd_ok = exchange.odd_lot_allowed || lot_size <= 0.0;
        if lot_size <= 0.0 {
            lot_size = self.min_size.max(1.0);
        }
        let max_qty = if odd_ok {
            total_leaves
        } else {
            (total_leaves / lot_size).floor() * lot_size
        };
        if max_qty <= 0.0 {
            return;
        }
        let mut would_qty = (leaves / lot_size).ceil() * lot_size;
        if would_qty < self.min_size {
            would_qty = self.min_size;
        }
        if self.max_floor > 0.0 && would_qty > self.max_floor {
            would_qty = self.max_floor;
        }
        if would_qty > max_qty {
            would_qty = max_qty;
        }

        let mut contract = Contract {
            security_id: self.st.security_id,
            sub_account_id: self.st.sub_account_id,
            qty: would_qty,
            side: self.st.side,
            ..Default::default()
        };
        match self.child_price(is_buy, bid, ask, last_px, mid_px) {
            ChildPrice::Limit(px) => {
                let mut px = px;
                if self.price > 0.0
                    && ((is_buy && px > self.price) || (!is_buy && px < self.price))
                {
                    px = self.price;
                }
                contract.price = px;
            }
            ChildPrice::Market => contract.ord_type = OrdType::Market,
            ChildPrice::Wait => return,
        }
        let _ = ctx.place(contract, &inst);
    }

    /// Child price per aggression. Low waits when no passive price exists;
    /// Medium and High escalate through the touch down to a market order;
    /// Highest always goes to market.
    fn child_price(
        &self,
        is_buy: bool,
        bid: f64,
        ask: f64,
        last_px: f64,
        mid_px: f64,
    ) -> ChildPrice {
        let passive = if is_buy { bid } else { ask };
        let aggressive = if is_buy { ask } else { bid };
        match self.agg {
            Some(Aggression::Low) => {
                if passive > 0.0 {
                    ChildPrice::Limit(passive)
                } else if last_px > 0.0 {
                    ChildPrice::Limit(last_px)
                } else {
                    ChildPrice::Wait
                }
            }
            Some(Aggression::Medium) => {
                if mid_px > 0.0 {
                    ChildPrice::Limit(mid_px)
                } else if aggressive > 0.0 {
                    ChildPrice::Limit(aggressive)
                } else {
                    ChildPrice::Market
                }
            }
            Some(Aggression::High) => {
                if aggressive > 0.0 {
                    ChildPrice::Limit(aggressive)
                } else {
                    ChildPrice::Market
                }
            }
            Some(Aggression::Highest) | None => ChildPrice::Market,
        }
    }
}

impl Algo for Twap {
    fn on_start(&mut self, ctx: &AlgoCtx, params: &AlgoParams) -> Result<(), String> {
        self.st = Self::parse_security(params)?;
        let seconds = num(params, "ValidSeconds").unwrap_or(0.0);
        if seconds < 60.0 {
            return Err("Too short ValidSeconds, must be >= 60".to_string());
        }
        let src = DataSrc::from_name(&self.st.src);
        let inst = ctx.subscribe(self.st.security_id, src)?;
        self.initial_volume = ctx.md(&inst).trade.volume;
        self.begin_time = crate::utils::now_secs();
        self.end_time = self.begin_time + seconds as i64;
        self.price = num(params, "Price").unwrap_or(0.0);
        if self.price > 0.0 {
            self.price = self.round_price(ctx, self.price);
        }
        self.min_size = num(params, "MinSize").unwrap_or(0.0);
        let lot_size = ctx
            .catalog()
            .security(self.st.security_id)
            .map(|s| s.lot_size)
            .unwrap_or(0);
        if self.min_size <= 0.0 && lot_size <= 0 {
            return Err("MinSize required for security without lot size".to_string());
        }
        if self.min_size > 0.0 && lot_size > 0 {
            self.min_size = (self.min_size / lot_size as f64).round() * lot_size as f64;
        }
        self.max_floor = num(params, "MaxFloor").unwrap_or(0.0);
        if self.min_size > 0.0 && self.max_floor < self.min_size {
            self.max_floor = 0.0;
        }
        self.max_pov = num(params, "MaxPov").unwrap_or(0.0).min(1.0);
        self.agg = match text(params, "Aggression") {
            Some("Low") => Some(Aggression::Low),
            Some("Medium") => Some(Aggression::Medium),
            Some("High") => Some(Aggression::High),
            Some("Highest") => Some(Aggression::Highest),
            _ => {
                return Err("Invalid aggression, must be in (Low, Medium, High, Highest)".to_string())
            }
        };
        if text(params, "InternalCross") == Some("Yes") {
            ctx.cross(
                self.st.qty,
                self.price,
                self.st.side,
                self.st.sub_account_id,
                &inst,
            )?;
        }
        self.inst = Some(inst);
        self.timer(ctx);
        debug!("[twap {}] started", ctx.algo_id());
        Ok(())
    }

    fn on_stop(&mut self, ctx: &AlgoCtx) {
        debug!("[twap {}] stopped", ctx.algo_id());
    }

    fn on_confirmation(&mut self, ctx: &AlgoCtx, _cm: &Confirmation, _ord: &Order) {
        if let Some(inst) = &self.inst {
            if inst.total_qty() >= self.st.qty {
                ctx.stop();
            }
        }
    }

    fn on_timer(&mut self, ctx: &AlgoCtx, token: u64) {
        if token == TIMER {
            self.timer(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(valid_seconds: f64, agg: &str) -> AlgoParams {
        let v = json!({
            "Security": {"security_id": 1, "account": 1, "side": "Buy", "qty": 1000.0},
            "ValidSeconds": valid_seconds,
            "MinSize": 100.0,
            "Aggression": agg,
        });
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_security_tuple() {
        let p = params(300.0, "Low");
        let st = Twap::parse_security(&p).unwrap();
        assert_eq!(st.security_id, 1);
        assert_eq!(st.sub_account_id, 1);
        assert_eq!(st.side, Side::Buy);
        assert_eq!(st.qty, 1000.0);
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let mut p = params(300.0, "Low");
        p.remove("Security");
        assert!(Twap::parse_security(&p).is_err());

        let bad = json!({"Security": {"security_id": 1, "account": 1, "side": "Hold", "qty": 10.0}});
        assert!(Twap::parse_security(bad.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_child_price_by_aggression() {
        let mut twap = Twap::default();

        twap.agg = Some(Aggression::Low);
        assert_eq!(
            twap.child_price(true, 9.9, 10.1, 10.0, 10.0),
            ChildPrice::Limit(9.9)
        );
        assert_eq!(
            twap.child_price(true, 0.0, 10.1, 10.0, 0.0),
            ChildPrice::Limit(10.0)
        );
        assert_eq!(
            twap.child_price(false, 9.9, 10.1, 10.0, 10.0),
            ChildPrice::Limit(10.1)
        );
        assert_eq!(twap.child_price(true, 0.0, 0.0, 0.0, 0.0), ChildPrice::Wait);

        twap.agg = Some(Aggression::Medium);
        assert_eq!(
            twap.child_price(true, 9.9, 10.1, 10.0, 10.0),
            ChildPrice::Limit(10.0)
        );
        // No mid: escalates to the aggressive touch.
        assert_eq!(
            twap.child_price(true, 0.0, 10.1, 10.0, 0.0),
            ChildPrice::Limit(10.1)
        );
        // No prices at all: goes to market.
        assert_eq!(twap.child_price(true, 0.0, 0.0, 0.0, 0.0), ChildPrice::Market);

        twap.agg = Some(Aggression::High);
        assert_eq!(
            twap.child_price(true, 9.9, 10.1, 10.0, 10.0),
            ChildPrice::Limit(10.1)
        );
        assert_eq!(
            twap.child_price(false, 9.9, 10.1, 10.0, 10.0),
            ChildPrice::Limit(9.9)
        );

        twap.agg = Some(Aggression::Highest);
        assert_eq!(
            twap.child_price(true, 9.9, 10.1, 10.0, 10.0),
            ChildPrice::Market
        );
    }
}
