//! The client wire protocol: tag-first JSON arrays.
//!
//! This module is transport-free — it parses inbound frames into typed
//! requests and encodes outbound frames; the WebSocket/HTTP layer that
//! carries them is an external integration.

use crate::algo::AlgoEvent;
use crate::marketdata::{MdSnapshot, DEPTH_SIZE};
use crate::orderbook::{Confirmation, OrdType, Order, Side, Tif};
use crate::position::{Pnl, Position, Targets};
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("frame is not a non-empty array")]
    NotAnArray,
    #[error("unknown tag: {0}")]
    UnknownTag(String),
    #[error("malformed {0} frame")]
    Malformed(&'static str),
}

/// Hex sha1 digest clients send in the login frame
/// (`[login, user, sha1(pwd)]`).
pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let out = hasher.finalize();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

bitflags::bitflags! {
    /// Which market-data fields changed between two snapshots; drives the
    /// delta frame keys.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MdFields: u32 {
        const OPEN   = 1 << 0;
        const HIGH   = 1 << 1;
        const LOW    = 1 << 2;
        const CLOSE  = 1 << 3;
        const QTY    = 1 << 4;
        const VWAP   = 1 << 5;
        const VOLUME = 1 << 6;
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Login {
        user: String,
        digest: String,
    },
    Securities,
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    /// `[order, sec_id, acc, side, type, tif, qty, px, stop_px]`
    Order {
        security_id: u32,
        sub_account_id: u16,
        side: Side,
        ord_type: OrdType,
        tif: Tif,
        qty: f64,
        price: f64,
        stop_price: f64,
    },
    Cancel {
        order_id: u32,
    },
    AlgoNew {
        name: String,
        token: String,
        params: Map<String, Value>,
    },
    AlgoCancel {
        id: Option<u32>,
        token: Option<String>,
    },
    AlgoModify {
        id: u32,
        params: Map<String, Value>,
    },
    Position {
        sub_account_id: u16,
    },
    Pnl {
        sub_account_id: u16,
    },
    TargetGet {
        sub_account_id: u16,
    },
    TargetSet {
        sub_account_id: u16,
        targets: Targets,
    },
    Offline {
        seq_confirm: u32,
        seq_algo: u32,
    },
    Shutdown {
        seconds: u64,
        interval: u64,
    },
}

fn as_u64(v: Option<&Value>) -> Option<u64> {
    v.and_then(Value::as_u64)
}

fn as_f64(v: Option<&Value>) -> Option<f64> {
    v.and_then(Value::as_f64)
}

fn as_str<'a>(v: Option<&'a Value>) -> Option<&'a str> {
    v.and_then(Value::as_str)
}

/// Parse one inbound frame.
pub fn parse(frame: &Value) -> Result<Request, ProtocolError> {
    let arr = frame.as_array().filter(|a| !a.is_empty()).ok_or(ProtocolError::NotAnArray)?;
    let tag = arr[0].as_str().ok_or(ProtocolError::NotAnArray)?;
    let rest = &arr[1..];
    match tag {
        "login" => Ok(Request::Login {
            user: as_str(rest.first())
                .ok_or(ProtocolError::Malformed("login"))?
                .to_string(),
            digest: as_str(rest.get(1))
                .ok_or(ProtocolError::Malformed("login"))?
                .to_string(),
        }),
        "securities" => Ok(Request::Securities),
        "sub" | "unsub" => {
            let mut ids = Vec::with_capacity(rest.len());
            for v in rest {
                ids.push(v.as_u64().ok_or(ProtocolError::Malformed("sub"))? as u32);
            }
            Ok(if tag == "sub" {
                Request::Subscribe(ids)
            } else {
                Request::Unsubscribe(ids)
            })
        }
        "order" => {
            let side = as_str(rest.get(2))
                .and_then(Side::parse)
                .or_else(|| {
                    as_str(rest.get(2))
                        .and_then(|s| s.chars().next())
                        .and_then(Side::from_code)
                })
                .ok_or(ProtocolError::Malformed("order"))?;
            let ord_type = as_str(rest.get(3))
                .and_then(|s| s.chars().next())
                .and_then(OrdType::from_code)
                .ok_or(ProtocolError::Malformed("order"))?;
            let tif = match as_str(rest.get(4)) {
                Some(s) => s
                    .chars()
                    .next()
                    .and_then(Tif::from_code)
                    .ok_or(ProtocolError::Malformed("order"))?,
                None => Tif::Day,
            };
            Ok(Request::Order {
                security_id: as_u64(rest.first()).ok_or(ProtocolError::Malformed("order"))? as u32,
                sub_account_id: as_u64(rest.get(1)).ok_or(ProtocolError::Malformed("order"))?
                    as u16,
                side,
                ord_type,
                tif,
                qty: as_f64(rest.get(5)).ok_or(ProtocolError::Malformed("order"))?,
                price: as_f64(rest.get(6)).unwrap_or(0.0),
                stop_price: as_f64(rest.get(7)).unwrap_or(0.0),
            })
        }
        "cancel" => Ok(Request::Cancel {
            order_id: as_u64(rest.first()).ok_or(ProtocolError::Malformed("cancel"))? as u32,
        }),
        "algo" => {
            let op = as_str(rest.first()).ok_or(ProtocolError::Malformed("algo"))?;
            match op {
                "new" | "test" => Ok(Request::AlgoNew {
                    name: as_str(rest.get(1))
                        .ok_or(ProtocolError::Malformed("algo"))?
                        .to_string(),
                    token: as_str(rest.get(2)).unwrap_or("").to_string(),
                    params: rest
                        .get(3)
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                }),
                "cancel" => match rest.get(1) {
                    Some(Value::Number(n)) => Ok(Request::AlgoCancel {
                        id: n.as_u64().map(|v| v as u32),
                        token: None,
                    }),
                    Some(Value::String(s)) => Ok(Request::AlgoCancel {
                        id: None,
                        token: Some(s.clone()),
                    }),
                    _ => Err(ProtocolError::Malformed("algo")),
                },
                "modify" => Ok(Request::AlgoModify {
                    id: as_u64(rest.get(1)).ok_or(ProtocolError::Malformed("algo"))? as u32,
                    params: rest
                        .get(2)
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                }),
                _ => Err(ProtocolError::Malformed("algo")),
            }
        }
        "position" => Ok(Request::Position {
            sub_account_id: as_u64(rest.first()).ok_or(ProtocolError::Malformed("position"))?
                as u16,
        }),
        "pnl" => Ok(Request::Pnl {
            sub_account_id: as_u64(rest.first()).ok_or(ProtocolError::Malformed("pnl"))? as u16,
        }),
        "target" => {
            let sub_account_id =
                as_u64(rest.first()).ok_or(ProtocolError::Malformed("target"))? as u16;
            match rest.get(1) {
                None => Ok(Request::TargetGet { sub_account_id }),
                Some(Value::Object(obj)) => {
                    let mut targets = Targets::new();
                    for (k, v) in obj {
                        let sec: u32 = k
                            .parse()
                            .map_err(|_| ProtocolError::Malformed("target"))?;
                        targets.insert(
                            sec,
                            v.as_f64().ok_or(ProtocolError::Malformed("target"))?,
                        );
                    }
                    Ok(Request::TargetSet {
                        sub_account_id,
                        targets,
                    })
                }
                Some(_) => Err(ProtocolError::Malformed("target")),
            }
        }
        "offline" => Ok(Request::Offline {
            seq_confirm: as_u64(rest.first()).unwrap_or(0) as u32,
            seq_algo: as_u64(rest.get(1)).unwrap_or(0) as u32,
        }),
        "shutdown" => Ok(Request::Shutdown {
            seconds: as_u64(rest.first()).unwrap_or(0),
            interval: as_u64(rest.get(1)).unwrap_or(1),
        }),
        other => Err(ProtocolError::UnknownTag(other.to_string())),
    }
}

// ── Outbound frames ─────────────────────────────────────────────────────────

/// Delta object between two snapshots; `None` when nothing changed.
/// Keys: `o,h,l,c,q,v,V` for the trade and `a/A`/`b/B` + level for depth.
pub fn md_delta(prev: &MdSnapshot, cur: &MdSnapshot) -> Option<Map<String, Value>> {
    let mut out = Map::new();
    let mut fields = MdFields::empty();
    if cur.trade.open != prev.trade.open {
        fields |= MdFields::OPEN;
    }
    if cur.trade.high != prev.trade.high {
        fields |= MdFields::HIGH;
    }
    if cur.trade.low != prev.trade.low {
        fields |= MdFields::LOW;
    }
    if cur.trade.close != prev.trade.close {
        fields |= MdFields::CLOSE;
    }
    if cur.trade.qty != prev.trade.qty {
        fields |= MdFields::QTY;
    }
    if cur.trade.vwap != prev.trade.vwap {
        fields |= MdFields::VWAP;
    }
    if cur.trade.volume != prev.trade.volume {
        fields |= MdFields::VOLUME;
    }
    for (flag, key, value) in [
        (MdFields::OPEN, "o", cur.trade.open),
        (MdFields::HIGH, "h", cur.trade.high),
        (MdFields::LOW, "l", cur.trade.low),
        (MdFields::CLOSE, "c", cur.trade.close),
        (MdFields::QTY, "q", cur.trade.qty),
        (MdFields::VWAP, "v", cur.trade.vwap),
        (MdFields::VOLUME, "V", cur.trade.volume),
    ] {
        if fields.contains(flag) {
            out.insert(key.to_string(), json!(value));
        }
    }
    for level in 0..DEPTH_SIZE {
        let (p, c) = (&prev.depth[level], &cur.depth[level]);
        if c.ask_price != p.ask_price {
            out.insert(format!("a{level}"), json!(c.ask_price));
        }
        if c.ask_size != p.ask_size {
            out.insert(format!("A{level}"), json!(c.ask_size));
        }
        if c.bid_price != p.bid_price {
            out.insert(format!("b{level}"), json!(c.bid_price));
        }
        if c.bid_size != p.bid_size {
            out.insert(format!("B{level}"), json!(c.bid_size));
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Batch per-security deltas into one `md` frame.
pub fn md_frame(deltas: Vec<(u32, Map<String, Value>)>) -> Value {
    let mut arr = vec![json!("md")];
    for (sec, delta) in deltas {
        arr.push(json!([sec, delta]));
    }
    Value::Array(arr)
}

/// A live order-confirmation frame.
pub fn order_frame(cm: &Confirmation, ord: &Order) -> Value {
    json!([
        "order",
        {
            "seq": cm.seq,
            "id": ord.id,
            "orig_id": ord.orig_id,
            "security_id": ord.security_id(),
            "acc": ord.sub_account_id(),
            "user": ord.user_id,
            "algo_id": ord.algo_id,
            "side": ord.contract.side.code().to_string(),
            "type": ord.ord_type().code().to_string(),
            "tif": ord.contract.tif.code().to_string(),
            "exec_type": format!("{:?}", cm.exec_type),
            "status": format!("{:?}", ord.status),
            "qty": ord.qty(),
            "price": ord.price(),
            "last_shares": cm.last_shares,
            "last_px": cm.last_px,
            "cum_qty": ord.cum_qty,
            "leaves_qty": ord.leaves_qty,
            "avg_px": ord.avg_px,
            "exec_id": cm.exec_id,
            "text": cm.text,
            "tm": cm.transaction_time,
        }
    ])
}

/// A journal-replay order frame (capitalized tag).
pub fn order_replay_frame(seq: u32, entry: &crate::orderbook::OrderJournalEntry) -> Value {
    json!(["Order", seq, entry])
}

/// A live or replayed algo event frame:
/// `[tag, seq, id, tm, token, name, status, body]`.
pub fn algo_frame(live: bool, event: &AlgoEvent, token: &str) -> Value {
    json!([
        if live { "algo" } else { "Algo" },
        event.seq,
        event.algo_id,
        event.tm,
        token,
        event.name,
        event.status,
        event.body,
    ])
}

/// A PnL push frame.
pub fn pnl_frame(sub_account_id: u16, tm: i64, pnl: &Pnl) -> Value {
    json!(["pnl", sub_account_id, tm, pnl.unrealized, pnl.commission, pnl.realized])
}

/// The persisted PnL time series (capitalized tag, one row per sample).
pub fn pnl_history_frame(sub_account_id: u16, history: &[(i64, Pnl)]) -> Value {
    let rows: Vec<Value> = history
        .iter()
        .map(|(tm, pnl)| json!([tm, pnl.unrealized, pnl.commission, pnl.realized]))
        .collect();
    json!(["Pnl", sub_account_id, rows])
}

/// A position snapshot frame.
pub fn position_frame(sub_account_id: u16, positions: &[(u32, Position)]) -> Value {
    let mut arr = vec![json!("position"), json!(sub_account_id)];
    for (sec, pos) in positions {
        arr.push(json!([
            sec,
            {
                "qty": pos.qty,
                "cx_qty": pos.cx_qty,
                "avg_px": pos.avg_px,
                "unrealized": pos.unrealized_pnl,
                "realized": pos.realized_pnl,
                "commission": pos.commission,
            }
        ]));
    }
    Value::Array(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketdata::Quote;

    #[test]
    fn test_password_digest_is_sha1_hex() {
        let d = password_digest("secret");
        // Known sha1("secret"), as a wire-conformant client would send.
        assert_eq!(d, "e5e9fa1ba31ecd1ae84f75caaa474f3a663f05f4");
        assert_eq!(d, password_digest("secret"));
        assert_ne!(d, password_digest("Secret"));
    }

    #[test]
    fn test_parse_login_and_order() {
        let req = parse(&json!(["login", "trader", "abcd"])).unwrap();
        assert_eq!(
            req,
            Request::Login {
                user: "trader".to_string(),
                digest: "abcd".to_string()
            }
        );

        let req = parse(&json!(["order", 1, 2, "Buy", "2", "0", 100.0, 10.0, 0.0])).unwrap();
        match req {
            Request::Order {
                security_id,
                sub_account_id,
                side,
                ord_type,
                tif,
                qty,
                price,
                stop_price,
            } => {
                assert_eq!(security_id, 1);
                assert_eq!(sub_account_id, 2);
                assert_eq!(side, Side::Buy);
                assert_eq!(ord_type, OrdType::Limit);
                assert_eq!(tif, Tif::Day);
                assert_eq!(qty, 100.0);
                assert_eq!(price, 10.0);
                assert_eq!(stop_price, 0.0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_algo_ops() {
        let req = parse(&json!(["algo", "new", "TWAP", "tok-1", {"ValidSeconds": 300}])).unwrap();
        match req {
            Request::AlgoNew { name, token, params } => {
                assert_eq!(name, "TWAP");
                assert_eq!(token, "tok-1");
                assert_eq!(params.get("ValidSeconds"), Some(&json!(300)));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            parse(&json!(["algo", "cancel", 7])).unwrap(),
            Request::AlgoCancel {
                id: Some(7),
                token: None
            }
        );
        assert_eq!(
            parse(&json!(["algo", "cancel", "tok-1"])).unwrap(),
            Request::AlgoCancel {
                id: None,
                token: Some("tok-1".to_string())
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse(&json!({})), Err(ProtocolError::NotAnArray));
        assert_eq!(parse(&json!([])), Err(ProtocolError::NotAnArray));
        assert_eq!(
            parse(&json!(["frobnicate"])),
            Err(ProtocolError::UnknownTag("frobnicate".to_string()))
        );
        assert_eq!(
            parse(&json!(["order", 1])),
            Err(ProtocolError::Malformed("order"))
        );
    }

    #[test]
    fn test_md_delta_keys() {
        let mut prev = MdSnapshot::default();
        let mut cur = MdSnapshot::default();
        assert!(md_delta(&prev, &cur).is_none());

        cur.trade.close = 10.0;
        cur.trade.volume = 100.0;
        cur.depth[0] = Quote {
            ask_price: 10.1,
            ask_size: 50.0,
            bid_price: 9.9,
            bid_size: 60.0,
        };
        let delta = md_delta(&prev, &cur).unwrap();
        assert_eq!(delta.get("c"), Some(&json!(10.0)));
        assert_eq!(delta.get("V"), Some(&json!(100.0)));
        assert_eq!(delta.get("a0"), Some(&json!(10.1)));
        assert_eq!(delta.get("A0"), Some(&json!(50.0)));
        assert_eq!(delta.get("b0"), Some(&json!(9.9)));
        assert_eq!(delta.get("B0"), Some(&json!(60.0)));
        assert!(delta.get("o").is_none());

        // Only the changed fields appear in the next delta.
        prev = cur;
        cur.trade.close = 10.5;
        let delta = md_delta(&prev, &cur).unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.get("c"), Some(&json!(10.5)));
    }

    #[test]
    fn test_target_set_parses_keys() {
        let req = parse(&json!(["target", 1, {"7": 500.0, "9": -100.0}])).unwrap();
        match req {
            Request::TargetSet {
                sub_account_id,
                targets,
            } => {
                assert_eq!(sub_account_id, 1);
                assert_eq!(targets.get(&7), Some(&500.0));
                assert_eq!(targets.get(&9), Some(&-100.0));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse(&json!(["target", 1, {"x": 1.0}])).is_err());
    }
}
