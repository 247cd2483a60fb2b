//! Per-client session logic: login, market-data subscriptions with delta
//! push, order and algo control, snapshots and journal replay. The frame
//! transport (WebSocket in production) stays outside the core.

use super::protocol::{self, Request};
use crate::catalog::User;
use crate::core::Core;
use crate::marketdata::{DataSrc, MdSnapshot};
use crate::orderbook::Contract;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One client session.
pub struct Session {
    core: Arc<Core>,
    user: Option<Arc<User>>,
    subs: HashSet<u32>,
    md_prev: HashMap<u32, MdSnapshot>,
}

fn err_frame(text: impl Into<String>) -> Value {
    json!(["error", text.into()])
}

fn ok_frame(tag: &str) -> Value {
    json!([tag, "ok"])
}

impl Session {
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            user: None,
            subs: HashSet::new(),
            md_prev: HashMap::new(),
        }
    }

    pub fn user(&self) -> Option<&Arc<User>> {
        self.user.as_ref()
    }

    fn default_src(&self) -> DataSrc {
        self.core
            .md
            .default_feed()
            .map(|f| f.src())
            .unwrap_or(DataSrc(0))
    }

    fn can_use_sub_account(&self, id: u16) -> bool {
        self.user
            .as_ref()
            .map(|u| u.is_admin || u.has_sub_account(id))
            .unwrap_or(false)
    }

    /// Handle one inbound frame; returns the response frames.
    pub fn handle(&mut self, frame: &Value) -> Vec<Value> {
        let req = match protocol::parse(frame) {
            Ok(req) => req,
            Err(e) => return vec![err_frame(e.to_string())],
        };
        if self.user.is_none() && !matches!(req, Request::Login { .. }) {
            return vec![err_frame("not logged in")];
        }
        match req {
            Request::Login { user, digest } => self.login(&user, &digest),
            Request::Securities => self.securities(),
            Request::Subscribe(ids) => {
                for id in ids {
                    if let Some(sec) = self.core.catalog.security(id) {
                        self.core.md.subscribe(&sec, DataSrc(0));
                        self.subs.insert(id);
                    }
                }
                vec![ok_frame("sub")]
            }
            Request::Unsubscribe(ids) => {
                for id in ids {
                    self.subs.remove(&id);
                    self.md_prev.remove(&id);
                }
                vec![ok_frame("unsub")]
            }
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
                let user = self.user.as_ref().map(|u| u.id).unwrap_or(0);
                let contract = Contract {
                    security_id,
                    sub_account_id,
                    qty,
                    price,
                    stop_price,
                    side,
                    ord_type,
                    tif,
                    ..Default::default()
                };
                match self
                    .core
                    .dispatch
                    .place(crate::orderbook::Order::from_contract(contract, user))
                {
                    Ok(id) => vec![json!(["order", id])],
                    Err(e) => vec![json!(["order", "error", e])],
                }
            }
            Request::Cancel { order_id } => match self.core.book.get(order_id) {
                Some(ord) => {
                    let me = self.user.as_ref().map(|u| (u.id, u.is_admin)).unwrap_or((0, false));
                    if !me.1 && ord.user_id != me.0 {
                        return vec![err_frame("not your order")];
                    }
                    match self.core.dispatch.cancel(&ord) {
                        Ok(id) => vec![json!(["cancel", id])],
                        Err(e) => vec![json!(["cancel", "error", e])],
                    }
                }
                None => vec![err_frame("unknown order")],
            },
            Request::AlgoNew {
                name,
                token,
                params,
            } => {
                let user = self.user.as_ref().map(|u| u.id).unwrap_or(0);
                match self.core.algos.spawn(&name, params, user, &token) {
                    Ok(id) => vec![json!(["algo", id])],
                    Err(e) => vec![json!(["algo", "error", e])],
                }
            }
            Request::AlgoCancel { id, token } => {
                let me = self.user.as_ref().map(|u| (u.id, u.is_admin)).unwrap_or((0, false));
                let info = match (id, &token) {
                    (Some(id), _) => self.core.algos.algo_info(id),
                    (None, Some(token)) => self.core.algos.algo_by_token(token),
                    _ => None,
                };
                match info {
                    Some(info) if me.1 || info.user_id == me.0 => {
                        self.core.algos.stop(info.id);
                        vec![ok_frame("algo")]
                    }
                    Some(_) => vec![err_frame("not your algo")],
                    None => vec![err_frame("unknown algo")],
                }
            }
            Request::AlgoModify { id, params } => {
                let me = self.user.as_ref().map(|u| (u.id, u.is_admin)).unwrap_or((0, false));
                match self.core.algos.algo_info(id) {
                    Some(info) if me.1 || info.user_id == me.0 => {
                        self.core.algos.modify(id, params);
                        vec![ok_frame("algo")]
                    }
                    Some(_) => vec![err_frame("not your algo")],
                    None => vec![err_frame("unknown algo")],
                }
            }
            Request::Position { sub_account_id } => {
                if !self.can_use_sub_account(sub_account_id) {
                    return vec![err_frame("not permissioned")];
                }
                let positions = self.core.positions.sub_positions_of(sub_account_id);
                vec![protocol::position_frame(sub_account_id, &positions)]
            }
            Request::Pnl { sub_account_id } => {
                if !self.can_use_sub_account(sub_account_id) {
                    return vec![err_frame("not permissioned")];
                }
                // Persisted history first, then the live value.
                let history = self.core.positions.pnl_history(sub_account_id);
                let mut frames = Vec::with_capacity(2);
                if !history.is_empty() {
                    frames.push(protocol::pnl_history_frame(sub_account_id, &history));
                }
                let pnl = self.core.positions.pnl(sub_account_id);
                frames.push(protocol::pnl_frame(
                    sub_account_id,
                    crate::utils::now_secs(),
                    &pnl,
                ));
                frames
            }
            Request::TargetGet { sub_account_id } => {
                if !self.can_use_sub_account(sub_account_id) {
                    return vec![err_frame("not permissioned")];
                }
                let targets = self
                    .core
                    .positions
                    .targets(sub_account_id)
                    .map(|t| (*t).clone())
                    .unwrap_or_default();
                vec![json!(["target", sub_account_id, targets])]
            }
            Request::TargetSet {
                sub_account_id,
                targets,
            } => {
                if !self.can_use_sub_account(sub_account_id) {
                    return vec![err_frame("not permissioned")];
                }
                match self.core.positions.set_targets(sub_account_id, targets) {
                    Ok(()) => vec![ok_frame("target")],
                    Err(e) => vec![err_frame(e.to_string())],
                }
            }
            Request::Offline {
                seq_confirm,
                seq_algo,
            } => self.offline(seq_confirm, seq_algo),
            Request::Shutdown { seconds, interval } => {
                let is_admin = self.user.as_ref().map(|u| u.is_admin).unwrap_or(false);
                if !is_admin {
                    return vec![err_frame("admin only")];
                }
                info!("shutdown requested: {seconds}s grace");
                let core = self.core.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_secs(seconds));
                    core.shutdown(Duration::from_secs(interval.max(1)));
                });
                vec![ok_frame("shutdown")]
            }
        }
    }

    fn login(&mut self, name: &str, digest: &str) -> Vec<Value> {
        let Some(user) = self.core.catalog.accounts.user_by_name(name) else {
            return vec![json!(["login", "error", "unknown user"])];
        };
        if user.base.is_disabled() {
            return vec![json!(["login", "error", "user disabled"])];
        }
        if !user.password_digest.is_empty() && user.password_digest != digest {
            return vec![json!(["login", "error", "wrong password"])];
        }
        let frame = json!(["login", "ok", user.id, user.is_admin]);
        self.user = Some(user);
        vec![frame]
    }

    fn securities(&self) -> Vec<Value> {
        let mut arr = vec![json!("securities"), json!(self.core.catalog.securities.check_sum())];
        for sec in self.core.catalog.securities.securities() {
            arr.push(json!([
                sec.id,
                sec.exchange_id,
                sec.symbol,
                sec.sec_type.tag(),
                sec.lot_size,
                sec.multiplier,
                sec.close_price,
            ]));
        }
        vec![Value::Array(arr)]
    }

    fn offline(&self, seq_confirm: u32, seq_algo: u32) -> Vec<Value> {
        let (user_id, is_admin) = self
            .user
            .as_ref()
            .map(|u| (u.id, u.is_admin))
            .unwrap_or((0, false));
        let mut frames = Vec::new();
        let _ = self.core.book.replay(seq_confirm, user_id, is_admin, |seq, entry| {
            frames.push(protocol::order_replay_frame(seq, entry));
        });
        let _ = self.core.algos.replay(seq_algo, user_id, is_admin, |event| {
            frames.push(protocol::algo_frame(false, event, ""));
        });
        frames.push(json!(["offline", "done"]));
        frames
    }

    /// Collect market-data delta frames for the session's subscriptions.
    /// The transport calls this on its push cadence.
    pub fn poll_md(&mut self) -> Option<Value> {
        let src = self.default_src();
        let mut deltas = Vec::new();
        for &sec in &self.subs {
            let cur = self.core.md.snapshot(src, sec);
            let prev = self.md_prev.entry(sec).or_default();
            if let Some(delta) = protocol::md_delta(prev, &cur) {
                deltas.push((sec, delta));
            }
            *prev = cur;
        }
        if deltas.is_empty() {
            None
        } else {
            deltas.sort_by_key(|(sec, _)| *sec);
            Some(protocol::md_frame(deltas))
        }
    }
}
