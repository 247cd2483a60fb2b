//! Relational load of the reference catalog.
//!
//! The catalog tables are read once at startup; the position table schema
//! lives here too so `--db_create_tables` produces a complete database.

use super::{
    BrokerAccount, Catalog, Exchange, Security, SecurityType, SubAccount, User,
};
use crate::risk::Limits;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid catalog row: {0}")]
    InvalidRow(String),
}

/// Create every table the platform uses. Idempotent.
pub fn create_tables(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        r#"
        create table if not exists exchange(
            id integer primary key, name text unique not null, mic text,
            country text, utc_time_offset integer default 0,
            odd_lot_allowed integer default 0,
            trade_period text, break_period text,
            half_day integer default 0, half_days text,
            tick_size_table text
        );
        create table if not exists security(
            id integer primary key, symbol text not null, local_symbol text,
            type text not null, currency text, exchange_id integer not null,
            rate real default 1, multiplier real default 1,
            tick_size real default 0, close_price real default 0,
            lot_size integer default 0, underlying_id integer default 0
        );
        create table if not exists user(
            id integer primary key, name text unique not null,
            password text, is_admin integer default 0,
            is_disabled integer default 0, limits text
        );
        create table if not exists sub_account(
            id integer primary key, name text unique not null, limits text
        );
        create table if not exists broker_account(
            id integer primary key, name text unique not null,
            adapter text not null, commission_adapter text, limits text
        );
        create table if not exists sub_account_broker_account_map(
            sub_account_id integer not null, exchange_id integer not null,
            broker_account_id integer not null,
            primary key (sub_account_id, exchange_id)
        );
        create table if not exists user_sub_account_map(
            user_id integer not null, sub_account_id integer not null,
            primary key (user_id, sub_account_id)
        );
        create table if not exists position(
            user_id integer, sub_account_id integer, security_id integer,
            broker_account_id integer, qty real, cx_qty real, avg_px real,
            realized_pnl real, commission real, tm text, info text
        );
        create index if not exists position_sub_sec
            on position(sub_account_id, security_id, tm);
        "#,
    )?;
    Ok(())
}

fn parse_limits(s: Option<String>) -> Result<Limits, DbError> {
    match s {
        Some(s) if !s.trim().is_empty() => {
            Limits::parse(&s).map_err(DbError::InvalidRow)
        }
        _ => Ok(Limits::default()),
    }
}

/// Load the whole reference catalog from the database.
pub fn load_catalog(conn: &Connection) -> Result<Catalog, DbError> {
    let catalog = Catalog::new();

    let mut st = conn.prepare(
        "select id, name, mic, country, utc_time_offset, odd_lot_allowed,
                trade_period, break_period, half_day, half_days, tick_size_table
         from exchange",
    )?;
    let rows = st.query_map([], |row| {
        Ok((
            row.get::<_, u16>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, i32>(4)?,
            row.get::<_, bool>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, i32>(8)?,
            row.get::<_, Option<String>>(9)?,
            row.get::<_, Option<String>>(10)?,
        ))
    })?;
    for row in rows {
        let (id, name, mic, country, utc_time_offset, odd_lot_allowed, trade, brk, half_day, half_days, ticks) =
            row?;
        let mut ex = Exchange {
            id,
            name,
            mic: mic.unwrap_or_default(),
            country: country.unwrap_or_default(),
            utc_time_offset,
            odd_lot_allowed,
            half_day,
            ..Default::default()
        };
        if let Some(p) = trade.filter(|p| !p.is_empty()) {
            let (a, b) = Exchange::parse_period(&p).map_err(|e| DbError::InvalidRow(e.to_string()))?;
            ex.trade_start = a;
            ex.trade_end = b;
        }
        if let Some(p) = brk.filter(|p| !p.is_empty()) {
            let (a, b) = Exchange::parse_period(&p).map_err(|e| DbError::InvalidRow(e.to_string()))?;
            ex.break_start = a;
            ex.break_end = b;
        }
        if let Some(h) = half_days.filter(|h| !h.is_empty()) {
            ex.half_days =
                Exchange::parse_half_days(&h).map_err(|e| DbError::InvalidRow(e.to_string()))?;
        }
        if let Some(t) = ticks.filter(|t| !t.is_empty()) {
            ex.tick_size_table = Exchange::parse_tick_size_table(&t)
                .map_err(|e| DbError::InvalidRow(e.to_string()))?;
        }
        catalog.securities.publish_exchange(ex);
    }

    let mut st = conn.prepare(
        "select id, symbol, local_symbol, type, currency, exchange_id, rate,
                multiplier, tick_size, close_price, lot_size, underlying_id
         from security",
    )?;
    let rows = st.query_map([], |row| {
        Ok(Security {
            id: row.get(0)?,
            symbol: row.get(1)?,
            local_symbol: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            sec_type: SecurityType::from_tag(&row.get::<_, String>(3)?)
                .unwrap_or(SecurityType::Stock),
            currency: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            exchange_id: row.get(5)?,
            rate: row.get(6)?,
            multiplier: row.get(7)?,
            tick_size: row.get(8)?,
            close_price: row.get(9)?,
            lot_size: row.get(10)?,
            underlying_id: row.get(11)?,
        })
    })?;
    for sec in rows {
        catalog.securities.publish_security(sec?);
    }

    let mut broker_map: HashMap<u16, HashMap<u16, u16>> = HashMap::new();
    let mut st =
        conn.prepare("select sub_account_id, exchange_id, broker_account_id from sub_account_broker_account_map")?;
    let rows = st.query_map([], |row| {
        Ok((row.get::<_, u16>(0)?, row.get::<_, u16>(1)?, row.get::<_, u16>(2)?))
    })?;
    for row in rows {
        let (sub, exch, broker) = row?;
        broker_map.entry(sub).or_default().insert(exch, broker);
    }

    let mut user_subs: HashMap<u16, HashSet<u16>> = HashMap::new();
    let mut st = conn.prepare("select user_id, sub_account_id from user_sub_account_map")?;
    let rows = st.query_map([], |row| Ok((row.get::<_, u16>(0)?, row.get::<_, u16>(1)?)))?;
    for row in rows {
        let (user, sub) = row?;
        user_subs.entry(user).or_default().insert(sub);
    }

    let mut st = conn.prepare("select id, name, limits from sub_account")?;
    let rows = st.query_map([], |row| {
        Ok((row.get::<_, u16>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?))
    })?;
    for row in rows {
        let (id, name, limits) = row?;
        catalog.accounts.publish_sub_account(SubAccount {
            id,
            name,
            base: super::AccountBase::with_limits(parse_limits(limits)?),
            broker_accounts: broker_map.remove(&id).unwrap_or_default(),
        });
    }

    let mut st =
        conn.prepare("select id, name, adapter, commission_adapter, limits from broker_account")?;
    let rows = st.query_map([], |row| {
        Ok((
            row.get::<_, u16>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;
    for row in rows {
        let (id, name, adapter_name, commission_adapter, limits) = row?;
        catalog.accounts.publish_broker_account(BrokerAccount {
            id,
            name,
            adapter_name,
            commission_adapter: commission_adapter.filter(|c| !c.is_empty()),
            base: super::AccountBase::with_limits(parse_limits(limits)?),
        });
    }

    let mut st =
        conn.prepare("select id, name, password, is_admin, is_disabled, limits from user")?;
    let rows = st.query_map([], |row| {
        Ok((
            row.get::<_, u16>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, bool>(3)?,
            row.get::<_, bool>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;
    for row in rows {
        let (id, name, password, is_admin, is_disabled, limits) = row?;
        let user = User {
            id,
            name,
            password_digest: password.unwrap_or_default(),
            is_admin,
            base: super::AccountBase::with_limits(parse_limits(limits)?),
            sub_accounts: user_subs.remove(&id).unwrap_or_default(),
        };
        user.base.set_disabled(is_disabled);
        catalog.accounts.publish_user(user);
    }

    Ok(catalog)
}
