//! Reference catalog: exchanges, securities, users, accounts and their maps.
//!
//! Loaded once from the relational store at startup; administrative edits
//! update the store and then publish fresh `Arc` entries, so readers never
//! observe torn values.

mod account;
pub mod db;
mod exchange;
mod security;

pub use account::{AccountBase, AccountCatalog, BrokerAccount, SubAccount, User};
pub use exchange::{Exchange, ExchangeParseError, TickSizeBand};
pub use security::{Security, SecurityCatalog, SecurityType};

use std::sync::Arc;

/// The whole reference catalog, passed by `Arc` into every subsystem in
/// place of global singletons.
#[derive(Default)]
pub struct Catalog {
    pub securities: SecurityCatalog,
    pub accounts: AccountCatalog,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn security(&self, id: u32) -> Option<Arc<Security>> {
        self.securities.security(id)
    }

    pub fn exchange(&self, id: u16) -> Option<Arc<Exchange>> {
        self.securities.exchange(id)
    }

    pub fn exchange_of(&self, sec: &Security) -> Option<Arc<Exchange>> {
        self.securities.exchange(sec.exchange_id)
    }

    pub fn user(&self, id: u16) -> Option<Arc<User>> {
        self.accounts.user(id)
    }

    pub fn sub_account(&self, id: u16) -> Option<Arc<SubAccount>> {
        self.accounts.sub_account(id)
    }

    pub fn broker_account(&self, id: u16) -> Option<Arc<BrokerAccount>> {
        self.accounts.broker_account(id)
    }
}
