//! Trading accounts: users, sub-accounts and broker accounts.

use crate::risk::{Limits, Throttle};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// State shared by every account scope: limits, throttles and the disabled
/// flag. Limits change rarely (admin edits); throttles are bumped on the
/// order hot path and are plain atomics.
#[derive(Debug, Default)]
pub struct AccountBase {
    pub limits: RwLock<Limits>,
    pub throttle_in_sec: Throttle,
    pub throttle_per_security_in_sec: DashMap<u32, Throttle>,
    disabled: AtomicBool,
}

impl AccountBase {
    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits: RwLock::new(limits),
            ..Default::default()
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits.read().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn set_limits(&self, limits: Limits) {
        if let Ok(mut l) = self.limits.write() {
            *l = limits;
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, v: bool) {
        self.disabled.store(v, Ordering::Relaxed);
    }

    /// Bump the per-second throttle (and the per-security one when a
    /// per-security message-rate limit is configured).
    pub fn update_throttle(&self, security_id: u32, now: i64) {
        self.throttle_in_sec.update(now);
        if self.limits().msg_rate_per_security > 0.0 {
            self.throttle_per_security_in_sec
                .entry(security_id)
                .or_default()
                .update(now);
        }
    }
}

/// A desk/strategy bucket below a user. Carries its own limits and the
/// immutable exchange→broker-account routing map.
#[derive(Debug, Default)]
pub struct SubAccount {
    pub id: u16,
    pub name: String,
    pub base: AccountBase,
    /// exchange_id → broker_account_id; entry 0 is the catch-all default.
    pub broker_accounts: HashMap<u16, u16>,
}

impl SubAccount {
    /// Resolve the broker account for an exchange, falling back to the
    /// exchange-0 default.
    pub fn broker_account_for(&self, exchange_id: u16) -> Option<u16> {
        self.broker_accounts
            .get(&exchange_id)
            .or_else(|| self.broker_accounts.get(&0))
            .copied()
    }
}

/// An adapter-bound identity used to route orders to a venue.
#[derive(Debug, Default)]
pub struct BrokerAccount {
    pub id: u16,
    pub name: String,
    /// Name of the exchange-connectivity adapter handling this account.
    pub adapter_name: String,
    /// Optional commission adapter name.
    pub commission_adapter: Option<String>,
    pub base: AccountBase,
}

/// A desk user. Holds the set of sub-accounts the user may trade with.
#[derive(Debug, Default)]
pub struct User {
    pub id: u16,
    pub name: String,
    /// Hex digest of the password (see `server::protocol::password_digest`).
    pub password_digest: String,
    pub is_admin: bool,
    pub base: AccountBase,
    pub sub_accounts: HashSet<u16>,
}

impl User {
    pub fn has_sub_account(&self, id: u16) -> bool {
        self.sub_accounts.contains(&id)
    }
}

/// The account half of the reference catalog. Entries are `Arc`-published;
/// mutation is atomic replacement.
#[derive(Default)]
pub struct AccountCatalog {
    users: DashMap<u16, Arc<User>>,
    users_by_name: DashMap<String, u16>,
    sub_accounts: DashMap<u16, Arc<SubAccount>>,
    sub_accounts_by_name: DashMap<String, u16>,
    broker_accounts: DashMap<u16, Arc<BrokerAccount>>,
    broker_accounts_by_name: DashMap<String, u16>,
}

impl AccountCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_user(&self, user: User) {
        self.users_by_name.insert(user.name.clone(), user.id);
        self.users.insert(user.id, Arc::new(user));
    }

    pub fn publish_sub_account(&self, acc: SubAccount) {
        self.sub_accounts_by_name.insert(acc.name.clone(), acc.id);
        self.sub_accounts.insert(acc.id, Arc::new(acc));
    }

    pub fn publish_broker_account(&self, acc: BrokerAccount) {
        self.broker_accounts_by_name.insert(acc.name.clone(), acc.id);
        self.broker_accounts.insert(acc.id, Arc::new(acc));
    }

    pub fn user(&self, id: u16) -> Option<Arc<User>> {
        self.users.get(&id).map(|u| u.clone())
    }

    pub fn user_by_name(&self, name: &str) -> Option<Arc<User>> {
        self.users_by_name.get(name).and_then(|id| self.user(*id))
    }

    pub fn sub_account(&self, id: u16) -> Option<Arc<SubAccount>> {
        self.sub_accounts.get(&id).map(|a| a.clone())
    }

    pub fn sub_account_by_name(&self, name: &str) -> Option<Arc<SubAccount>> {
        self.sub_accounts_by_name
            .get(name)
            .and_then(|id| self.sub_account(*id))
    }

    pub fn broker_account(&self, id: u16) -> Option<Arc<BrokerAccount>> {
        self.broker_accounts.get(&id).map(|a| a.clone())
    }

    pub fn broker_account_by_name(&self, name: &str) -> Option<Arc<BrokerAccount>> {
        self.broker_accounts_by_name
            .get(name)
            .and_then(|id| self.broker_account(*id))
    }

    pub fn sub_account_ids(&self) -> Vec<u16> {
        self.sub_accounts.iter().map(|e| *e.key()).collect()
    }

    pub fn broker_account_ids(&self) -> Vec<u16> {
        self.broker_accounts.iter().map(|e| *e.key()).collect()
    }

    pub fn user_ids(&self) -> Vec<u16> {
        self.users.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_account_fallback() {
        let mut acc = SubAccount {
            id: 1,
            name: "alpha".to_string(),
            ..Default::default()
        };
        acc.broker_accounts.insert(2, 20);
        acc.broker_accounts.insert(0, 9);
        assert_eq!(acc.broker_account_for(2), Some(20));
        assert_eq!(acc.broker_account_for(5), Some(9));

        let bare = SubAccount::default();
        assert_eq!(bare.broker_account_for(2), None);
    }

    #[test]
    fn test_catalog_lookup_by_id_and_name() {
        let cat = AccountCatalog::new();
        cat.publish_user(User {
            id: 3,
            name: "trader".to_string(),
            is_admin: false,
            ..Default::default()
        });
        cat.publish_sub_account(SubAccount {
            id: 1,
            name: "alpha".to_string(),
            ..Default::default()
        });
        cat.publish_broker_account(BrokerAccount {
            id: 8,
            name: "prime".to_string(),
            adapter_name: "sim".to_string(),
            ..Default::default()
        });

        assert_eq!(cat.user_by_name("trader").unwrap().id, 3);
        assert_eq!(cat.sub_account_by_name("alpha").unwrap().id, 1);
        assert_eq!(cat.broker_account_by_name("prime").unwrap().adapter_name, "sim");
        assert!(cat.user(99).is_none());
    }

    #[test]
    fn test_publish_replaces_atomically() {
        let cat = AccountCatalog::new();
        cat.publish_sub_account(SubAccount {
            id: 1,
            name: "alpha".to_string(),
            ..Default::default()
        });
        let before = cat.sub_account(1).unwrap();
        cat.publish_sub_account(SubAccount {
            id: 1,
            name: "alpha".to_string(),
            broker_accounts: [(0u16, 4u16)].into_iter().collect(),
            ..Default::default()
        });
        // The old Arc is still whole for readers that grabbed it.
        assert!(before.broker_accounts.is_empty());
        assert_eq!(cat.sub_account(1).unwrap().broker_account_for(1), Some(4));
    }
}
