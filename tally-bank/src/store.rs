//! Storage port consumed by the reconciler, link machine and resolver.
//!
//! Adapters must provide conflict-safe upserts keyed by `external_account_id`
//! and `external_transaction_id`; that is the only concurrency guarantee the
//! reconciler relies on. An external account belongs to the user who first
//! stored it, and a link reference is unique per user.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tally_core::{
    rule_order, Account, AccountSnapshot, CategorizationRule, CategoryAudit, CategorySource, Link,
    NewRule, SyncLog, SyncStatus, Transaction, TransactionSnapshot,
};

use crate::error::{BankError, Result};

/// Outcome of an account upsert; `accounts` follows input order
#[derive(Debug, Clone, PartialEq)]
pub struct AccountUpsert {
    pub inserted: usize,
    pub accounts: Vec<Account>,
}

/// Outcome of a transaction upsert
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransactionUpsert {
    /// Local ids of rows that did not exist before, in input order
    pub inserted: Vec<i64>,
    pub updated: usize,
}

/// An explicit category change. `Manual` writes `user_category`, anything
/// else writes `category`; both set `category_source` and append an audit row.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryUpdate {
    pub category: String,
    pub source: CategorySource,
    pub reason: String,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// `StorageConflict` when an external id is already stored for another user
    async fn upsert_accounts(
        &self,
        user_id: &str,
        accounts: &[AccountSnapshot],
        at: DateTime<Utc>,
    ) -> Result<AccountUpsert>;

    async fn upsert_transactions(
        &self,
        account_id: i64,
        txns: &[TransactionSnapshot],
    ) -> Result<TransactionUpsert>;

    async fn update_transaction_category(
        &self,
        txn_id: i64,
        user_id: &str,
        update: &CategoryUpdate,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_account(&self, account_id: i64) -> Result<Option<Account>>;

    async fn list_accounts(&self, user_id: &str) -> Result<Vec<Account>>;

    async fn get_transaction(&self, txn_id: i64) -> Result<Option<Transaction>>;

    /// Newest booking date first
    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>>;

    async fn category_audit(&self, txn_id: i64) -> Result<Vec<CategoryAudit>>;

    /// Priority desc, then creation time asc
    async fn get_categorization_rules(&self, user_id: &str) -> Result<Vec<CategorizationRule>>;

    async fn add_rule(&self, user_id: &str, rule: &NewRule, at: DateTime<Utc>) -> Result<CategorizationRule>;

    /// `false` when the user had no such rule
    async fn delete_rule(&self, user_id: &str, rule_id: i64) -> Result<bool>;

    async fn start_sync_log(&self, user_id: &str, at: DateTime<Utc>) -> Result<SyncLog>;

    async fn finish_sync_log(
        &self,
        log_id: i64,
        status: SyncStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_last_sync_log(&self, user_id: &str) -> Result<Option<SyncLog>>;

    async fn get_last_successful_sync(&self, user_id: &str) -> Result<Option<SyncLog>>;

    /// Insert or replace by `link_id`. `StorageConflict` when another link of
    /// the same user already holds the reference.
    async fn save_link(&self, link: &Link) -> Result<()>;

    async fn get_link(&self, link_id: &str) -> Result<Option<Link>>;

    /// Oldest first
    async fn get_links(&self, user_id: &str) -> Result<Vec<Link>>;

    async fn find_link_by_reference(&self, user_id: &str, reference: &str) -> Result<Option<Link>>;
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    accounts: Vec<Account>,
    transactions: Vec<Transaction>,
    audit: Vec<CategoryAudit>,
    rules: Vec<CategorizationRule>,
    sync_logs: Vec<SyncLog>,
    links: Vec<Link>,
    account_by_external: HashMap<String, usize>,
    txn_by_external: HashMap<String, usize>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn owner_of_txn(&self, txn: &Transaction) -> Option<&str> {
        self.accounts
            .iter()
            .find(|a| a.id == txn.account_id)
            .map(|a| a.user_id.as_str())
    }
}

/// Everything in process memory behind one mutex
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn account_count(&self) -> usize {
        self.lock().accounts.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.lock().transactions.len()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn upsert_accounts(
        &self,
        user_id: &str,
        accounts: &[AccountSnapshot],
        at: DateTime<Utc>,
    ) -> Result<AccountUpsert> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut inserted = 0;
        let mut out = Vec::with_capacity(accounts.len());
        for snap in accounts {
            let idx = match inner.account_by_external.get(&snap.external_account_id) {
                Some(&idx) if inner.accounts[idx].user_id != user_id => {
                    return Err(BankError::StorageConflict(format!(
                        "account {} belongs to another user",
                        snap.external_account_id
                    )));
                }
                Some(&idx) => {
                    let acc = &mut inner.accounts[idx];
                    acc.name = snap.name.clone();
                    acc.iban = snap.iban.clone();
                    acc.currency = snap.currency.clone();
                    acc.balance = snap.balance;
                    acc.last_updated = at;
                    idx
                }
                None => {
                    let id = inner.next_id();
                    inner.accounts.push(Account {
                        id,
                        user_id: user_id.to_string(),
                        external_account_id: snap.external_account_id.clone(),
                        name: snap.name.clone(),
                        iban: snap.iban.clone(),
                        currency: snap.currency.clone(),
                        balance: snap.balance,
                        last_updated: at,
                    });
                    let idx = inner.accounts.len() - 1;
                    inner
                        .account_by_external
                        .insert(snap.external_account_id.clone(), idx);
                    inserted += 1;
                    idx
                }
            };
            out.push(inner.accounts[idx].clone());
        }
        Ok(AccountUpsert {
            inserted,
            accounts: out,
        })
    }

    async fn upsert_transactions(
        &self,
        account_id: i64,
        txns: &[TransactionSnapshot],
    ) -> Result<TransactionUpsert> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.accounts.iter().any(|a| a.id == account_id) {
            return Err(BankError::Storage(format!("no account {account_id}")));
        }
        let mut result = TransactionUpsert::default();
        for snap in txns {
            match inner.txn_by_external.get(&snap.external_transaction_id) {
                Some(&idx) => {
                    let t = &mut inner.transactions[idx];
                    t.date = snap.date;
                    t.amount = snap.amount;
                    t.currency = snap.currency.clone();
                    t.description = snap.description.clone();
                    t.creditor_name = snap.creditor_name.clone();
                    t.debtor_name = snap.debtor_name.clone();
                    result.updated += 1;
                }
                None => {
                    let id = inner.next_id();
                    inner.transactions.push(Transaction {
                        id,
                        account_id,
                        external_transaction_id: snap.external_transaction_id.clone(),
                        date: snap.date,
                        amount: snap.amount,
                        currency: snap.currency.clone(),
                        description: snap.description.clone(),
                        creditor_name: snap.creditor_name.clone(),
                        debtor_name: snap.debtor_name.clone(),
                        category: None,
                        user_category: None,
                        category_source: CategorySource::Auto,
                    });
                    let idx = inner.transactions.len() - 1;
                    inner
                        .txn_by_external
                        .insert(snap.external_transaction_id.clone(), idx);
                    result.inserted.push(id);
                }
            }
        }
        Ok(result)
    }

    async fn update_transaction_category(
        &self,
        txn_id: i64,
        user_id: &str,
        update: &CategoryUpdate,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let idx = inner
            .transactions
            .iter()
            .position(|t| t.id == txn_id)
            .ok_or(BankError::UnknownTransaction(txn_id))?;
        if inner.owner_of_txn(&inner.transactions[idx]) != Some(user_id) {
            return Err(BankError::UnknownTransaction(txn_id));
        }
        let audit_id = inner.next_id();
        let txn = &mut inner.transactions[idx];
        let old_category = (!txn.is_uncategorized()).then(|| txn.effective_category().to_string());
        match update.source {
            CategorySource::Manual => txn.user_category = Some(update.category.clone()),
            CategorySource::Auto | CategorySource::Rule => txn.category = Some(update.category.clone()),
        }
        txn.category_source = update.source;
        inner.audit.push(CategoryAudit {
            id: audit_id,
            transaction_id: txn_id,
            user_id: user_id.to_string(),
            old_category,
            new_category: update.category.clone(),
            source: update.source,
            reason: update.reason.clone(),
            changed_at: at,
        });
        Ok(())
    }

    async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        Ok(self.lock().accounts.iter().find(|a| a.id == account_id).cloned())
    }

    async fn list_accounts(&self, user_id: &str) -> Result<Vec<Account>> {
        Ok(self
            .lock()
            .accounts
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, txn_id: i64) -> Result<Option<Transaction>> {
        Ok(self.lock().transactions.iter().find(|t| t.id == txn_id).cloned())
    }

    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let inner = self.lock();
        let mut out: Vec<Transaction> = inner
            .transactions
            .iter()
            .filter(|t| inner.owner_of_txn(t) == Some(user_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    async fn category_audit(&self, txn_id: i64) -> Result<Vec<CategoryAudit>> {
        Ok(self
            .lock()
            .audit
            .iter()
            .filter(|a| a.transaction_id == txn_id)
            .cloned()
            .collect())
    }

    async fn get_categorization_rules(&self, user_id: &str) -> Result<Vec<CategorizationRule>> {
        let mut rules: Vec<CategorizationRule> = self
            .lock()
            .rules
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        rules.sort_by(rule_order);
        Ok(rules)
    }

    async fn add_rule(&self, user_id: &str, rule: &NewRule, at: DateTime<Utc>) -> Result<CategorizationRule> {
        let mut inner = self.lock();
        let id = inner.next_id();
        let stored = CategorizationRule {
            id,
            user_id: user_id.to_string(),
            keyword: rule.keyword.clone(),
            match_type: rule.match_type,
            category: rule.category.clone(),
            priority: rule.priority,
            created_at: at,
        };
        inner.rules.push(stored.clone());
        Ok(stored)
    }

    async fn delete_rule(&self, user_id: &str, rule_id: i64) -> Result<bool> {
        let mut inner = self.lock();
        let before = inner.rules.len();
        inner.rules.retain(|r| !(r.id == rule_id && r.user_id == user_id));
        Ok(inner.rules.len() != before)
    }

    async fn start_sync_log(&self, user_id: &str, at: DateTime<Utc>) -> Result<SyncLog> {
        let mut inner = self.lock();
        let log = SyncLog {
            id: inner.next_id(),
            user_id: user_id.to_string(),
            started_at: at,
            finished_at: None,
            status: SyncStatus::InProgress,
            error_message: None,
        };
        inner.sync_logs.push(log.clone());
        Ok(log)
    }

    async fn finish_sync_log(
        &self,
        log_id: i64,
        status: SyncStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let log = inner
            .sync_logs
            .iter_mut()
            .find(|l| l.id == log_id)
            .ok_or_else(|| BankError::Storage(format!("no sync log {log_id}")))?;
        log.status = status;
        log.error_message = error.map(str::to_string);
        log.finished_at = Some(at);
        Ok(())
    }

    async fn get_last_sync_log(&self, user_id: &str) -> Result<Option<SyncLog>> {
        Ok(self
            .lock()
            .sync_logs
            .iter()
            .filter(|l| l.user_id == user_id)
            .max_by_key(|l| (l.started_at, l.id))
            .cloned())
    }

    async fn get_last_successful_sync(&self, user_id: &str) -> Result<Option<SyncLog>> {
        Ok(self
            .lock()
            .sync_logs
            .iter()
            .filter(|l| l.user_id == user_id && l.status == SyncStatus::Success)
            .max_by_key(|l| (l.started_at, l.id))
            .cloned())
    }

    async fn save_link(&self, link: &Link) -> Result<()> {
        let mut inner = self.lock();
        if inner
            .links
            .iter()
            .any(|l| l.user_id == link.user_id && l.reference == link.reference && l.link_id != link.link_id)
        {
            return Err(BankError::StorageConflict(format!(
                "reference {} already used by user {}",
                link.reference, link.user_id
            )));
        }
        match inner.links.iter_mut().find(|l| l.link_id == link.link_id) {
            Some(existing) => *existing = link.clone(),
            None => inner.links.push(link.clone()),
        }
        Ok(())
    }

    async fn get_links(&self, user_id: &str) -> Result<Vec<Link>> {
        let mut links: Vec<Link> = self
            .lock()
            .links
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        links.sort_by_key(|l| l.created_at);
        Ok(links)
    }

    async fn get_link(&self, link_id: &str) -> Result<Option<Link>> {
        Ok(self.lock().links.iter().find(|l| l.link_id == link_id).cloned())
    }

    async fn find_link_by_reference(&self, user_id: &str, reference: &str) -> Result<Option<Link>> {
        Ok(self
            .lock()
            .links
            .iter()
            .find(|l| l.user_id == user_id && l.reference == reference)
            .cloned())
    }
}
