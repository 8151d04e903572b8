//! SQLite adapter for the storage port.
//!
//! Upserts use `ON CONFLICT ... DO UPDATE` on the external id columns, so
//! concurrent syncs for the same user converge on the same rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tally_core::{
    Account, AccountSnapshot, CategorizationRule, CategoryAudit, CategorySource, Link, LinkStatus,
    MatchType, NewRule, SyncLog, SyncStatus, Transaction, TransactionSnapshot,
};

use crate::error::{BankError, Result};
use crate::store::{AccountUpsert, CategoryUpdate, Storage, TransactionUpsert};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    external_account_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    iban TEXT,
    currency TEXT NOT NULL,
    balance REAL NOT NULL,
    last_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    account_id INTEGER NOT NULL,
    external_transaction_id TEXT NOT NULL UNIQUE,
    date TEXT NOT NULL,
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    description TEXT NOT NULL,
    creditor_name TEXT,
    debtor_name TEXT,
    category TEXT,
    user_category TEXT,
    category_source TEXT NOT NULL DEFAULT 'auto',
    FOREIGN KEY (account_id) REFERENCES accounts(id)
);

CREATE TABLE IF NOT EXISTS category_audit (
    id INTEGER PRIMARY KEY,
    transaction_id INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    old_category TEXT,
    new_category TEXT NOT NULL,
    source TEXT NOT NULL,
    reason TEXT NOT NULL,
    changed_at TEXT NOT NULL,
    FOREIGN KEY (transaction_id) REFERENCES transactions(id)
);

CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    keyword TEXT NOT NULL,
    match_type TEXT NOT NULL DEFAULT 'contains',
    category TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_logs (
    id INTEGER PRIMARY KEY,
    user_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS links (
    link_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    institution_id TEXT NOT NULL,
    reference TEXT NOT NULL,
    status TEXT NOT NULL,
    accounts TEXT NOT NULL DEFAULT '[]',
    redirect_url TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id);
DROP INDEX IF EXISTS idx_links_reference;
CREATE UNIQUE INDEX IF NOT EXISTS idx_links_user_reference ON links(user_id, reference);
CREATE INDEX IF NOT EXISTS idx_sync_logs_user ON sync_logs(user_id, started_at);
";

const ACCOUNT_COLS: &str = "id, user_id, external_account_id, name, iban, currency, balance, last_updated";
const TXN_COLS: &str = "t.id, t.account_id, t.external_transaction_id, t.date, t.amount, t.currency, \
    t.description, t.creditor_name, t.debtor_name, t.category, t.user_category, t.category_source";
const RULE_COLS: &str = "id, user_id, keyword, match_type, category, priority, created_at";
const LOG_COLS: &str = "id, user_id, started_at, finished_at, status, error_message";
const LINK_COLS: &str = "link_id, user_id, institution_id, reference, status, accounts, redirect_url, created_at, updated_at";

fn bad_value(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("invalid {what}: {value}").into(),
    )
}

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        external_account_id: row.get(2)?,
        name: row.get(3)?,
        iban: row.get(4)?,
        currency: row.get(5)?,
        balance: row.get(6)?,
        last_updated: row.get(7)?,
    })
}

fn txn_from_row(row: &Row) -> rusqlite::Result<Transaction> {
    let source: String = row.get(11)?;
    Ok(Transaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        external_transaction_id: row.get(2)?,
        date: row.get(3)?,
        amount: row.get(4)?,
        currency: row.get(5)?,
        description: row.get(6)?,
        creditor_name: row.get(7)?,
        debtor_name: row.get(8)?,
        category: row.get(9)?,
        user_category: row.get(10)?,
        category_source: CategorySource::parse(&source).ok_or_else(|| bad_value(11, "category source", &source))?,
    })
}

fn rule_from_row(row: &Row) -> rusqlite::Result<CategorizationRule> {
    let match_type: String = row.get(3)?;
    Ok(CategorizationRule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        keyword: row.get(2)?,
        match_type: MatchType::parse(&match_type).ok_or_else(|| bad_value(3, "match type", &match_type))?,
        category: row.get(4)?,
        priority: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn log_from_row(row: &Row) -> rusqlite::Result<SyncLog> {
    let status: String = row.get(4)?;
    Ok(SyncLog {
        id: row.get(0)?,
        user_id: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        status: SyncStatus::parse(&status).ok_or_else(|| bad_value(4, "sync status", &status))?,
        error_message: row.get(5)?,
    })
}

fn link_from_row(row: &Row) -> rusqlite::Result<Link> {
    let status: String = row.get(4)?;
    let accounts: String = row.get(5)?;
    Ok(Link {
        link_id: row.get(0)?,
        user_id: row.get(1)?,
        institution_id: row.get(2)?,
        reference: row.get(3)?,
        status: LinkStatus::parse(&status).ok_or_else(|| bad_value(4, "link status", &status))?,
        accounts: serde_json::from_str(&accounts).map_err(|_| bad_value(5, "account list", &accounts))?,
        redirect_url: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl Storage for SqliteStore {
    async fn upsert_accounts(
        &self,
        user_id: &str,
        accounts: &[AccountSnapshot],
        at: DateTime<Utc>,
    ) -> Result<AccountUpsert> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        let mut out = Vec::with_capacity(accounts.len());
        for snap in accounts {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT user_id FROM accounts WHERE external_account_id = ?1",
                    [&snap.external_account_id],
                    |r| r.get(0),
                )
                .optional()?;
            if owner.as_deref().is_some_and(|o| o != user_id) {
                return Err(BankError::StorageConflict(format!(
                    "account {} belongs to another user",
                    snap.external_account_id
                )));
            }
            tx.execute(
                "INSERT INTO accounts (user_id, external_account_id, name, iban, currency, balance, last_updated) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(external_account_id) DO UPDATE SET \
                 name = excluded.name, iban = excluded.iban, currency = excluded.currency, \
                 balance = excluded.balance, last_updated = excluded.last_updated",
                params![user_id, snap.external_account_id, snap.name, snap.iban, snap.currency, snap.balance, at],
            )?;
            if owner.is_none() {
                inserted += 1;
            }
            let account = tx.query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE external_account_id = ?1"),
                [&snap.external_account_id],
                account_from_row,
            )?;
            out.push(account);
        }
        tx.commit()?;
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
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut result = TransactionUpsert::default();
        for snap in txns {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM transactions WHERE external_transaction_id = ?1",
                    [&snap.external_transaction_id],
                    |r| r.get(0),
                )
                .optional()?;
            tx.execute(
                "INSERT INTO transactions (account_id, external_transaction_id, date, amount, currency, \
                 description, creditor_name, debtor_name) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(external_transaction_id) DO UPDATE SET \
                 date = excluded.date, amount = excluded.amount, currency = excluded.currency, \
                 description = excluded.description, creditor_name = excluded.creditor_name, \
                 debtor_name = excluded.debtor_name",
                params![
                    account_id,
                    snap.external_transaction_id,
                    snap.date,
                    snap.amount,
                    snap.currency,
                    snap.description,
                    snap.creditor_name,
                    snap.debtor_name
                ],
            )?;
            match existing {
                Some(_) => result.updated += 1,
                None => result.inserted.push(tx.last_insert_rowid()),
            }
        }
        tx.commit()?;
        Ok(result)
    }

    async fn update_transaction_category(
        &self,
        txn_id: i64,
        user_id: &str,
        update: &CategoryUpdate,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current = tx
            .query_row(
                &format!(
                    "SELECT {TXN_COLS} FROM transactions t JOIN accounts a ON t.account_id = a.id \
                     WHERE t.id = ?1 AND a.user_id = ?2"
                ),
                params![txn_id, user_id],
                txn_from_row,
            )
            .optional()?
            .ok_or(BankError::UnknownTransaction(txn_id))?;
        let old_category = (!current.is_uncategorized()).then(|| current.effective_category().to_string());

        let column = match update.source {
            CategorySource::Manual => "user_category",
            CategorySource::Auto | CategorySource::Rule => "category",
        };
        let changed = tx.execute(
            &format!("UPDATE transactions SET {column} = ?1, category_source = ?2 WHERE id = ?3"),
            params![update.category, update.source.as_str(), txn_id],
        )?;
        if changed != 1 {
            return Err(BankError::StorageConflict(format!(
                "category update touched {changed} rows for transaction {txn_id}"
            )));
        }
        tx.execute(
            "INSERT INTO category_audit (transaction_id, user_id, old_category, new_category, source, reason, changed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![txn_id, user_id, old_category, update.category, update.source.as_str(), update.reason, at],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE id = ?1"),
                [account_id],
                account_from_row,
            )
            .optional()?)
    }

    async fn list_accounts(&self, user_id: &str) -> Result<Vec<Account>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {ACCOUNT_COLS} FROM accounts WHERE user_id = ?1 ORDER BY id"))?;
        let rows = stmt
            .query_map([user_id], account_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn get_transaction(&self, txn_id: i64) -> Result<Option<Transaction>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {TXN_COLS} FROM transactions t WHERE t.id = ?1"),
                [txn_id],
                txn_from_row,
            )
            .optional()?)
    }

    async fn list_transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TXN_COLS} FROM transactions t JOIN accounts a ON t.account_id = a.id \
             WHERE a.user_id = ?1 ORDER BY t.date DESC, t.id DESC"
        ))?;
        let rows = stmt
            .query_map([user_id], txn_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn category_audit(&self, txn_id: i64) -> Result<Vec<CategoryAudit>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, transaction_id, user_id, old_category, new_category, source, reason, changed_at \
             FROM category_audit WHERE transaction_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([txn_id], |row| {
                let source: String = row.get(5)?;
                Ok(CategoryAudit {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    user_id: row.get(2)?,
                    old_category: row.get(3)?,
                    new_category: row.get(4)?,
                    source: CategorySource::parse(&source).ok_or_else(|| bad_value(5, "category source", &source))?,
                    reason: row.get(6)?,
                    changed_at: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn get_categorization_rules(&self, user_id: &str) -> Result<Vec<CategorizationRule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLS} FROM rules WHERE user_id = ?1 ORDER BY priority DESC, created_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map([user_id], rule_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn add_rule(&self, user_id: &str, rule: &NewRule, at: DateTime<Utc>) -> Result<CategorizationRule> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO rules (user_id, keyword, match_type, category, priority, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_id, rule.keyword, rule.match_type.as_str(), rule.category, rule.priority, at],
        )?;
        let id = conn.last_insert_rowid();
        Ok(conn.query_row(
            &format!("SELECT {RULE_COLS} FROM rules WHERE id = ?1"),
            [id],
            rule_from_row,
        )?)
    }

    async fn delete_rule(&self, user_id: &str, rule_id: i64) -> Result<bool> {
        let n = self.conn().execute(
            "DELETE FROM rules WHERE id = ?1 AND user_id = ?2",
            params![rule_id, user_id],
        )?;
        Ok(n > 0)
    }

    async fn start_sync_log(&self, user_id: &str, at: DateTime<Utc>) -> Result<SyncLog> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_logs (user_id, started_at, status) VALUES (?1, ?2, ?3)",
            params![user_id, at, SyncStatus::InProgress.as_str()],
        )?;
        Ok(SyncLog {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            started_at: at,
            finished_at: None,
            status: SyncStatus::InProgress,
            error_message: None,
        })
    }

    async fn finish_sync_log(
        &self,
        log_id: i64,
        status: SyncStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let n = self.conn().execute(
            "UPDATE sync_logs SET status = ?1, error_message = ?2, finished_at = ?3 WHERE id = ?4",
            params![status.as_str(), error, at, log_id],
        )?;
        if n == 0 {
            return Err(BankError::Storage(format!("no sync log {log_id}")));
        }
        Ok(())
    }

    async fn get_last_sync_log(&self, user_id: &str) -> Result<Option<SyncLog>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {LOG_COLS} FROM sync_logs WHERE user_id = ?1 ORDER BY started_at DESC, id DESC LIMIT 1"),
                [user_id],
                log_from_row,
            )
            .optional()?)
    }

    async fn get_last_successful_sync(&self, user_id: &str) -> Result<Option<SyncLog>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {LOG_COLS} FROM sync_logs WHERE user_id = ?1 AND status = 'success' \
                     ORDER BY started_at DESC, id DESC LIMIT 1"
                ),
                [user_id],
                log_from_row,
            )
            .optional()?)
    }

    async fn save_link(&self, link: &Link) -> Result<()> {
        let accounts = serde_json::to_string(&link.accounts).map_err(|e| BankError::Storage(e.to_string()))?;
        let conn = self.conn();
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM links WHERE user_id = ?1 AND reference = ?2 AND link_id <> ?3)",
            params![link.user_id, link.reference, link.link_id],
            |r| r.get(0),
        )?;
        if taken {
            return Err(BankError::StorageConflict(format!(
                "reference {} already used by user {}",
                link.reference, link.user_id
            )));
        }
        conn.execute(
            "INSERT INTO links (link_id, user_id, institution_id, reference, status, accounts, redirect_url, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(link_id) DO UPDATE SET status = excluded.status, accounts = excluded.accounts, \
             redirect_url = excluded.redirect_url, updated_at = excluded.updated_at",
            params![
                link.link_id,
                link.user_id,
                link.institution_id,
                link.reference,
                link.status.as_str(),
                accounts,
                link.redirect_url,
                link.created_at,
                link.updated_at
            ],
        )?;
        Ok(())
    }

    async fn get_links(&self, user_id: &str) -> Result<Vec<Link>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LINK_COLS} FROM links WHERE user_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map([user_id], link_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn get_link(&self, link_id: &str) -> Result<Option<Link>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {LINK_COLS} FROM links WHERE link_id = ?1"),
                [link_id],
                link_from_row,
            )
            .optional()?)
    }

    async fn find_link_by_reference(&self, user_id: &str, reference: &str) -> Result<Option<Link>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {LINK_COLS} FROM links WHERE user_id = ?1 AND reference = ?2"),
                [user_id, reference],
                link_from_row,
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn test_db() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn acc(ext: &str, balance: f64) -> AccountSnapshot {
        AccountSnapshot {
            external_account_id: ext.to_string(),
            name: "Lønkonto".to_string(),
            iban: None,
            currency: "DKK".to_string(),
            balance,
        }
    }

    fn tx(ext: &str, description: &str) -> TransactionSnapshot {
        TransactionSnapshot {
            external_transaction_id: ext.to_string(),
            date: NaiveDate::from_ymd_opt(2026, 2, 20).unwrap(),
            amount: -49.0,
            currency: "DKK".to_string(),
            description: description.to_string(),
            creditor_name: Some("Netto".to_string()),
            debtor_name: None,
        }
    }

    #[test]
    fn test_schema_is_idempotent() {
        let (_dir, store) = test_db();
        store.conn().execute_batch(SCHEMA).unwrap();
    }

    #[tokio::test]
    async fn test_account_synced_twice_keeps_one_row_with_latest_balance() {
        let (_dir, store) = test_db();
        store.upsert_accounts("u1", &[acc("abc", 100.0)], at()).await.unwrap();
        let second = store.upsert_accounts("u1", &[acc("abc", 80.5)], at()).await.unwrap();
        assert_eq!(second.inserted, 0);
        let all = store.list_accounts("u1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].balance, 80.5);
        assert_eq!(all[0].last_updated, at());
    }

    #[tokio::test]
    async fn test_transaction_upsert_preserves_categories() {
        let (_dir, store) = test_db();
        let a = store.upsert_accounts("u1", &[acc("abc", 0.0)], at()).await.unwrap().accounts[0].id;
        let first = store.upsert_transactions(a, &[tx("t1", "NETTO 1")]).await.unwrap();
        let id = first.inserted[0];
        let update = CategoryUpdate {
            category: "Groceries".to_string(),
            source: CategorySource::Auto,
            reason: "sync".to_string(),
        };
        store.update_transaction_category(id, "u1", &update, at()).await.unwrap();

        let again = store.upsert_transactions(a, &[tx("t1", "NETTO 1 (corrected)")]).await.unwrap();
        assert!(again.inserted.is_empty());
        assert_eq!(again.updated, 1);

        let t = store.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(t.description, "NETTO 1 (corrected)");
        assert_eq!(t.category.as_deref(), Some("Groceries"));
        assert_eq!(t.creditor_name.as_deref(), Some("Netto"));
        assert_eq!(store.category_audit(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_category_update_for_wrong_user_is_rejected() {
        let (_dir, store) = test_db();
        let a = store.upsert_accounts("u1", &[acc("abc", 0.0)], at()).await.unwrap().accounts[0].id;
        let id = store.upsert_transactions(a, &[tx("t1", "x")]).await.unwrap().inserted[0];
        let update = CategoryUpdate {
            category: "Dining".to_string(),
            source: CategorySource::Manual,
            reason: "user edit".to_string(),
        };
        let err = store.update_transaction_category(id, "u2", &update, at()).await;
        assert!(matches!(err, Err(BankError::UnknownTransaction(_))));
        assert!(store.category_audit(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rules_ordered_by_priority_then_age() {
        let (_dir, store) = test_db();
        let rule = |kw: &str, p: i64| NewRule {
            keyword: kw.to_string(),
            match_type: MatchType::EndsWith,
            category: "C".to_string(),
            priority: p,
        };
        store.add_rule("u1", &rule("a", 1), at()).await.unwrap();
        store.add_rule("u1", &rule("b", 5), at() + chrono::Duration::seconds(1)).await.unwrap();
        store.add_rule("u1", &rule("c", 5), at() + chrono::Duration::seconds(2)).await.unwrap();
        let kws: Vec<String> = store
            .get_categorization_rules("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.keyword)
            .collect();
        assert_eq!(kws, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_links_roundtrip_and_reference_lookup() {
        let (_dir, store) = test_db();
        let mut link = Link {
            link_id: "req-1".to_string(),
            user_id: "u1".to_string(),
            institution_id: "NORDEA_NDEADKKK".to_string(),
            reference: "link-42".to_string(),
            status: LinkStatus::AwaitingAuthentication,
            accounts: vec![],
            redirect_url: "https://bank/auth".to_string(),
            created_at: at(),
            updated_at: at(),
        };
        store.save_link(&link).await.unwrap();
        link.status = LinkStatus::Linked;
        link.accounts = vec!["acc-1".to_string(), "acc-2".to_string()];
        store.save_link(&link).await.unwrap();

        let found = store.find_link_by_reference("u1", "link-42").await.unwrap().unwrap();
        assert_eq!(found, link);
        assert_eq!(store.get_link("req-1").await.unwrap(), Some(link.clone()));
        assert_eq!(store.get_links("u1").await.unwrap().len(), 1);
        assert!(store.find_link_by_reference("u2", "link-42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reference_unique_per_user_only() {
        let (_dir, store) = test_db();
        let link = |id: &str, user: &str| Link {
            link_id: id.to_string(),
            user_id: user.to_string(),
            institution_id: "NORDEA_NDEADKKK".to_string(),
            reference: "shared-ref".to_string(),
            status: LinkStatus::AwaitingAuthentication,
            accounts: vec![],
            redirect_url: format!("https://bank/auth/{id}"),
            created_at: at(),
            updated_at: at(),
        };
        store.save_link(&link("req-1", "alice")).await.unwrap();
        store.save_link(&link("req-2", "bob")).await.unwrap();
        let err = store.save_link(&link("req-3", "alice")).await.unwrap_err();
        assert!(matches!(err, BankError::StorageConflict(_)));
        let bob = store.find_link_by_reference("bob", "shared-ref").await.unwrap().unwrap();
        assert_eq!(bob.link_id, "req-2");
    }

    #[tokio::test]
    async fn test_account_of_another_user_is_not_taken_over() {
        let (_dir, store) = test_db();
        store.upsert_accounts("u1", &[acc("abc", 100.0)], at()).await.unwrap();
        let err = store.upsert_accounts("u2", &[acc("abc", 5.0)], at()).await.unwrap_err();
        assert!(matches!(err, BankError::StorageConflict(_)));
        assert_eq!(store.list_accounts("u1").await.unwrap()[0].balance, 100.0);
        assert!(store.list_accounts("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_last_successful_sync_skips_errors() {
        let (_dir, store) = test_db();
        let ok = store.start_sync_log("u1", at()).await.unwrap();
        store.finish_sync_log(ok.id, SyncStatus::Success, None, at()).await.unwrap();
        let later = at() + chrono::Duration::hours(1);
        let bad = store.start_sync_log("u1", later).await.unwrap();
        store.finish_sync_log(bad.id, SyncStatus::Error, Some("boom"), later).await.unwrap();

        assert_eq!(store.get_last_sync_log("u1").await.unwrap().unwrap().status, SyncStatus::Error);
        assert_eq!(store.get_last_successful_sync("u1").await.unwrap().unwrap().id, ok.id);
    }
}
