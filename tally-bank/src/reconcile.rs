//! Merges aggregator accounts and transactions into storage.
//!
//! Each account is fetched and merged on its own; one account failing is
//! recorded in the summary and the rest carry on. `AuthFailure` aborts the run.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tally_core::{
    local_date, sync_window, Account, AccountSnapshot, DateWindow, LinkStatus, RuleSet, SyncStatus,
};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{BankError, Result};
use crate::gateway::{pick_balance, Aggregator};
use crate::store::{CategoryUpdate, Storage};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// First-sync window when the user has never synced successfully
    pub lookback_days: u32,
    /// Zone used to decide what "today" is for booking dates
    pub timezone: Tz,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lookback_days: 90,
            timezone: chrono_tz::Europe::Copenhagen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountError {
    pub external_account_id: String,
    pub message: String,
}

/// What one `sync` changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    pub accounts_seen: usize,
    pub new_accounts: usize,
    pub new_transactions: usize,
    pub updated_transactions: usize,
    /// New transactions that resolved to something other than "Uncategorized"
    pub categorized: usize,
    pub errors: Vec<AccountError>,
}

impl SyncSummary {
    pub fn has_new_data(&self) -> bool {
        self.new_transactions > 0
    }

    /// True when there were accounts and none of them synced
    pub fn all_failed(&self) -> bool {
        self.accounts_seen > 0 && self.errors.len() >= self.accounts_seen
    }
}

#[derive(Debug, Default)]
struct AccountOutcome {
    new_account: bool,
    inserted: usize,
    updated: usize,
    categorized: usize,
}

pub struct Reconciler {
    aggregator: Arc<dyn Aggregator>,
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    history_days: tokio::sync::Mutex<HashMap<String, Option<u32>>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowPlan {
    today: NaiveDate,
    since: Option<NaiveDate>,
    history_days: Option<u32>,
}

impl WindowPlan {
    fn window(&self, new_account: bool, lookback_days: u32) -> DateWindow {
        let since = if new_account { None } else { self.since };
        sync_window(self.today, since, lookback_days, self.history_days)
    }
}

impl Reconciler {
    pub fn new(
        aggregator: Arc<dyn Aggregator>,
        store: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            aggregator,
            store,
            clock,
            settings,
            history_days: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Sync every account of the user's linked banks.
    ///
    /// The sync log goes `in_progress` → `success` unless every account failed
    /// or the run aborted, in which case it ends `error`.
    pub async fn sync(&self, user_id: &str) -> Result<SyncSummary> {
        // Read before the new log exists so the window starts at the previous success.
        let last_success = self.store.get_last_successful_sync(user_id).await?;
        let log = self.store.start_sync_log(user_id, self.clock.now()).await?;
        info!(user = user_id, log_id = log.id, "sync started");

        match self.run(user_id, last_success.map(|l| l.started_at)).await {
            Ok(summary) => {
                let (status, message) = if summary.all_failed() {
                    let joined = summary
                        .errors
                        .iter()
                        .map(|e| format!("{}: {}", e.external_account_id, e.message))
                        .collect::<Vec<_>>()
                        .join("; ");
                    (SyncStatus::Error, Some(joined))
                } else {
                    (SyncStatus::Success, None)
                };
                self.store
                    .finish_sync_log(log.id, status, message.as_deref(), self.clock.now())
                    .await?;
                info!(
                    user = user_id,
                    status = status.as_str(),
                    accounts = summary.accounts_seen,
                    new_accounts = summary.new_accounts,
                    new_transactions = summary.new_transactions,
                    failed_accounts = summary.errors.len(),
                    "sync finished"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(user = user_id, error = %e, "sync aborted");
                self.store
                    .finish_sync_log(log.id, SyncStatus::Error, Some(&e.to_string()), self.clock.now())
                    .await?;
                Err(e)
            }
        }
    }

    async fn run(&self, user_id: &str, last_success: Option<DateTime<Utc>>) -> Result<SyncSummary> {
        let mut targets: Vec<(String, String)> = Vec::new();
        for link in self.store.get_links(user_id).await? {
            if link.status != LinkStatus::Linked {
                continue;
            }
            for account in link.accounts {
                if !targets.iter().any(|(_, a)| *a == account) {
                    targets.push((link.institution_id.clone(), account));
                }
            }
        }

        let today = local_date(self.clock.now(), self.settings.timezone);
        let since = last_success.map(|t| local_date(t, self.settings.timezone));
        let rules = RuleSet::new(self.store.get_categorization_rules(user_id).await?);

        let mut summary = SyncSummary {
            accounts_seen: targets.len(),
            ..SyncSummary::default()
        };
        for (institution_id, external_id) in &targets {
            let plan = WindowPlan {
                today,
                since,
                history_days: self.history_days(institution_id).await,
            };
            match self.sync_account(user_id, external_id, plan, &rules).await {
                Ok(outcome) => {
                    summary.new_accounts += usize::from(outcome.new_account);
                    summary.new_transactions += outcome.inserted;
                    summary.updated_transactions += outcome.updated;
                    summary.categorized += outcome.categorized;
                }
                Err(e @ BankError::AuthFailure(_)) => return Err(e),
                Err(e) => {
                    warn!(user = user_id, account = %external_id, error = %e, "account sync failed");
                    summary.errors.push(AccountError {
                        external_account_id: external_id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(summary)
    }

    async fn sync_account(
        &self,
        user_id: &str,
        external_id: &str,
        plan: WindowPlan,
        rules: &RuleSet,
    ) -> Result<AccountOutcome> {
        let details = self.aggregator.get_account_details(external_id).await?;
        let balances = self.aggregator.get_account_balances(external_id).await?;
        let balance = pick_balance(&balances);

        let snapshot = AccountSnapshot {
            external_account_id: external_id.to_string(),
            name: details
                .name
                .or(details.owner_name)
                .unwrap_or_else(|| external_id.to_string()),
            iban: details.iban,
            currency: details
                .currency
                .or_else(|| balance.map(|b| b.currency.clone()))
                .unwrap_or_else(|| "EUR".to_string()),
            balance: balance.map(|b| b.amount).unwrap_or(0.0),
        };
        let upsert = self
            .store
            .upsert_accounts(user_id, std::slice::from_ref(&snapshot), self.clock.now())
            .await?;
        let account: &Account = upsert
            .accounts
            .first()
            .ok_or_else(|| BankError::Storage(format!("account {external_id} missing after upsert")))?;

        // An account seen for the first time gets the full lookback even when
        // the user has synced other banks before.
        let window = plan.window(upsert.inserted > 0, self.settings.lookback_days);
        debug!(account = external_id, from = %window.from, to = %window.to, "fetching transactions");
        let fetched = self
            .aggregator
            .get_account_transactions(external_id, Some(window))
            .await?;
        let txns = self.store.upsert_transactions(account.id, &fetched).await?;

        let mut outcome = AccountOutcome {
            new_account: upsert.inserted > 0,
            inserted: txns.inserted.len(),
            updated: txns.updated,
            categorized: 0,
        };

        for txn_id in txns.inserted {
            let Some(txn) = self.store.get_transaction(txn_id).await? else {
                continue;
            };
            let resolution = rules.resolve(&txn);
            if resolution.is_uncategorized() {
                continue;
            }
            let update = CategoryUpdate {
                category: resolution.category,
                source: resolution.source,
                reason: match resolution.rule_id {
                    Some(id) => format!("sync: rule {id}"),
                    None => "sync: keyword table".to_string(),
                },
            };
            self.store
                .update_transaction_category(txn_id, user_id, &update, self.clock.now())
                .await?;
            outcome.categorized += 1;
        }
        Ok(outcome)
    }

    /// Institution history limit, looked up once per institution. Lookup
    /// failures fall back to no cap.
    async fn history_days(&self, institution_id: &str) -> Option<u32> {
        let mut cache = self.history_days.lock().await;
        if let Some(days) = cache.get(institution_id) {
            return *days;
        }
        match self.aggregator.get_institution(institution_id).await {
            Ok(inst) => {
                cache.insert(institution_id.to_string(), inst.transaction_total_days);
                inst.transaction_total_days
            }
            Err(e) => {
                warn!(institution = institution_id, error = %e, "institution lookup failed, not capping window");
                None
            }
        }
    }
}
