//! App-facing surface over the link machine, reconciler and resolver.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tally_core::{
    CategorizationRule, CategorySource, Link, MatchType, NewRule, Resolution, RuleSet, SyncStatus, Transaction,
};
use tracing::info;

use crate::clock::Clock;
use crate::error::{BankError, Result};
use crate::gateway::{Aggregator, Institution};
use crate::institutions::InstitutionMap;
use crate::link::{LinkMachine, LinkSettings, LinkStart, ResumeOutcome};
use crate::reconcile::{Reconciler, SyncSettings, SyncSummary};
use crate::store::{CategoryUpdate, Storage};

#[derive(Debug, Clone)]
pub struct BankSyncConfig {
    pub sync: SyncSettings,
    pub link: LinkSettings,
    pub institutions: InstitutionMap,
    /// A user needs a sync once the last success is at least this old
    pub stale_after: Duration,
}

impl Default for BankSyncConfig {
    fn default() -> Self {
        Self {
            sync: SyncSettings::default(),
            link: LinkSettings::default(),
            institutions: InstitutionMap::default(),
            stale_after: Duration::hours(6),
        }
    }
}

/// What the UI shows about the last sync
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusView {
    pub last_sync: Option<DateTime<Utc>>,
    pub status: Option<SyncStatus>,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub needs_sync: bool,
}

pub struct BankSync {
    aggregator: Arc<dyn Aggregator>,
    store: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    reconciler: Arc<Reconciler>,
    links: LinkMachine,
    stale_after: Duration,
}

impl BankSync {
    pub fn new(
        aggregator: Arc<dyn Aggregator>,
        store: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        config: BankSyncConfig,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            aggregator.clone(),
            store.clone(),
            clock.clone(),
            config.sync,
        ));
        let links = LinkMachine::new(
            aggregator.clone(),
            store.clone(),
            reconciler.clone(),
            config.institutions,
            clock.clone(),
            config.link,
        );
        Self {
            aggregator,
            store,
            clock,
            reconciler,
            links,
            stale_after: config.stale_after,
        }
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub async fn start_link(&self, user_id: &str, institution: &str, reference: Option<&str>) -> Result<LinkStart> {
        self.links.start(user_id, institution, reference).await
    }

    /// The host's "user is back from the bank" event
    pub async fn on_app_foreground_after_link(&self, user_id: &str) -> Result<ResumeOutcome> {
        self.links.resume(user_id).await
    }

    /// Refresh pending links, then sync. Running it against a link with no
    /// new accounts is a no-op.
    pub async fn sync(&self, user_id: &str) -> Result<SyncSummary> {
        self.links.refresh(user_id).await?;
        self.reconciler.sync(user_id).await
    }

    pub async fn get_sync_status(&self, user_id: &str) -> Result<SyncStatusView> {
        let last = self.store.get_last_sync_log(user_id).await?;
        let success = self.store.get_last_successful_sync(user_id).await?;
        let now = self.clock.now();
        let needs_sync = match &success {
            Some(log) => now - log.started_at >= self.stale_after,
            None => true,
        };
        Ok(SyncStatusView {
            last_sync: last.as_ref().map(|l| l.started_at),
            status: last.as_ref().map(|l| l.status),
            last_error: last.and_then(|l| l.error_message),
            last_success: success.map(|l| l.finished_at.unwrap_or(l.started_at)),
            needs_sync,
        })
    }

    async fn owned_transaction(&self, user_id: &str, txn_id: i64) -> Result<Transaction> {
        let txn = self
            .store
            .get_transaction(txn_id)
            .await?
            .ok_or(BankError::UnknownTransaction(txn_id))?;
        let owner = self.store.get_account(txn.account_id).await?;
        if owner.is_none_or(|a| a.user_id != user_id) {
            return Err(BankError::UnknownTransaction(txn_id));
        }
        Ok(txn)
    }

    /// Re-run the resolver on one transaction without writing anything
    pub async fn resolve_category(&self, user_id: &str, txn_id: i64) -> Result<Resolution> {
        let txn = self.owned_transaction(user_id, txn_id).await?;
        let rules = RuleSet::new(self.store.get_categorization_rules(user_id).await?);
        Ok(rules.resolve(&txn))
    }

    /// Manual override; survives every later sync
    pub async fn set_user_category(&self, user_id: &str, txn_id: i64, category: &str) -> Result<()> {
        let category = category.trim();
        if category.is_empty() {
            return Err(BankError::InvalidInput("category must not be empty".to_string()));
        }
        self.store
            .update_transaction_category(
                txn_id,
                user_id,
                &CategoryUpdate {
                    category: category.to_string(),
                    source: CategorySource::Manual,
                    reason: "user edit".to_string(),
                },
                self.clock.now(),
            )
            .await
    }

    /// Apply the resolver to transactions with no category at all. Returns
    /// how many got one.
    pub async fn recategorize_uncategorized(&self, user_id: &str) -> Result<usize> {
        let rules = RuleSet::new(self.store.get_categorization_rules(user_id).await?);
        let mut changed = 0;
        for txn in self.store.list_transactions(user_id).await? {
            if !txn.is_uncategorized() {
                continue;
            }
            let resolution = rules.resolve(&txn);
            if resolution.is_uncategorized() {
                continue;
            }
            let update = CategoryUpdate {
                category: resolution.category,
                source: resolution.source,
                reason: "backfill".to_string(),
            };
            self.store
                .update_transaction_category(txn.id, user_id, &update, self.clock.now())
                .await?;
            changed += 1;
        }
        info!(user = user_id, changed, "backfilled categories");
        Ok(changed)
    }

    pub async fn add_rule(&self, user_id: &str, rule: &NewRule) -> Result<CategorizationRule> {
        if rule.keyword.trim().is_empty() {
            return Err(BankError::InvalidInput("rule keyword must not be empty".to_string()));
        }
        if rule.match_type == MatchType::Regex {
            regex::Regex::new(&rule.keyword)
                .map_err(|e| BankError::InvalidInput(format!("bad pattern {:?}: {e}", rule.keyword)))?;
        }
        self.store.add_rule(user_id, rule, self.clock.now()).await
    }

    pub async fn rules(&self, user_id: &str) -> Result<Vec<CategorizationRule>> {
        self.store.get_categorization_rules(user_id).await
    }

    pub async fn delete_rule(&self, user_id: &str, rule_id: i64) -> Result<bool> {
        self.store.delete_rule(user_id, rule_id).await
    }

    pub async fn find_link_by_reference(&self, user_id: &str, reference: &str) -> Result<Option<Link>> {
        self.links.find_by_reference(user_id, reference).await
    }

    pub async fn list_institutions(&self, country: &str) -> Result<Vec<Institution>> {
        self.aggregator.list_institutions(country).await
    }

    pub fn institution_map(&self) -> &InstitutionMap {
        self.links.institutions()
    }

    pub async fn links(&self, user_id: &str) -> Result<Vec<Link>> {
        self.store.get_links(user_id).await
    }

    pub async fn transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
        self.store.list_transactions(user_id).await
    }
}
