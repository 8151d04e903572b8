//! Entity types shared by the link, sync and categorization layers

use chrono::{DateTime, NaiveDate, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Category shown for a transaction nothing could classify.
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Where a transaction's category came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum CategorySource {
    #[serde(rename = "auto")]
    #[default]
    Auto,
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "rule")]
    Rule,
}

impl CategorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategorySource::Auto => "auto",
            CategorySource::Manual => "manual",
            CategorySource::Rule => "rule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(CategorySource::Auto),
            "manual" => Some(CategorySource::Manual),
            "rule" => Some(CategorySource::Rule),
            _ => None,
        }
    }
}

/// A bank account as stored locally, keyed upstream by `external_account_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: i64,
    pub user_id: String,
    /// Aggregator account id, the upsert conflict key
    pub external_account_id: String,
    pub name: String,
    pub iban: Option<String>,
    pub currency: String,
    pub balance: f64,
    pub last_updated: DateTime<Utc>,
}

/// Account fields as fetched from the aggregator, before they have a local id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    pub external_account_id: String,
    pub name: String,
    pub iban: Option<String>,
    pub currency: String,
    pub balance: f64,
}

/// A booked transaction as stored locally
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub account_id: i64,
    /// Aggregator transaction id, the only deduplication key
    pub external_transaction_id: String,
    pub date: NaiveDate,
    /// Positive = income, negative = expense
    pub amount: f64,
    pub currency: String,
    pub description: String,
    pub creditor_name: Option<String>,
    pub debtor_name: Option<String>,
    /// Set once by automatic categorization
    pub category: Option<String>,
    /// Manual override, always wins
    pub user_category: Option<String>,
    pub category_source: CategorySource,
}

impl Transaction {
    /// `user_category ?? category ?? "Uncategorized"`
    pub fn effective_category(&self) -> &str {
        self.user_category
            .as_deref()
            .or(self.category.as_deref())
            .unwrap_or(UNCATEGORIZED)
    }

    pub fn is_uncategorized(&self) -> bool {
        self.user_category.is_none() && self.category.is_none()
    }

    pub fn is_expense(&self) -> bool {
        self.amount < 0.0
    }
}

/// Transaction fields as fetched from the aggregator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionSnapshot {
    pub external_transaction_id: String,
    pub date: NaiveDate,
    pub amount: f64,
    pub currency: String,
    pub description: String,
    pub creditor_name: Option<String>,
    pub debtor_name: Option<String>,
}

/// How a rule keyword is compared against a description (case-insensitive)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Contains,
    StartsWith,
    EndsWith,
    Exact,
    Regex,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Contains => "contains",
            MatchType::StartsWith => "starts_with",
            MatchType::EndsWith => "ends_with",
            MatchType::Exact => "exact",
            MatchType::Regex => "regex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contains" => Some(MatchType::Contains),
            "starts_with" => Some(MatchType::StartsWith),
            "ends_with" => Some(MatchType::EndsWith),
            "exact" => Some(MatchType::Exact),
            "regex" => Some(MatchType::Regex),
            _ => None,
        }
    }

    /// Test `keyword` against `text`. An invalid regex never matches.
    pub fn matches(&self, text: &str, keyword: &str) -> bool {
        if keyword.trim().is_empty() {
            return false;
        }
        let text_upper = text.trim().to_uppercase();
        let kw_upper = keyword.trim().to_uppercase();
        match self {
            MatchType::Contains => text_upper.contains(&kw_upper),
            MatchType::StartsWith => text_upper.starts_with(&kw_upper),
            MatchType::EndsWith => text_upper.ends_with(&kw_upper),
            MatchType::Exact => text_upper == kw_upper,
            MatchType::Regex => RegexBuilder::new(keyword)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(text))
                .unwrap_or(false),
        }
    }
}

/// A user-owned categorization rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorizationRule {
    pub id: i64,
    pub user_id: String,
    pub keyword: String,
    pub match_type: MatchType,
    pub category: String,
    /// Higher runs first
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

impl CategorizationRule {
    pub fn matches(&self, description: &str) -> bool {
        self.match_type.matches(description, &self.keyword)
    }
}

/// Evaluation order: priority desc, then creation time asc, then id asc.
pub fn rule_order(a: &CategorizationRule, b: &CategorizationRule) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Input for creating a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRule {
    pub keyword: String,
    pub match_type: MatchType,
    pub category: String,
    pub priority: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(SyncStatus::InProgress),
            "success" => Some(SyncStatus::Success),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// One record per sync attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncLog {
    pub id: i64,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub error_message: Option<String>,
}

/// Local view of an aggregator requisition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Created,
    AwaitingAuthentication,
    Linked,
    Expired,
    Error,
}

impl LinkStatus {
    /// Terminal links are kept for audit and never retried automatically
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkStatus::Expired | LinkStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Created => "created",
            LinkStatus::AwaitingAuthentication => "awaiting_authentication",
            LinkStatus::Linked => "linked",
            LinkStatus::Expired => "expired",
            LinkStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(LinkStatus::Created),
            "awaiting_authentication" => Some(LinkStatus::AwaitingAuthentication),
            "linked" => Some(LinkStatus::Linked),
            "expired" => Some(LinkStatus::Expired),
            "error" => Some(LinkStatus::Error),
            _ => None,
        }
    }
}

/// A single authorization session between one user and one institution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Link {
    pub link_id: String,
    pub user_id: String,
    pub institution_id: String,
    /// Caller-chosen idempotent reference; survives app restarts
    pub reference: String,
    pub status: LinkStatus,
    /// Aggregator account ids, populated once linked
    pub accounts: Vec<String>,
    pub redirect_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Audit row appended by every category update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryAudit {
    pub id: i64,
    pub transaction_id: i64,
    pub user_id: String,
    pub old_category: Option<String>,
    pub new_category: String,
    pub source: CategorySource,
    pub reason: String,
    pub changed_at: DateTime<Utc>,
}
