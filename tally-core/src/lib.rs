//! tally-core: entity types, the built-in category table and category resolution

pub mod categories;
pub mod model;
pub mod resolver;
pub mod time;

pub use categories::{DefaultCategory, detect};
pub use model::{
    Account, AccountSnapshot, CategorizationRule, CategoryAudit, CategorySource, Link, LinkStatus,
    MatchType, NewRule, SyncLog, SyncStatus, Transaction, TransactionSnapshot, UNCATEGORIZED,
    rule_order,
};
pub use resolver::{Resolution, RuleSet, resolve};
pub use time::{DateWindow, local_date, parse_tz, sync_window};
