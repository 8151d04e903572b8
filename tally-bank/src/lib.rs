//! tally-bank: aggregator credentials, bank links and account/transaction sync
//!
//! Layers, leaf first: `token` and `backoff` feed `http`, which implements the
//! `gateway::Aggregator` seam. `link` and `reconcile` drive that seam against a
//! `store::Storage`; `service::BankSync` is what hosts call.

pub mod backoff;
pub mod clock;
pub mod error;
pub mod gateway;
pub mod http;
pub mod institutions;
pub mod link;
pub mod reconcile;
pub mod service;
pub mod sqlite;
pub mod store;
pub mod token;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BankError, Result};
pub use gateway::{Aggregator, Institution, RemoteLink};
pub use http::{HttpAggregator, HttpTokenClient};
pub use institutions::InstitutionMap;
pub use link::{LinkSettings, LinkStart, ResumeOutcome, ResumePolicy, ResumeStep};
pub use reconcile::{AccountError, SyncSettings, SyncSummary};
pub use service::{BankSync, BankSyncConfig, SyncStatusView};
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, Storage};
pub use token::{ClientSecrets, CredentialStore, FileCredentialStore, MemoryCredentialStore, TokenManager};
