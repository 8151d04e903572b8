use thiserror::Error;

use crate::backoff::Retryable;

#[derive(Error, Debug)]
pub enum BankError {
    /// Token issue and refresh both failed. Surfaced as "reconnect your bank".
    #[error("Aggregator authentication failed: {0}")]
    AuthFailure(String),

    /// 401/403 from a data endpoint. Terminal for the call, never re-authed mid-call.
    #[error("Aggregator rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("Aggregator rate limit hit")]
    RateLimited,

    #[error("Aggregator error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Bank link expired: {0}")]
    LinkExpired(String),

    #[error("Bank link failed: {0}")]
    LinkError(String),

    #[error("Unknown link: {0}")]
    UnknownLink(String),

    #[error("Unknown institution: {0}")]
    UnknownInstitution(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(i64),

    /// An ownership or uniqueness rule of the store would be broken
    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Could not decode aggregator response: {0}")]
    Decode(String),

    #[error("Credential store error: {0}")]
    CredentialStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BankError {
    /// Errors the user can only fix by reconnecting the bank
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            BankError::AuthFailure(_)
                | BankError::Unauthorized { .. }
                | BankError::LinkExpired(_)
                | BankError::LinkError(_)
        )
    }
}

impl Retryable for BankError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, BankError::RateLimited)
    }
}

pub type Result<T> = std::result::Result<T, BankError>;
