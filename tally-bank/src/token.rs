//! Aggregator credential lifecycle: cache, expiry tracking, refresh, re-issue.
//!
//! The credential pair is an installation-wide secret shared by every user.
//! At most one process is expected to manage it; nothing here locks the
//! backing file, and a second concurrent writer can break the refresh flow.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{BankError, Result};

/// Access + refresh token with the locally computed expiry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Always issue time + configured validity window
    pub expires_at: DateTime<Utc>,
}

impl CredentialPair {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Static application credentials used for a fresh token issue
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientSecrets {
    pub secret_id: String,
    pub secret_key: String,
}

impl fmt::Debug for ClientSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecrets")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Tokens returned by a fresh issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTokens {
    pub access: String,
    pub refresh: String,
}

/// The two token endpoints of the aggregator
#[async_trait]
pub trait TokenClient: Send + Sync {
    async fn issue(&self, secrets: &ClientSecrets) -> Result<IssuedTokens>;
    /// Returns a new access token; the refresh token stays the same
    async fn refresh(&self, refresh_token: &str) -> Result<String>;
}

/// Persistence for the single cached credential record
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing is stored. A corrupt record is an error.
    fn load(&self) -> Result<Option<CredentialPair>>;
    /// Whole-record overwrite
    fn save(&self, pair: &CredentialPair) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file, e.g. `~/.tally/token_cache.json`
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<CredentialPair>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let s = fs::read_to_string(&self.path)?;
        serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| BankError::CredentialStore(format!("parse {}: {e}", self.path.display())))
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let s = serde_json::to_string_pretty(pair)
            .map_err(|e| BankError::CredentialStore(e.to_string()))?;
        fs::write(&self.path, s)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// In-process store for tests and ephemeral hosts
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }

    pub fn snapshot(&self) -> Option<CredentialPair> {
        self.pair.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<CredentialPair>> {
        Ok(self.snapshot())
    }

    fn save(&self, pair: &CredentialPair) -> Result<()> {
        *self.pair.lock().unwrap_or_else(|p| p.into_inner()) = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.pair.lock().unwrap_or_else(|p| p.into_inner()) = None;
        Ok(())
    }
}

enum Cache {
    Unloaded,
    Empty,
    Loaded(CredentialPair),
}

/// Hands out a valid access token, refreshing or re-issuing as needed
pub struct TokenManager {
    client: Arc<dyn TokenClient>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    secrets: ClientSecrets,
    validity: Duration,
    cache: tokio::sync::Mutex<Cache>,
}

impl TokenManager {
    pub fn new(
        client: Arc<dyn TokenClient>,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        secrets: ClientSecrets,
        validity: Duration,
    ) -> Self {
        Self {
            client,
            store,
            clock,
            secrets,
            validity,
            cache: tokio::sync::Mutex::new(Cache::Unloaded),
        }
    }

    /// Current access token, valid at the moment of return.
    ///
    /// Fails with `AuthFailure` only when both refresh and fresh issue fail.
    pub async fn get_valid_token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if matches!(*cache, Cache::Unloaded) {
            *cache = self.load_from_store();
        }

        let refresh_token = match &*cache {
            Cache::Loaded(pair) if pair.is_valid_at(self.clock.now()) => {
                return Ok(pair.access_token.clone());
            }
            Cache::Loaded(pair) => Some(pair.refresh_token.clone()),
            _ => None,
        };

        if let Some(refresh_token) = refresh_token {
            match self.client.refresh(&refresh_token).await {
                Ok(access) => {
                    let pair = CredentialPair {
                        access_token: access,
                        refresh_token,
                        expires_at: self.clock.now() + self.validity,
                    };
                    self.persist(&pair);
                    debug!(expires_at = %pair.expires_at, "aggregator token refreshed");
                    let token = pair.access_token.clone();
                    *cache = Cache::Loaded(pair);
                    return Ok(token);
                }
                Err(e) => {
                    warn!(error = %e, "token refresh failed, re-issuing from client secrets");
                    *cache = Cache::Empty;
                    if let Err(e) = self.store.clear() {
                        warn!(error = %e, "could not clear credential cache");
                    }
                }
            }
        }

        let issued = self
            .client
            .issue(&self.secrets)
            .await
            .map_err(|e| BankError::AuthFailure(e.to_string()))?;
        let pair = CredentialPair {
            access_token: issued.access,
            refresh_token: issued.refresh,
            expires_at: self.clock.now() + self.validity,
        };
        self.persist(&pair);
        info!(expires_at = %pair.expires_at, "aggregator token issued");
        let token = pair.access_token.clone();
        *cache = Cache::Loaded(pair);
        Ok(token)
    }

    /// Drop cached credentials in memory and on disk
    pub async fn invalidate(&self) -> Result<()> {
        *self.cache.lock().await = Cache::Empty;
        self.store.clear()
    }

    fn load_from_store(&self) -> Cache {
        match self.store.load() {
            Ok(Some(pair)) if pair.is_valid_at(self.clock.now()) => Cache::Loaded(pair),
            Ok(Some(_)) => {
                debug!("cached aggregator token already expired, discarding");
                self.clear_quietly();
                Cache::Empty
            }
            Ok(None) => Cache::Empty,
            Err(e) => {
                warn!(error = %e, "credential cache unreadable, discarding");
                self.clear_quietly();
                Cache::Empty
            }
        }
    }

    fn clear_quietly(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "could not clear credential cache");
        }
    }

    // A failed write leaves a usable in-memory token; the next process re-issues.
    fn persist(&self, pair: &CredentialPair) {
        if let Err(e) = self.store.save(pair) {
            warn!(error = %e, "could not persist aggregator token");
        }
    }
}
