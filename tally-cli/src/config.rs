use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tally_bank::{BackoffPolicy, BankSyncConfig, InstitutionMap, LinkSettings, ResumePolicy, SyncSettings};
use tally_core::parse_tz;

use crate::state::ensure_tally_home;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub aggregator: AggregatorSection,
    pub sync: SyncSection,
    pub log: LogSection,
    /// Internal key → aggregator institution id, e.g. `nordea = "NORDEA_NDEADKKK"`
    pub institutions: InstitutionMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorSection {
    pub base_url: String,
    /// Where the bank sends the user back to after authentication
    pub redirect_url: String,
    pub language: String,
    /// Fixed lifetime given to every access token, shorter than the aggregator's
    pub token_validity_secs: u64,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for AggregatorSection {
    fn default() -> Self {
        Self {
            base_url: tally_bank::http::DEFAULT_BASE_URL.to_string(),
            redirect_url: "tally://bank-return".to_string(),
            language: "EN".to_string(),
            token_validity_secs: 20 * 60 * 60,
            request_timeout_secs: 30,
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSection {
    pub lookback_days: u32,
    pub stale_after_hours: u32,
    pub first_delay_secs: u64,
    pub retry_delay_secs: u64,
    pub timezone: String,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            lookback_days: 90,
            stale_after_hours: 6,
            first_delay_secs: 3,
            retry_delay_secs: 10,
            timezone: "Europe/Copenhagen".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.aggregator.max_attempts,
            Duration::from_millis(self.aggregator.base_delay_ms),
        )
    }

    /// Lifetime stamped on every issued or refreshed token. Always positive.
    pub fn token_validity(&self) -> Result<chrono::Duration> {
        i64::try_from(self.aggregator.token_validity_secs)
            .ok()
            .filter(|s| *s > 0)
            .and_then(chrono::Duration::try_seconds)
            .with_context(|| {
                format!(
                    "aggregator.token_validity_secs must be a positive number of seconds, got {}",
                    self.aggregator.token_validity_secs
                )
            })
    }

    pub fn validate(&self) -> Result<()> {
        self.token_validity()?;
        if self.aggregator.max_attempts == 0 {
            bail!("aggregator.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.aggregator.request_timeout_secs)
    }

    pub fn bank_config(&self) -> Result<BankSyncConfig> {
        Ok(BankSyncConfig {
            sync: SyncSettings {
                lookback_days: self.sync.lookback_days,
                timezone: parse_tz(&self.sync.timezone)?,
            },
            link: LinkSettings {
                redirect_url: self.aggregator.redirect_url.clone(),
                language: self.aggregator.language.clone(),
                policy: ResumePolicy {
                    first_delay: Duration::from_secs(self.sync.first_delay_secs),
                    retry_delay: Duration::from_secs(self.sync.retry_delay_secs),
                },
            },
            institutions: self.institutions.clone(),
            stale_after: chrono::Duration::hours(self.sync.stale_after_hours.into()),
        })
    }
}

pub fn config_path() -> Result<PathBuf> {
    Ok(ensure_tally_home()?.join("config.toml"))
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(p: &Path) -> Result<Config> {
    if !p.exists() {
        return Ok(Config::default());
    }
    let s = fs::read_to_string(p).with_context(|| format!("read {}", p.display()))?;
    let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", p.display()))?;
    cfg.validate().with_context(|| format!("invalid {}", p.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, p: &Path) -> Result<()> {
    let s = toml::to_string_pretty(cfg).context("serialize config")?;
    fs::write(p, s).with_context(|| format!("write {}", p.display()))?;
    Ok(())
}

pub fn init_config() -> Result<()> {
    let p = config_path()?;
    if p.exists() {
        println!("Config already exists: {}", p.display());
        return Ok(());
    }
    let mut cfg = Config::default();
    cfg.institutions.insert("nordea", "NORDEA_NDEADKKK");
    cfg.institutions.insert("danske", "DANSKEBANK_DABADKKK");
    save_config(&cfg, &p)?;
    println!("Wrote {}", p.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [sync]
            lookback_days = 30

            [institutions]
            lunar = "LUNAR_LUNADK22"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sync.lookback_days, 30);
        assert_eq!(cfg.sync.stale_after_hours, 6);
        assert_eq!(cfg.aggregator.max_attempts, 3);
        assert_eq!(cfg.institutions.resolve("lunar").unwrap(), "LUNAR_LUNADK22");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.log.json = true;
        cfg.institutions.insert("nordea", "NORDEA_NDEADKKK");
        save_config(&cfg, &p).unwrap();
        assert_eq!(load_config_from(&p).unwrap(), cfg);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_config_from(&dir.path().join("nope.toml")).unwrap(), Config::default());
    }

    #[test]
    fn test_bank_config_rejects_bad_timezone() {
        let mut cfg = Config::default();
        cfg.sync.timezone = "Europe/Atlantis".to_string();
        assert!(cfg.bank_config().is_err());
    }

    #[test]
    fn test_zero_token_validity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("config.toml");
        fs::write(&p, "[aggregator]\ntoken_validity_secs = 0\n").unwrap();
        let err = load_config_from(&p).unwrap_err();
        assert!(format!("{err:#}").contains("token_validity_secs"));

        let mut cfg = Config::default();
        cfg.aggregator.token_validity_secs = 0;
        assert!(cfg.token_validity().is_err());
        cfg.aggregator.token_validity_secs = 60;
        assert_eq!(cfg.token_validity().unwrap(), chrono::Duration::seconds(60));
    }

    #[test]
    fn test_bank_config_carries_delays() {
        let bank = Config::default().bank_config().unwrap();
        assert_eq!(bank.link.policy.first_delay, Duration::from_secs(3));
        assert_eq!(bank.link.policy.retry_delay, Duration::from_secs(10));
        assert_eq!(bank.stale_after, chrono::Duration::hours(6));
    }
}
