use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tally_bank::ClientSecrets;

use crate::state::ensure_tally_home;

/// Aggregator application secrets, shared by every user of this install
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AuthState {
    pub secret_id: Option<String>,
    pub secret_key: Option<String>,
}

fn auth_path() -> Result<PathBuf> {
    Ok(ensure_tally_home()?.join("auth.json"))
}

pub fn load_auth_from(p: &Path) -> Result<AuthState> {
    if !p.exists() {
        return Ok(AuthState::default());
    }
    let s = fs::read_to_string(p).with_context(|| format!("read {}", p.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse {}", p.display()))
}

pub fn save_auth_to(auth: &AuthState, p: &Path) -> Result<()> {
    let s = serde_json::to_string_pretty(auth)?;
    fs::write(p, s).with_context(|| format!("write {}", p.display()))?;
    Ok(())
}

/// `TALLY_SECRET_ID`/`TALLY_SECRET_KEY` win over the file, field by field.
pub fn resolve_secrets(file: AuthState, env_id: Option<String>, env_key: Option<String>) -> Result<ClientSecrets> {
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    let secret_id = non_empty(env_id).or(non_empty(file.secret_id));
    let secret_key = non_empty(env_key).or(non_empty(file.secret_key));
    match (secret_id, secret_key) {
        (Some(secret_id), Some(secret_key)) => Ok(ClientSecrets { secret_id, secret_key }),
        _ => bail!("aggregator secrets missing. Run: tally auth paste-secrets (or set TALLY_SECRET_ID and TALLY_SECRET_KEY)"),
    }
}

pub fn load_secrets() -> Result<ClientSecrets> {
    resolve_secrets(
        load_auth_from(&auth_path()?)?,
        std::env::var("TALLY_SECRET_ID").ok(),
        std::env::var("TALLY_SECRET_KEY").ok(),
    )
}

fn prompt_secret(label: &str) -> Result<String> {
    print!("{label}: ");
    io::stdout().flush().ok();
    let mut s = String::new();
    io::stdin().read_line(&mut s)?;
    Ok(s.trim().to_string())
}

pub fn paste_secrets() -> Result<()> {
    let p = auth_path()?;
    let mut auth = load_auth_from(&p)?;
    let id = prompt_secret("Paste aggregator secret id")?;
    let key = prompt_secret("Paste aggregator secret key")?;
    if id.is_empty() || key.is_empty() {
        bail!("secret id and key must both be non-empty");
    }
    auth.secret_id = Some(id);
    auth.secret_key = Some(key);
    save_auth_to(&auth, &p)?;
    println!("Saved aggregator secrets to {}", p.display());
    Ok(())
}
